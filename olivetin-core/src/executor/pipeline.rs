//! The execution chain
//!
//! Admission (enrollment plus the concurrency, rate and ACL gates) runs
//! under the executor's admission lock, so that two requests arriving
//! together are gated in arrival order. Everything after that runs on its
//! own task. Finalisation always runs, whether the chain completed or
//! stopped early.

use super::arguments::{self, ARG_TRACKING_ID, ARG_USERNAME};
use super::bindings::ActionBinding;
use super::logs::{InternalLogEntry, LogEntryHandle};
use super::process::{self, CommandLine, ProcessEvent};
use super::{
    persist, rate_window, ExecutionHandle, ExecutionRequest, Executor, DEFAULT_EXIT_CODE_NOT_EXECUTED,
    MAX_TRIGGER_DEPTH,
};
use crate::acl;
use crate::config::Config;
use crate::tpl;
use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn, Instrument};

const NOT_FOUND_TITLE: &str = "notfound";
const NOT_FOUND_ICON: &str = "&#x1f4a9;";

const TIMEOUT_HELP_URL: &str = "https://docs.olivetin.app/action_customization/timeouts.html";

type StepResult = ControlFlow<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    RequestAction,
    ConcurrencyCheck,
    RateCheck,
    AclCheck,
    ParseArgs,
    LogStart,
    Exec,
    ExecAfter,
    LogFinish,
    SaveLog,
    Trigger,
}

const ADMISSION: [Step; 4] = [Step::RequestAction, Step::ConcurrencyCheck, Step::RateCheck, Step::AclCheck];

const EXECUTION: [Step; 7] = [
    Step::ParseArgs,
    Step::LogStart,
    Step::Exec,
    Step::ExecAfter,
    Step::LogFinish,
    Step::SaveLog,
    Step::Trigger,
];

struct ExecutionContext {
    cfg: Arc<Config>,
    req: ExecutionRequest,
    entry: LogEntryHandle,
    /// Arguments after injection and mangling
    arguments: BTreeMap<String, String>,
    command: Option<CommandLine>,
}

impl ExecutionContext {
    // Always set once RequestAction let the chain continue.
    fn binding(&self) -> Option<Arc<ActionBinding>> {
        self.req.binding.clone()
    }
}

fn block(entry: &mut InternalLogEntry, message: &str) -> StepResult {
    entry.output = message.to_string();
    entry.blocked = true;
    ControlFlow::Break(())
}

impl Executor {
    /// Enrolls a request and starts executing it. Returns once the entry is
    /// in the log store and the admission gates have been evaluated.
    pub async fn exec_request(self: &Arc<Self>, mut req: ExecutionRequest) -> ExecutionHandle {
        let cfg = self.config().await;

        let admission = self.admission.lock().await;

        let entry = InternalLogEntry {
            execution_tracking_id: req.tracking_id.clone(),
            action_title: NOT_FOUND_TITLE.to_string(),
            action_icon: NOT_FOUND_ICON.to_string(),
            datetime_started: Some(Utc::now()),
            exit_code: DEFAULT_EXIT_CODE_NOT_EXECUTED,
            username: req.user.username.clone(),
            tags: req.tags.clone(),
            trigger_depth: req.trigger_depth,
            arguments: req.arguments.clone(),
            ..Default::default()
        };

        let entry = self.logs.insert(entry).await;
        req.tracking_id = entry.read().await.execution_tracking_id.clone();

        let mut ctx = ExecutionContext {
            cfg,
            req,
            entry,
            arguments: BTreeMap::new(),
            command: None,
        };

        let admitted = self.run_steps(&ADMISSION, &mut ctx).await;
        drop(admission);

        let tracking_id = ctx.req.tracking_id.clone();
        let span = tracing::info_span!("execution", tracking_id = %tracking_id);
        let executor = Arc::clone(self);

        let done = tokio::spawn(
            async move {
                if admitted {
                    executor.run_steps(&EXECUTION, &mut ctx).await;
                }
                executor.finalize(&ctx).await;
            }
            .instrument(span),
        );

        ExecutionHandle { tracking_id, done }
    }

    // Chained triggers re-enter exec_request from inside the spawned task.
    fn exec_request_boxed(self: &Arc<Self>, req: ExecutionRequest) -> BoxFuture<'_, ExecutionHandle> {
        Box::pin(self.exec_request(req))
    }

    /// Runs steps in order; false when one of them stopped the chain.
    async fn run_steps(self: &Arc<Self>, steps: &[Step], ctx: &mut ExecutionContext) -> bool {
        for step in steps {
            if self.run_step(*step, ctx).await.is_break() {
                debug!(tracking_id = %ctx.req.tracking_id, ?step, "Execution chain stopped");
                return false;
            }
        }
        true
    }

    async fn run_step(self: &Arc<Self>, step: Step, ctx: &mut ExecutionContext) -> StepResult {
        match step {
            Step::RequestAction => self.step_request_action(ctx).await,
            Step::ConcurrencyCheck => self.step_concurrency_check(ctx).await,
            Step::RateCheck => self.step_rate_check(ctx).await,
            Step::AclCheck => self.step_acl_check(ctx).await,
            Step::ParseArgs => self.step_parse_args(ctx).await,
            Step::LogStart => self.step_log_start(ctx).await,
            Step::Exec => self.step_exec(ctx).await,
            Step::ExecAfter => self.step_exec_after(ctx).await,
            Step::LogFinish => self.step_log_finish(ctx).await,
            Step::SaveLog => self.step_save_log(ctx).await,
            Step::Trigger => self.step_trigger(ctx).await,
        }
    }

    async fn step_request_action(&self, ctx: &mut ExecutionContext) -> StepResult {
        self.counters.actions_requested.fetch_add(1, Ordering::Relaxed);

        let Some(binding) = ctx.req.binding.clone() else {
            warn!(tracking_id = %ctx.req.tracking_id, "Action binding not found, not executing");
            return ControlFlow::Break(());
        };

        let snapshot = {
            let mut entry = ctx.entry.write().await;
            entry.binding = Some(Arc::clone(&binding));
            entry.binding_id = binding.id.clone();
            entry.action_config_title = binding.action.title.clone();
            entry.action_title = binding.title();
            entry.action_icon = binding.action.icon.clone();
            entry.action_id = binding.action.id.clone();
            entry.entity_prefix = binding.entity_prefix().to_string();
            entry.clone()
        };

        self.logs.enroll(&binding.id, &ctx.entry).await;

        info!(
            action_title = %snapshot.action_title,
            tracking_id = %snapshot.execution_tracking_id,
            username = %snapshot.username,
            tags = ?snapshot.tags,
            "Action requested"
        );

        for listener in &self.listeners {
            listener.on_execution_started(&ctx.cfg, &snapshot).await;
        }

        ControlFlow::Continue(())
    }

    async fn step_concurrency_check(&self, ctx: &mut ExecutionContext) -> StepResult {
        let Some(binding) = ctx.binding() else {
            return ControlFlow::Break(());
        };

        let mut running = 0;
        for handle in self.logs.by_binding(&binding.id).await {
            if !handle.read().await.execution_finished {
                running += 1;
            }
        }

        // The current request is already enrolled, hence the +1.
        if running >= binding.action.max_concurrent + 1 {
            warn!(
                action_title = %binding.action.title,
                running,
                max_concurrent = binding.action.max_concurrent,
                "Blocked from executing due to concurrency limit"
            );
            return block(&mut *ctx.entry.write().await, "Blocked from executing due to concurrency limit");
        }

        ControlFlow::Continue(())
    }

    async fn step_rate_check(&self, ctx: &mut ExecutionContext) -> StepResult {
        let Some(binding) = ctx.binding() else {
            return ControlFlow::Break(());
        };
        if binding.action.max_rate.is_empty() {
            return ControlFlow::Continue(());
        }

        let history = self.logs.by_binding(&binding.id).await;
        let now = Utc::now();

        for rate in &binding.action.max_rate {
            let Some(since) = rate_window(rate).and_then(|window| now.checked_sub_signed(window)) else {
                continue;
            };

            // Starts at -1 since the current request is in the history too.
            let mut executions: i64 = -1;
            for handle in &history {
                let entry = handle.read().await;
                if !entry.blocked && entry.datetime_started.is_some_and(|t| t > since) {
                    executions += 1;
                }
            }

            if executions >= rate.limit as i64 {
                info!(
                    action_title = %binding.action.title,
                    executions,
                    limit = rate.limit,
                    duration = %rate.duration,
                    "Blocked from executing due to rate limit"
                );
                return block(&mut *ctx.entry.write().await, "Blocked from executing due to rate limit");
            }
        }

        ControlFlow::Continue(())
    }

    async fn step_acl_check(&self, ctx: &mut ExecutionContext) -> StepResult {
        let Some(binding) = ctx.binding() else {
            return ControlFlow::Break(());
        };

        if !acl::is_allowed_exec(&ctx.cfg, &ctx.req.user, &binding.action) {
            warn!(
                action_title = %binding.action.title,
                username = %ctx.req.user.username,
                "ACL check failed. Blocked from executing."
            );
            return block(&mut *ctx.entry.write().await, "ACL check failed. Blocked from executing.");
        }

        ControlFlow::Continue(())
    }

    async fn step_parse_args(&self, ctx: &mut ExecutionContext) -> StepResult {
        let Some(binding) = ctx.binding() else {
            return ControlFlow::Break(());
        };
        let action = &binding.action;
        let entity = binding.entity.as_deref();

        let mut args = ctx.req.arguments.clone();
        args.insert(ARG_TRACKING_ID.to_string(), ctx.req.tracking_id.clone());
        args.insert(ARG_USERNAME.to_string(), ctx.req.user.username.clone());
        arguments::mangle_invalid_argument_values(action, &mut args);

        let prepared = if action.exec.is_empty() {
            arguments::parse_command_for_replacements(action, &action.shell, &args, entity, &self.entities)
                .await
                .map(CommandLine::Shell)
        } else {
            self.prepare_exec_argv(&binding, &args).await.map(CommandLine::Exec)
        };

        match prepared {
            Ok(command) => {
                let redacted = arguments::redact_passwords(action, &args);
                let shown = match &command {
                    CommandLine::Shell(_) => tpl::parse_template_with_args(&action.shell, entity, &redacted),
                    CommandLine::Exec(_) => action
                        .exec
                        .iter()
                        .map(|part| tpl::parse_template_with_args(part, entity, &redacted))
                        .collect::<Vec<_>>()
                        .join(" "),
                };
                debug!(action_title = %action.title, command = %shown, "Parsed command");

                ctx.arguments = args;
                ctx.command = Some(command);
                ControlFlow::Continue(())
            }
            Err(e) => {
                warn!(action_title = %action.title, error = %e, "Argument check failed");
                ctx.entry.write().await.output = e.to_string();
                ControlFlow::Break(())
            }
        }
    }

    async fn prepare_exec_argv(
        &self,
        binding: &ActionBinding,
        args: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, arguments::ArgumentError> {
        let action = &binding.action;
        for part in &action.exec {
            arguments::check_referenced_arguments(action, part, args)?;
        }
        arguments::validate_arguments(action, args, &self.entities).await?;

        Ok(action
            .exec
            .iter()
            .map(|part| tpl::parse_template_with_args(part, binding.entity.as_deref(), args))
            .collect())
    }

    async fn step_log_start(&self, ctx: &mut ExecutionContext) -> StepResult {
        let Some(binding) = ctx.binding() else {
            return ControlFlow::Break(());
        };
        info!(action_title = %binding.title(), timeout = binding.action.timeout, "Action started");
        ControlFlow::Continue(())
    }

    async fn step_exec(&self, ctx: &mut ExecutionContext) -> StepResult {
        let Some(binding) = ctx.binding() else {
            return ControlFlow::Break(());
        };
        let Some(command) = ctx.command.clone() else {
            ctx.entry.write().await.output = "Cannot execute: no command arguments provided".to_string();
            return ControlFlow::Break(());
        };

        let timeout = Duration::from_secs(binding.action.timeout);
        let env = process::build_env(&ctx.arguments);

        ctx.entry.write().await.execution_started = true;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = process::run_streaming(&command, &env, timeout, tx);

        let entry = &ctx.entry;
        let cfg = &ctx.cfg;
        let tracking_id = ctx.req.tracking_id.as_str();
        let forward = async {
            while let Some(event) = rx.recv().await {
                match event {
                    ProcessEvent::Started(pid) => entry.write().await.pid = Some(pid),
                    ProcessEvent::Output(chunk) => {
                        entry.write().await.output.push_str(&chunk);
                        for listener in &self.listeners {
                            listener.on_output_chunk(cfg, tracking_id, &binding, &chunk).await;
                        }
                    }
                }
            }
        };

        let (outcome, ()) = tokio::join!(run, forward);

        let mut entry = ctx.entry.write().await;
        entry.pid = None;
        entry.exit_code = outcome.exit_code;

        if let Some(err) = outcome.error {
            warn!(action_title = %entry.action_title, error = %err, "Could not run command");
            entry.output = format!("{}\n\n{}", err, entry.output);
        }

        if outcome.timed_out {
            warn!(action_title = %entry.action_title, "Action timed out");
            entry.timed_out = true;
            entry.output.push_str(&format!(
                "OliveTin::timeout - this action timed out after {} seconds. If you need more time for this action, set a longer timeout. See {} for more help.",
                binding.action.timeout, TIMEOUT_HELP_URL
            ));
        }

        entry.datetime_finished = Some(Utc::now());

        ControlFlow::Continue(())
    }

    async fn step_exec_after(&self, ctx: &mut ExecutionContext) -> StepResult {
        let Some(binding) = ctx.binding() else {
            return ControlFlow::Break(());
        };
        let action = &binding.action;
        if action.shell_after_completed.is_empty() {
            return ControlFlow::Continue(());
        }

        let (output, exit_code) = {
            let entry = ctx.entry.read().await;
            (entry.output.clone(), entry.exit_code)
        };

        let args: BTreeMap<String, String> = [
            ("output".to_string(), output),
            ("exitCode".to_string(), exit_code.to_string()),
            (ARG_TRACKING_ID.to_string(), ctx.req.tracking_id.clone()),
            (ARG_USERNAME.to_string(), ctx.req.user.username.clone()),
        ]
        .into();

        if let Err(e) = arguments::check_referenced_arguments(action, &action.shell_after_completed, &args) {
            let msg = format!("Could not prepare shellAfterCompleted command: {}\n", e);
            warn!(action_title = %action.title, "{}", msg.trim_end());
            ctx.entry.write().await.output.push_str(&msg);
            return ControlFlow::Continue(());
        }

        let script = tpl::parse_template_with_args(&action.shell_after_completed, binding.entity.as_deref(), &args);
        let timeout = Duration::from_secs(action.timeout);
        let result = process::run_captured(&CommandLine::Shell(script), &process::build_env(&args), timeout).await;

        let mut entry = ctx.entry.write().await;
        entry.output.push('\n');
        entry.output.push_str("OliveTin::shellAfterCompleted stdout\n");
        entry.output.push_str(&result.stdout);
        entry.output.push_str("OliveTin::shellAfterCompleted stderr\n");
        entry.output.push_str(&result.stderr);
        entry.output.push_str("OliveTin::shellAfterCompleted errors and summary\n");
        if let Some(err) = &result.error {
            entry.output = format!("{}\n\n{}", err, entry.output);
        }
        if result.timed_out {
            entry.output.push_str("Your shellAfterCompleted command timed out.");
        }
        entry
            .output
            .push_str(&format!("Your shellAfterCompleted exited with code {}\n", result.exit_code));
        entry.output.push_str("OliveTin::shellAfterCompleted output complete\n");

        ControlFlow::Continue(())
    }

    async fn step_log_finish(&self, ctx: &mut ExecutionContext) -> StepResult {
        let mut entry = ctx.entry.write().await;
        entry.execution_finished = true;

        info!(
            action_title = %entry.action_title,
            output_length = entry.output.len(),
            timed_out = entry.timed_out,
            exit = entry.exit_code,
            "Action finished"
        );

        ControlFlow::Continue(())
    }

    async fn step_save_log(&self, ctx: &mut ExecutionContext) -> StepResult {
        let Some(binding) = ctx.binding() else {
            return ControlFlow::Break(());
        };
        let snapshot = ctx.entry.read().await.clone();
        persist::save_log(&ctx.cfg, &binding.action, &snapshot);
        ControlFlow::Continue(())
    }

    async fn step_trigger(self: &Arc<Self>, ctx: &mut ExecutionContext) -> StepResult {
        let Some(binding) = ctx.binding() else {
            return ControlFlow::Break(());
        };
        let action = &binding.action;
        if action.triggers.is_empty() {
            return ControlFlow::Continue(());
        }

        if ctx.req.trigger_depth >= MAX_TRIGGER_DEPTH {
            warn!(
                action_title = %action.title,
                depth = ctx.req.trigger_depth,
                "Trigger action reached maximum depth of {}. Not triggering further actions.",
                MAX_TRIGGER_DEPTH
            );
            ctx.entry.write().await.output.push_str(&format!(
                "OliveTin::trigger - this action reached maximum trigger depth of {}. Not triggering further actions.",
                MAX_TRIGGER_DEPTH
            ));
            return ControlFlow::Continue(());
        }

        for target in &action.triggers {
            let Some(target_binding) = self.bindings.find_with_no_entity(target).await else {
                warn!(action_title = %action.title, trigger = %target, "Triggered action not found, skipping");
                continue;
            };

            let child = ExecutionRequest {
                binding: Some(target_binding),
                user: ctx.req.user.clone(),
                arguments: ctx.req.arguments.clone(),
                tracking_id: uuid::Uuid::new_v4().to_string(),
                tags: vec!["trigger".to_string()],
                trigger_depth: ctx.req.trigger_depth + 1,
            };

            let handle = self.exec_request_boxed(child).await;
            debug!(parent = %ctx.req.tracking_id, child = %handle.tracking_id, "Triggered action");
        }

        ControlFlow::Continue(())
    }

    #[instrument(skip_all, fields(tracking_id = %ctx.req.tracking_id))]
    async fn finalize(&self, ctx: &ExecutionContext) {
        let snapshot = {
            let mut entry = ctx.entry.write().await;
            if entry.datetime_finished.is_none() {
                entry.datetime_finished = Some(Utc::now());
            }
            entry.execution_finished = true;
            entry.clone()
        };

        for listener in &self.listeners {
            listener.on_execution_finished(&ctx.cfg, &snapshot).await;
        }
    }
}
