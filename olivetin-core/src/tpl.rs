//! Template evaluation for titles, shell commands and expressions
//!
//! Templates use the `{{ ... }}` syntax with dotted field access against a
//! context of `OliveTin`, `Env`, `Arguments` and `CurrentEntity`. A small
//! subset of the usual text-template language is supported: field chains,
//! literals, pipelines, the comparison/boolean helpers and `if`/`else`/`end`.
//!
//! Failures never propagate. They render as `tpl parse error: ...` or
//! `tpl exec error: ...` so that a broken title shows up in the UI instead of
//! failing the surrounding request.

use crate::entities::Entity;
use crate::installation::{BUILD, RUNTIME};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::{debug, error};

static LEGACY_ARGUMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{ ([a-zA-Z0-9_]+) \}\}").expect("static regex"));

static LEGACY_ENTITY_PROPERTY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{ ([a-zA-Z0-9_]+)\.([a-zA-Z0-9_\.]+) \}\}").expect("static regex")
});

static ENV_MAP: Lazy<Value> = Lazy::new(|| {
    let map: Map<String, Value> = std::env::vars()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    Value::Object(map)
});

/// Bare words that mean something to the template language itself.
const RESERVED_WORDS: [&str; 7] = ["if", "else", "end", "range", "with", "true", "false"];

fn is_reserved_word(name: &str) -> bool {
    name == "nil" || RESERVED_WORDS.contains(&name) || FUNCTIONS.contains(&name)
}

/// `{{ name }}` becomes `{{ .Arguments.name }}`. Keywords and function names
/// are left alone so that the parser can reject them.
pub fn migrate_legacy_argument_names(source: &str) -> String {
    LEGACY_ARGUMENT
        .replace_all(source, |caps: &regex::Captures| {
            if is_reserved_word(&caps[1]) {
                return caps[0].to_string();
            }
            debug!(old = &caps[1], "Legacy variable name found, changing to Argument");
            format!("{{{{ .Arguments.{} }}}}", &caps[1])
        })
        .into_owned()
}

/// `{{ thing.prop }}` becomes `{{ .CurrentEntity.prop }}`.
pub fn migrate_legacy_entity_properties(source: &str) -> String {
    LEGACY_ENTITY_PROPERTY
        .replace_all(source, |caps: &regex::Captures| {
            debug!(old = &caps[1], "Legacy entity variable name found, changing to CurrentEntity");
            format!("{{{{ .CurrentEntity.{} }}}}", &caps[2])
        })
        .into_owned()
}

pub fn migrate_legacy(source: &str) -> String {
    migrate_legacy_entity_properties(&migrate_legacy_argument_names(source))
}

/// The context available everywhere, without arguments or an entity.
pub fn general_context() -> Value {
    json!({
        "OliveTin": {
            "Build": &*BUILD,
            "Runtime": &*RUNTIME,
        },
        "Env": &*ENV_MAP,
    })
}

fn action_context(entity: Option<&Entity>, args: Option<&BTreeMap<String, String>>) -> Value {
    let mut ctx = general_context();

    if let Value::Object(map) = &mut ctx {
        let arguments: Map<String, Value> = args
            .map(|a| {
                a.iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect()
            })
            .unwrap_or_default();

        map.insert("Arguments".to_string(), Value::Object(arguments));
        map.insert(
            "CurrentEntity".to_string(),
            entity.map(|e| e.data.clone()).unwrap_or(Value::Null),
        );
    }

    ctx
}

pub fn parse_template_with_args(
    source: &str,
    entity: Option<&Entity>,
    args: &BTreeMap<String, String>,
) -> String {
    render_source(source, entity, Some(args))
}

pub fn parse_template_with(source: &str, entity: Option<&Entity>) -> String {
    render_source(source, entity, None)
}

/// True only when the rendered text, trimmed, is exactly `true`.
pub fn parse_template_bool_with(source: &str, entity: Option<&Entity>) -> bool {
    parse_template_with(source.trim(), entity).trim() == "true"
}

fn render_source(
    source: &str,
    entity: Option<&Entity>,
    args: Option<&BTreeMap<String, String>>,
) -> String {
    if !source.contains("{{") {
        return source.to_string();
    }

    let source = migrate_legacy(source);

    let nodes = match parse(&source) {
        Ok(nodes) => nodes,
        Err(e) => {
            error!(source = %source, error = %e, "Error parsing template");
            return format!("tpl parse error: {}", e);
        }
    };

    let ctx = action_context(entity, args);
    let mut out = String::new();

    match execute(&nodes, &ctx, &mut out) {
        Ok(()) => out,
        Err(e) => {
            error!(
                source = %source,
                error = %e,
                entity = entity.map(|e| e.unique_key.as_str()),
                "Error executing template"
            );
            format!("tpl exec error: {}", e)
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Output(Pipeline),
    If {
        cond: Pipeline,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Pipeline(Vec<Command>);

#[derive(Debug, Clone, PartialEq)]
struct Command(Vec<Operand>);

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    /// `.` is an empty chain
    Field(Vec<String>),
    Literal(Value),
    Nil,
    Function(String),
    Nested(Pipeline),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Field(Vec<String>),
    Ident(String),
    Str(String),
    Number(Number),
    LParen,
    RParen,
    Pipe,
}

enum Segment {
    Text(String),
    Action(String),
}

fn split_segments(source: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut rest = source;
    let mut trim_next = false;

    while let Some(open) = rest.find("{{") {
        let mut text = &rest[..open];
        if trim_next {
            text = text.trim_start();
        }

        let after_open = &rest[open + 2..];
        let close = find_close(after_open).ok_or_else(|| "unclosed action".to_string())?;
        let mut body = &after_open[..close];

        if let Some(stripped) = body.strip_prefix('-') {
            if stripped.starts_with(char::is_whitespace) {
                text = text.trim_end();
                body = stripped;
            }
        }

        trim_next = false;
        if let Some(stripped) = body.strip_suffix('-') {
            if stripped.ends_with(char::is_whitespace) {
                trim_next = true;
                body = stripped;
            }
        }

        if !text.is_empty() {
            segments.push(Segment::Text(text.to_string()));
        }
        segments.push(Segment::Action(body.trim().to_string()));
        rest = &after_open[close + 2..];
    }

    let text = if trim_next { rest.trim_start() } else { rest };
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }

    Ok(segments)
}

/// Position of the `}}` closing an action, skipping over quoted strings.
fn find_close(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut quote: Option<u8> = None;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' && q == b'"' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'"' || b == b'`' {
                    quote = Some(b);
                } else if b == b'}' && bytes.get(i + 1) == Some(&b'}') {
                    return Some(i);
                }
            }
        }
        i += 1;
    }

    None
}

fn tokenize(body: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = body.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let is_ident_char = |c: char| c.is_alphanumeric() || c == '_';

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
        } else if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else if c == '|' {
            tokens.push(Token::Pipe);
            i += 1;
        } else if c == '.' && !chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) {
            let mut chain = Vec::new();
            while i < chars.len() && chars[i] == '.' {
                i += 1;
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                if start == i {
                    if chain.is_empty() && (i >= chars.len() || chars[i] != '.') {
                        break;
                    }
                    return Err(format!("bad field syntax in {:?}", body));
                }
                chain.push(chars[start..i].iter().collect());
            }
            tokens.push(Token::Field(chain));
        } else if c == '"' {
            let mut s = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err("unterminated quoted string".to_string()),
                    Some('"') => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = match chars.get(i + 1) {
                            Some('n') => '\n',
                            Some('t') => '\t',
                            Some('r') => '\r',
                            Some('"') => '"',
                            Some('\\') => '\\',
                            Some(other) => return Err(format!("unknown escape sequence: \\{}", other)),
                            None => return Err("unterminated quoted string".to_string()),
                        };
                        s.push(escaped);
                        i += 2;
                    }
                    Some(other) => {
                        s.push(*other);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(s));
        } else if c == '`' {
            let start = i + 1;
            let end = chars[start..]
                .iter()
                .position(|&c| c == '`')
                .ok_or_else(|| "unterminated raw quoted string".to_string())?;
            tokens.push(Token::Str(chars[start..start + end].iter().collect()));
            i = start + end + 1;
        } else if c.is_ascii_digit() || ((c == '-' || c == '+' || c == '.') && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Number(parse_number(&text)?));
        } else if is_ident_char(c) {
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            return Err(format!("unexpected {:?} in command", c));
        }
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> Result<Number, String> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Number::from(i));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .ok_or_else(|| format!("bad number syntax: {:?}", text))
}

struct TokenStream {
    tokens: Vec<Token>,
    pos: usize,
}

impl TokenStream {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn pipeline(&mut self, nested: bool) -> Result<Pipeline, String> {
        let mut commands = Vec::new();

        loop {
            let mut operands = Vec::new();
            loop {
                match self.peek() {
                    None => break,
                    Some(Token::Pipe) | Some(Token::RParen) => break,
                    Some(_) => operands.push(self.operand()?),
                }
            }

            if operands.is_empty() {
                return Err("missing value for command".to_string());
            }
            commands.push(Command(operands));

            match self.peek() {
                Some(Token::Pipe) => {
                    self.next();
                }
                Some(Token::RParen) if nested => break,
                Some(Token::RParen) => return Err("unexpected right paren".to_string()),
                _ => break,
            }
        }

        Ok(Pipeline(commands))
    }

    fn operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Token::Field(chain)) => Ok(Operand::Field(chain)),
            Some(Token::Str(s)) => Ok(Operand::Literal(Value::String(s))),
            Some(Token::Number(n)) => Ok(Operand::Literal(Value::Number(n))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Operand::Literal(Value::Bool(true))),
                "false" => Ok(Operand::Literal(Value::Bool(false))),
                "nil" => Ok(Operand::Nil),
                _ if FUNCTIONS.contains(&name.as_str()) => Ok(Operand::Function(name)),
                _ => Err(format!("function {:?} not defined", name)),
            },
            Some(Token::LParen) => {
                let inner = self.pipeline(true)?;
                match self.next() {
                    Some(Token::RParen) => Ok(Operand::Nested(inner)),
                    _ => Err("unclosed left paren".to_string()),
                }
            }
            Some(Token::RParen) => Err("unexpected right paren".to_string()),
            Some(Token::Pipe) => Err("missing value for command".to_string()),
            None => Err("missing value for command".to_string()),
        }
    }
}

fn parse_pipeline(body: &str) -> Result<Pipeline, String> {
    let mut stream = TokenStream {
        tokens: tokenize(body)?,
        pos: 0,
    };
    let pipeline = stream.pipeline(false)?;
    if stream.peek().is_some() {
        return Err(format!("unexpected token in {:?}", body));
    }
    Ok(pipeline)
}

enum Terminator {
    Eof,
    Else(Option<String>),
    End,
}

fn parse(source: &str) -> Result<Vec<Node>, String> {
    let segments = split_segments(source)?;
    let mut iter = segments.into_iter();
    let (nodes, terminator) = parse_list(&mut iter)?;

    match terminator {
        Terminator::Eof => Ok(nodes),
        Terminator::Else(_) => Err("unexpected {{else}}".to_string()),
        Terminator::End => Err("unexpected {{end}}".to_string()),
    }
}

fn parse_list(iter: &mut impl Iterator<Item = Segment>) -> Result<(Vec<Node>, Terminator), String> {
    let mut nodes = Vec::new();

    while let Some(segment) = iter.next() {
        let body = match segment {
            Segment::Text(t) => {
                nodes.push(Node::Text(t));
                continue;
            }
            Segment::Action(body) => body,
        };

        if body.starts_with("/*") && body.ends_with("*/") {
            continue;
        }

        let (keyword, rest) = match body.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (body.as_str(), ""),
        };

        match keyword {
            "end" => return Ok((nodes, Terminator::End)),
            "else" => {
                let chained = rest
                    .strip_prefix("if")
                    .filter(|r| r.is_empty() || r.starts_with(char::is_whitespace))
                    .map(|r| r.trim().to_string());
                return Ok((nodes, Terminator::Else(chained)));
            }
            "if" => nodes.push(parse_if(rest, iter)?),
            "" => return Err("missing value for command".to_string()),
            _ => nodes.push(Node::Output(parse_pipeline(&body)?)),
        }
    }

    Ok((nodes, Terminator::Eof))
}

fn parse_if(cond: &str, iter: &mut impl Iterator<Item = Segment>) -> Result<Node, String> {
    if cond.is_empty() {
        return Err("missing value for if".to_string());
    }
    let cond = parse_pipeline(cond)?;
    let (then, terminator) = parse_list(iter)?;

    let otherwise = match terminator {
        Terminator::End => Vec::new(),
        Terminator::Else(None) => {
            let (otherwise, terminator) = parse_list(iter)?;
            match terminator {
                Terminator::End => otherwise,
                _ => return Err("expected {{end}} after {{else}}".to_string()),
            }
        }
        // `else if` shares the closing `end` with the outer `if`
        Terminator::Else(Some(chained)) => vec![parse_if(&chained, iter)?],
        Terminator::Eof => return Err("unexpected EOF, missing {{end}}".to_string()),
    };

    Ok(Node::If {
        cond,
        then,
        otherwise,
    })
}

// ---------------------------------------------------------------------------
// Execution

const FUNCTIONS: [&str; 11] = [
    "eq", "ne", "lt", "le", "gt", "ge", "not", "and", "or", "len", "index",
];

/// `None` is a missing map key, rendered as `<no value>`.
type Eval = Option<Value>;

fn execute(nodes: &[Node], ctx: &Value, out: &mut String) -> Result<(), String> {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Output(p) => {
                let v = eval_pipeline(p, ctx)?;
                write_value(out, v.as_ref());
            }
            Node::If {
                cond,
                then,
                otherwise,
            } => {
                if truthy(eval_pipeline(cond, ctx)?.as_ref()) {
                    execute(then, ctx, out)?;
                } else {
                    execute(otherwise, ctx, out)?;
                }
            }
        }
    }
    Ok(())
}

fn eval_pipeline(pipeline: &Pipeline, ctx: &Value) -> Result<Eval, String> {
    let mut previous: Option<Eval> = None;

    for command in &pipeline.0 {
        previous = Some(eval_command(command, ctx, previous)?);
    }

    Ok(previous.unwrap_or(None))
}

fn eval_command(command: &Command, ctx: &Value, piped: Option<Eval>) -> Result<Eval, String> {
    let (first, rest) = command
        .0
        .split_first()
        .ok_or_else(|| "empty command".to_string())?;

    if let Operand::Function(name) = first {
        let mut args = rest
            .iter()
            .map(|op| eval_operand(op, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(p) = piped {
            args.push(p);
        }
        return call_function(name, args);
    }

    if !rest.is_empty() || piped.is_some() {
        return Err("can't give argument to non-function".to_string());
    }

    eval_operand(first, ctx)
}

fn eval_operand(operand: &Operand, ctx: &Value) -> Result<Eval, String> {
    match operand {
        Operand::Field(chain) => eval_field(chain, ctx),
        Operand::Literal(v) => Ok(Some(v.clone())),
        Operand::Nil => Ok(Some(Value::Null)),
        Operand::Nested(p) => eval_pipeline(p, ctx),
        Operand::Function(name) => call_function(name, Vec::new()),
    }
}

fn eval_field(chain: &[String], ctx: &Value) -> Result<Eval, String> {
    let mut current: Eval = Some(ctx.clone());

    for (depth, name) in chain.iter().enumerate() {
        // The context and `.OliveTin` have a fixed shape; everything below
        // them is map data where a missing key is not an error.
        let fixed_shape = depth == 0 || (depth == 1 && chain[0] == "OliveTin");

        current = match current {
            Some(Value::Object(map)) => match map.get(name) {
                Some(v) => Some(v.clone()),
                None if fixed_shape => return Err(format!("can't evaluate field {}", name)),
                None => None,
            },
            None | Some(Value::Null) => {
                return Err(format!("nil pointer evaluating interface {{}}.{}", name))
            }
            Some(other) => {
                return Err(format!(
                    "can't evaluate field {} in type {}",
                    name,
                    type_name(&other)
                ))
            }
        };
    }

    Ok(current)
}

fn call_function(name: &str, args: Vec<Eval>) -> Result<Eval, String> {
    let arity = |n: usize| -> Result<(), String> {
        if args.len() != n {
            return Err(format!(
                "wrong number of args for {}: want {} got {}",
                name,
                n,
                args.len()
            ));
        }
        Ok(())
    };

    let result = match name {
        "not" => {
            arity(1)?;
            Some(Value::Bool(!truthy(args[0].as_ref())))
        }
        "and" => {
            if args.is_empty() {
                return Err("wrong number of args for and".to_string());
            }
            let pick = args
                .iter()
                .position(|a| !truthy(a.as_ref()))
                .unwrap_or(args.len() - 1);
            args[pick].clone()
        }
        "or" => {
            if args.is_empty() {
                return Err("wrong number of args for or".to_string());
            }
            let pick = args
                .iter()
                .position(|a| truthy(a.as_ref()))
                .unwrap_or(args.len() - 1);
            args[pick].clone()
        }
        "eq" => {
            if args.len() < 2 {
                return Err("missing argument for comparison".to_string());
            }
            let mut matched = false;
            for other in &args[1..] {
                if compare_eq(args[0].as_ref(), other.as_ref())? {
                    matched = true;
                    break;
                }
            }
            Some(Value::Bool(matched))
        }
        "ne" => {
            arity(2)?;
            Some(Value::Bool(!compare_eq(args[0].as_ref(), args[1].as_ref())?))
        }
        "lt" | "le" | "gt" | "ge" => {
            arity(2)?;
            let ord = compare_ord(args[0].as_ref(), args[1].as_ref())?;
            let result = match name {
                "lt" => ord.is_lt(),
                "le" => ord.is_le(),
                "gt" => ord.is_gt(),
                _ => ord.is_ge(),
            };
            Some(Value::Bool(result))
        }
        "len" => {
            arity(1)?;
            let len = match &args[0] {
                Some(Value::String(s)) => s.len(),
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(m)) => m.len(),
                other => return Err(format!("len of {}", describe(other.as_ref()))),
            };
            Some(Value::Number(Number::from(len)))
        }
        "index" => {
            let (first, keys) = args
                .split_first()
                .ok_or_else(|| "wrong number of args for index".to_string())?;
            let mut current = first.clone();
            for key in keys {
                current = match (current, key) {
                    (Some(Value::Object(map)), Some(Value::String(k))) => map.get(k).cloned(),
                    (Some(Value::Array(items)), Some(Value::Number(n))) => {
                        let idx = n
                            .as_u64()
                            .ok_or_else(|| format!("cannot index slice with {}", n))?;
                        Some(
                            items
                                .get(idx as usize)
                                .cloned()
                                .ok_or_else(|| format!("index out of range: {}", idx))?,
                        )
                    }
                    (other, _) => return Err(format!("can't index item of type {}", describe(other.as_ref()))),
                };
            }
            current
        }
        _ => return Err(format!("function {:?} not defined", name)),
    };

    Ok(result)
}

fn compare_eq(a: Option<&Value>, b: Option<&Value>) -> Result<bool, String> {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => Ok(x.as_f64() == y.as_f64()),
        (Some(Value::String(x)), Some(Value::String(y))) => Ok(x == y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => Ok(x == y),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ok(true),
        (None | Some(Value::Null), _) | (_, None | Some(Value::Null)) => Ok(false),
        (x, y) => Err(format!(
            "incompatible types for comparison: {} and {}",
            describe(x),
            describe(y)
        )),
    }
}

fn compare_ord(a: Option<&Value>, b: Option<&Value>) -> Result<std::cmp::Ordering, String> {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .ok_or_else(|| "invalid number for comparison".to_string()),
        (Some(Value::String(x)), Some(Value::String(y))) => Ok(x.cmp(y)),
        (x, y) => Err(format!(
            "incompatible types for comparison: {} and {}",
            describe(x),
            describe(y)
        )),
    }
}

fn truthy(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(m)) => !m.is_empty(),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Number(_) => "float64",
        Value::String(_) => "string",
        Value::Array(_) => "[]interface {}",
        Value::Object(_) => "map[string]interface {}",
    }
}

fn describe(v: Option<&Value>) -> &'static str {
    v.map(type_name).unwrap_or("invalid")
}

fn write_value(out: &mut String, v: Option<&Value>) {
    match v {
        None => out.push_str("<no value>"),
        Some(Value::Null) => out.push_str("<nil>"),
        Some(Value::String(s)) => out.push_str(s),
        Some(Value::Bool(b)) => {
            let _ = write!(out, "{}", b);
        }
        Some(Value::Number(n)) => {
            let _ = write!(out, "{}", n);
        }
        Some(Value::Array(items)) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                write_value(out, Some(item));
            }
            out.push(']');
        }
        Some(Value::Object(map)) => {
            out.push_str("map[");
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                out.push_str(key);
                out.push(':');
                write_value(out, map.get(key));
            }
            out.push(']');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn server() -> Entity {
        Entity::new(
            "0",
            json!({"hostname": "web1", "port": 22, "tags": ["a", "b"], "nested": {"x": "y"}}),
        )
    }

    #[test]
    fn test_legacy_migration() {
        assert_eq!(
            migrate_legacy("echo {{ person }} on {{ server.hostname }}"),
            "echo {{ .Arguments.person }} on {{ .CurrentEntity.hostname }}"
        );
        assert_eq!(
            migrate_legacy("{{ vm.nested.x }}"),
            "{{ .CurrentEntity.nested.x }}"
        );
    }

    #[test]
    fn test_legacy_migration_is_idempotent() {
        let once = migrate_legacy("{{ a }} {{ ent.b }} {{ .Arguments.c }}");
        assert_eq!(migrate_legacy(&once), once);
    }

    #[test]
    fn test_argument_named_like_its_surroundings_is_not_mangled() {
        // The whole match is replaced, not every occurrence of the name.
        assert_eq!(
            migrate_legacy_argument_names("echo name={{ name }}"),
            "echo name={{ .Arguments.name }}"
        );
    }

    #[test]
    fn test_render_arguments_and_entity() {
        let ent = server();
        let out = parse_template_with_args(
            "ssh {{ .CurrentEntity.hostname }}:{{ .CurrentEntity.port }} as {{ user }}",
            Some(&ent),
            &args(&[("user", "root")]),
        );
        assert_eq!(out, "ssh web1:22 as root");
    }

    #[test]
    fn test_missing_keys_and_errors() {
        let ent = server();

        assert_eq!(
            parse_template_with("{{ .CurrentEntity.missing }}", Some(&ent)),
            "<no value>"
        );
        assert_eq!(
            parse_template_with("{{ .Arguments.missing }}", None),
            "<no value>"
        );
        assert!(parse_template_with("{{ .CurrentEntity.hostname }}", None)
            .starts_with("tpl exec error:"));
        assert!(parse_template_with("{{ .Nope }}", None).starts_with("tpl exec error:"));
        assert!(parse_template_with("{{ .Arguments.x", None).starts_with("tpl parse error:"));
        assert!(parse_template_with("{{ if true }}x", None).starts_with("tpl parse error:"));
    }

    #[test]
    fn test_bare_keywords_are_errors_not_arguments() {
        assert_eq!(migrate_legacy("{{ if }} {{ end }} {{ eq }}"), "{{ if }} {{ end }} {{ eq }}");

        let empty = args(&[]);
        for (source, prefix) in [
            ("{{ if }}", "tpl parse error:"),
            ("{{ end }}", "tpl parse error:"),
            ("{{ else }}", "tpl parse error:"),
            ("{{ eq }}", "tpl exec error:"),
            ("{{ not }}", "tpl exec error:"),
        ] {
            let out = parse_template_with_args(source, None, &empty);
            assert!(out.starts_with(prefix), "{source} rendered {out:?}");
        }

        assert_eq!(parse_template_with("{{ true }}", None), "true");
    }

    #[test]
    fn test_plain_text_passthrough() {
        assert_eq!(parse_template_with("Restart server", None), "Restart server");
    }

    #[test]
    fn test_composite_values_render_as_lists_and_maps() {
        let ent = server();
        assert_eq!(parse_template_with("{{ .CurrentEntity.tags }}", Some(&ent)), "[a b]");
        assert_eq!(parse_template_with("{{ .CurrentEntity.nested }}", Some(&ent)), "map[x:y]");
    }

    #[test]
    fn test_conditionals_and_functions() {
        let ent = server();
        let src = r#"{{ if eq .CurrentEntity.hostname "web1" }}primary{{ else if gt .CurrentEntity.port 100 }}high{{ else }}other{{ end }}"#;
        assert_eq!(parse_template_with(src, Some(&ent)), "primary");

        assert_eq!(
            parse_template_with("{{ and (eq 1 1) (ne \"a\" \"b\") }}", None),
            "true"
        );
        assert_eq!(parse_template_with("{{ .CurrentEntity.tags | len }}", Some(&ent)), "2");
        assert_eq!(
            parse_template_with("{{ index .CurrentEntity.tags 1 }}", Some(&ent)),
            "b"
        );
        assert_eq!(parse_template_with("a {{- \" b \" -}} c", None), "a b c");
    }

    #[test]
    fn test_bool_form() {
        let ent = server();
        assert!(parse_template_bool_with(" {{ eq .CurrentEntity.port 22 }} ", Some(&ent)));
        assert!(!parse_template_bool_with("{{ eq .CurrentEntity.port 23 }}", Some(&ent)));
        assert!(!parse_template_bool_with("yes", None));
    }

    #[test]
    fn test_olivetin_context() {
        let out = parse_template_with("{{ .OliveTin.Build.Version }}", None);
        assert_eq!(out, env!("CARGO_PKG_VERSION"));
        assert!(parse_template_with("{{ .OliveTin.Nope }}", None).starts_with("tpl exec error:"));
    }
}
