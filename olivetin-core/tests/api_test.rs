//! The HTTP control plane, driven through a real listener

mod common;

use common::{wait_for_entry, TestServer};
use olivetin_core::auth::local::create_hash;
use pretty_assertions::assert_eq;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

const BASIC: &str = r#"
pageTitle: Test Tin
actions:
  - title: Hello
    id: hello
    shell: echo hello
  - title: Greet
    id: greet
    shell: "echo Hi {{ name }}"
    arguments:
      - name: name
        type: ascii_identifier
"#;

#[tokio::test]
async fn test_readyz_and_init() {
    let server = TestServer::start(BASIC).await;

    let readyz = server.client.get(server.url("/readyz")).send().await.unwrap();
    assert_eq!(readyz.status(), StatusCode::OK);
    assert_eq!(readyz.text().await.unwrap(), "OK");

    let res: Value = server.call("GetReadyz", json!({})).await.json().await.unwrap();
    assert_eq!(res["status"], "OK");

    let init: Value = server.call("Init", json!({})).await.json().await.unwrap();
    assert_eq!(init["pageTitle"], "Test Tin");
    assert_eq!(init["currentVersion"], env!("CARGO_PKG_VERSION"));
    assert_eq!(init["rootDashboards"], json!(["Actions"]));
    assert_eq!(init["authenticatedUser"], "guest");
    assert_eq!(init["loginRequired"], false);
}

#[tokio::test]
async fn test_default_dashboard_and_action_binding() {
    let server = TestServer::start(BASIC).await;

    let res: Value = server.call("GetDashboard", json!({"title": "Actions"})).await.json().await.unwrap();
    let fieldset = &res["dashboard"]["contents"][0];
    assert_eq!(fieldset["type"], "fieldset");
    assert_eq!(fieldset["title"], "Default");

    let titles: Vec<&str> = fieldset["contents"]
        .as_array()
        .unwrap()
        .iter()
        .map(|link| link["title"].as_str().unwrap())
        .collect();
    assert_eq!(titles, vec!["Hello", "Greet"]);
    assert_eq!(fieldset["contents"][0]["action"]["bindingId"], "hello");
    assert_eq!(fieldset["contents"][0]["action"]["canExec"], true);

    let res: Value = server.call("GetActionBinding", json!({"bindingId": "greet"})).await.json().await.unwrap();
    assert_eq!(res["action"]["title"], "Greet");
    assert_eq!(res["action"]["arguments"][0]["name"], "name");

    let missing = server.call("GetDashboard", json!({"title": "Nope"})).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_binding_is_not_found() {
    let server = TestServer::start(BASIC).await;

    let res = server.call("StartAction", json!({"bindingId": "does-not-exist"})).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let server = TestServer::start(BASIC).await;

    let res = server
        .client
        .post(server.url("/api/StartAction"))
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[cfg(unix)]
#[tokio::test]
async fn test_start_and_wait_then_logs() {
    let server = TestServer::start(BASIC).await;

    let res: Value = server
        .call(
            "StartActionAndWait",
            json!({"bindingId": "greet", "arguments": [{"name": "name", "value": "Fred"}]}),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(res["logEntry"]["output"], "Hi Fred\n");
    assert_eq!(res["logEntry"]["exitCode"], 0);
    assert_eq!(res["logEntry"]["executionFinished"], true);

    let by_get: Value = server
        .client
        .get(server.url("/api/StartActionByGetAndWait/hello"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(by_get["logEntry"]["output"], "hello\n");

    let logs: Value = server.call("GetLogs", json!({})).await.json().await.unwrap();
    assert_eq!(logs["totalCount"], 2);
    assert_eq!(logs["logs"][0]["actionTitle"], "Hello");
    assert_eq!(logs["logs"][1]["actionTitle"], "Greet");

    let action_logs: Value = server.call("GetActionLogs", json!({"bindingId": "greet"})).await.json().await.unwrap();
    assert_eq!(action_logs["totalCount"], 1);

    let tracking_id = logs["logs"][0]["executionTrackingId"].as_str().unwrap();
    let status: Value = server
        .call("ExecutionStatus", json!({"executionTrackingId": tracking_id}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(status["logEntry"]["output"], "hello\n");
}

#[cfg(unix)]
#[tokio::test]
async fn test_start_action_skips_undeclared_arguments() {
    let server = TestServer::start(BASIC).await;

    let res: Value = server
        .call(
            "StartAction",
            json!({
                "bindingId": "greet",
                "arguments": [{"name": "name", "value": "Fred"}, {"name": "extra", "value": "x"}],
            }),
        )
        .await
        .json()
        .await
        .unwrap();

    let tracking_id = res["executionTrackingId"].as_str().unwrap();
    let entry = wait_for_entry(server.app.executor(), tracking_id).await;

    assert_eq!(entry.output, "Hi Fred\n");
    assert!(!entry.arguments.contains_key("extra"));
}

#[tokio::test]
async fn test_guests_must_log_in() {
    let server = TestServer::start(
        r#"
authRequireGuestsToLogin: true
actions:
  - title: Hello
    id: hello
    shell: echo hello
"#,
    )
    .await;

    let init: Value = server.call("Init", json!({})).await.json().await.unwrap();
    assert_eq!(init["loginRequired"], true);

    for operation in ["GetDashboard", "WhoAmI", "GetLogs", "GetEntities"] {
        let res = server.call(operation, json!({})).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN, "{operation}");

        let body: Value = res.json().await.unwrap();
        assert_eq!(body["message"], "guests are not allowed to access the dashboard");
    }

    let stream = server.client.get(server.url("/api/EventStream")).send().await.unwrap();
    assert_eq!(stream.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_trusted_header_identity() {
    let server = TestServer::start(
        r#"
authHttpHeaderUsername: X-Remote-User
authHttpHeaderUserGroup: X-Remote-Groups
"#,
    )
    .await;

    let res: Value = server
        .client
        .post(server.url("/api/WhoAmI"))
        .header("X-Remote-User", "bob")
        .header("X-Remote-Groups", "ops")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(res["authenticatedUser"], "bob");
    assert_eq!(res["usergroup"], "ops");
    assert_eq!(res["provider"], "header");
}

#[tokio::test]
async fn test_local_login_session_and_logout() {
    let hash = create_hash("secret").unwrap();
    let server = TestServer::start(&format!(
        r#"
authLocalUsers:
  enabled: true
  users:
    - username: alice
      usergroup: admins
      password: "{hash}"
"#
    ))
    .await;

    let failed: Value = server
        .call("LocalUserLogin", json!({"username": "alice", "password": "wrong"}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(failed["success"], false);

    let res = server
        .call("LocalUserLogin", json!({"username": "alice", "password": "secret"}))
        .await;
    let cookie = res.headers()[SET_COOKIE].to_str().unwrap().to_string();
    assert!(cookie.starts_with("olivetin-sid-local="));
    assert!(cookie.contains("HttpOnly"));
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], true);

    let session = cookie.split(';').next().unwrap().to_string();
    assert!(server.dir.path().join("sessions.db.yaml").exists());

    let who: Value = server
        .client
        .post(server.url("/api/WhoAmI"))
        .header(COOKIE, &session)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(who["authenticatedUser"], "alice");
    assert_eq!(who["usergroup"], "admins");
    assert_eq!(who["provider"], "local");

    let logout = server
        .client
        .post(server.url("/api/Logout"))
        .header(COOKIE, &session)
        .send()
        .await
        .unwrap();
    let expired: Vec<&str> = logout
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap())
        .collect();
    assert_eq!(expired.len(), 2);
    assert!(expired.iter().all(|c| c.contains("Max-Age=0")));

    let who: Value = server
        .client
        .post(server.url("/api/WhoAmI"))
        .header(COOKIE, &session)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(who["authenticatedUser"], "guest");
}

#[tokio::test]
async fn test_local_login_disabled() {
    let server = TestServer::start(BASIC).await;

    let res = server
        .call("LocalUserLogin", json!({"username": "alice", "password": "secret"}))
        .await;
    assert!(res.headers().get(SET_COOKIE).is_none());

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_password_hash_and_argument_validation() {
    let server = TestServer::start(BASIC).await;

    let res: Value = server.call("PasswordHash", json!({"password": "hunter2"})).await.json().await.unwrap();
    let hash = res["hash"].as_str().unwrap();
    assert!(hash.starts_with("$argon2id$v=19$m=65536,t=4,"));

    let valid: Value = server
        .call("ValidateArgumentType", json!({"value": "abc", "type": "ascii"}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(valid["valid"], true);

    let invalid: Value = server
        .call(
            "ValidateArgumentType",
            json!({"value": "not ok", "bindingId": "greet", "argumentName": "name"}),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(invalid["valid"], false);
    assert_eq!(invalid["description"], "invalid argument name, doesn't match ascii_identifier");

    let unknown: Value = server
        .call(
            "ValidateArgumentType",
            json!({"value": "x", "bindingId": "greet", "argumentName": "nope"}),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(unknown["description"], "argument not found");
}

#[tokio::test]
async fn test_diagnostics_are_off_by_default() {
    let server = TestServer::start(BASIC).await;

    let vars: Value = server.call("DumpVars", json!({})).await.json().await.unwrap();
    assert_eq!(vars["alert"], "Dumping variables is not allowed by default because it is insecure.");

    let map: Value = server.call("DumpPublicIdActionMap", json!({})).await.json().await.unwrap();
    assert_eq!(map["alert"], "Dumping Public IDs is disallowed.");
    assert_eq!(map["contents"], json!({}));

    let sos: Value = server.call("SosReport", json!({})).await.json().await.unwrap();
    assert!(sos["alert"].as_str().unwrap().starts_with("Your SOS Report has been logged"));
}

#[tokio::test]
async fn test_diagnostics_follow_policy() {
    let server = TestServer::start(BASIC).await;

    let res: Value = server.call("GetDiagnostics", json!({})).await.json().await.unwrap();
    let key = res["sshFoundKey"].as_str().unwrap();
    let config = res["sshFoundConfig"].as_str().unwrap();
    assert!(key.ends_with("id_rsa"), "{key}");
    assert!(config.ends_with("config"), "{config}");

    let hidden = TestServer::start(&format!("defaultPolicy:\n  showDiagnostics: false\n{BASIC}")).await;
    let res: Value = hidden.call("GetDiagnostics", json!({})).await.json().await.unwrap();
    assert_eq!(res, json!({"sshFoundKey": "", "sshFoundConfig": ""}));
}

#[tokio::test]
async fn test_action_map_dump_when_enabled() {
    let server = TestServer::start(&format!("insecureAllowDumpActionMap: true\n{BASIC}")).await;

    let map: Value = server.call("DumpPublicIdActionMap", json!({})).await.json().await.unwrap();
    assert_eq!(map["contents"]["hello"]["actionTitle"], "Hello");
    assert_eq!(map["contents"]["greet"]["actionTitle"], "Greet");
}

#[cfg(unix)]
#[tokio::test]
async fn test_event_stream_delivers_execution_events() {
    let server = TestServer::start(BASIC).await;

    let mut stream = server.client.get(server.url("/api/EventStream")).send().await.unwrap();
    assert_eq!(stream.status(), StatusCode::OK);
    assert_eq!(stream.headers()["x-accel-buffering"], "no");
    assert!(stream.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    server.call("StartAction", json!({"bindingId": "hello"})).await;

    let mut received = String::new();
    let read = async {
        while !received.contains("ExecutionFinished") {
            match stream.chunk().await.unwrap() {
                Some(chunk) => received.push_str(&String::from_utf8_lossy(&chunk)),
                None => break,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), read).await.unwrap();

    assert!(received.contains(r#""type":"ExecutionStarted""#));
    assert!(received.contains(r#""type":"OutputChunk""#));
    assert!(received.contains(r#""type":"ExecutionFinished""#));
}

#[cfg(unix)]
#[tokio::test]
async fn test_webhook_starts_matching_action() {
    let server = TestServer::start(
        r#"
actions:
  - title: Deploy
    id: deploy
    shell: "echo deploying {{ ref }}"
    arguments:
      - name: ref
        type: ascii_identifier
    execOnWebhook:
      - authType: bearer
        secret: s3cret
        matchHeaders:
          X-Event: deploy
        extract:
          ref: "$.ref"
"#,
    )
    .await;

    let wrong_secret = server
        .client
        .post(server.url("/webhooks/deploy"))
        .header("Authorization", "Bearer nope")
        .header("X-Event", "deploy")
        .body(r#"{"ref": "main"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_secret.status(), StatusCode::OK);
    assert_eq!(wrong_secret.text().await.unwrap(), "OK");
    assert!(server.app.executor().logs().is_empty().await);

    let accepted = server
        .client
        .post(server.url("/webhooks/deploy"))
        .header("Authorization", "Bearer s3cret")
        .header("X-Event", "deploy")
        .body(r#"{"ref": "main"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.text().await.unwrap(), "OK");

    let runs = server.app.executor().logs().by_binding("deploy").await;
    assert_eq!(runs.len(), 1);
    let tracking_id = runs[0].read().await.execution_tracking_id.clone();

    let entry = wait_for_entry(server.app.executor(), &tracking_id).await;
    assert_eq!(entry.output, "deploying main\n");
    assert_eq!(entry.tags, vec!["webhook".to_string()]);
    assert_eq!(entry.username, "webhook");

    let get = server.client.get(server.url("/webhooks")).send().await.unwrap();
    assert_eq!(get.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[cfg(unix)]
#[tokio::test]
async fn test_webhook_accepts_oversized_body() {
    let server = TestServer::start(
        r#"
actions:
  - title: Ingest
    id: ingest
    shell: echo ingested
    execOnWebhook:
      - matchHeaders:
          X-Event: ingest
"#,
    )
    .await;

    // Larger than both the payload cap and the framework's default limit.
    let body = vec![b'a'; 3 * 1024 * 1024];
    let res = server
        .client
        .post(server.url("/webhooks/ingest"))
        .header("X-Event", "ingest")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "OK");

    let runs = server.app.executor().logs().by_binding("ingest").await;
    assert_eq!(runs.len(), 1);
    let tracking_id = runs[0].read().await.execution_tracking_id.clone();
    let entry = wait_for_entry(server.app.executor(), &tracking_id).await;
    assert_eq!(entry.output, "ingested\n");
}

#[tokio::test]
async fn test_entities_catalog() {
    let server = TestServer::start(BASIC).await;
    let entities = server.app.executor().entities();
    entities
        .add_entity("server", "0", json!({"title": "alpha", "ip": "10.0.0.1", "port": 22}))
        .await;
    entities.add_entity("server", "1", json!({"title": "beta"})).await;

    let catalog: Value = server.call("GetEntities", json!({})).await.json().await.unwrap();
    let definition = &catalog["entityDefinitions"][0];
    assert_eq!(definition["title"], "server");
    assert_eq!(definition["instances"][0]["title"], "alpha");
    assert_eq!(definition["instances"][1]["uniqueKey"], "1");

    let entity: Value = server
        .call("GetEntity", json!({"type": "server", "uniqueKey": "0"}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(entity["title"], "alpha");
    assert_eq!(entity["fields"]["ip"], "10.0.0.1");
    assert_eq!(entity["fields"]["port"], "22");

    let missing_key = server.call("GetEntity", json!({"type": "server", "uniqueKey": "9"})).await;
    assert_eq!(missing_key.status(), StatusCode::NOT_FOUND);

    let missing_type = server.call("GetEntity", json!({"type": "nope", "uniqueKey": "0"})).await;
    assert_eq!(missing_type.status(), StatusCode::NOT_FOUND);
}
