use axum::http::StatusCode;
use axum_test::TestServer;
use runlet_api::AppState;
use runlet_api::config::AppConfig;
use runlet_api::server::{build_state, create_router};
use serde_json::{Value, json};
use tempfile::TempDir;

const TOKEN: &str = "test-admin-token";

fn server_with(configure: impl FnOnce(&mut AppConfig)) -> (TempDir, TestServer, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.store.index = dir.path().to_path_buf();
    config.auth.admin_token = Some(TOKEN.to_string());
    config.sandbox.max_exec_time = 2;
    configure(&mut config);

    let state = build_state(config).unwrap();
    let server = TestServer::new(create_router(state.clone()).unwrap()).unwrap();
    (dir, server, state)
}

fn server() -> (TempDir, TestServer, AppState) {
    server_with(|_| {})
}

#[tokio::test]
async fn test_public_greeting_and_health() {
    let (_dir, server, _state) = server();

    let health = server.get("/health").await;
    assert_eq!(health.status_code(), StatusCode::OK);
    assert_eq!(health.json::<Value>()["status"], "ok");

    let greeting = server.get("/").await.json::<Value>();
    assert_eq!(greeting["success"], true);
    assert!(greeting["data"].as_str().unwrap().contains("runlet"));
}

#[tokio::test]
async fn test_admin_routes_require_bearer_token() {
    let (_dir, server, _state) = server();

    let missing = server.post("/").text("exports.x = 1;").await;
    assert_eq!(missing.status_code(), StatusCode::BAD_REQUEST);
    let body = missing.json::<Value>();
    assert_eq!(body["success"], false);
    assert_eq!(body["kind"], "AuthError");

    let wrong = server
        .get("/globals/vars")
        .authorization_bearer("nope")
        .await;
    assert_eq!(wrong.status_code(), StatusCode::UNAUTHORIZED);

    let ok = server
        .get("/globals/vars")
        .authorization_bearer(TOKEN)
        .await;
    assert_eq!(ok.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_configured_token_is_trimmed() {
    let (_dir, server, _state) =
        server_with(|config| config.auth.admin_token = Some(format!("  {TOKEN} \n")));

    let ok = server
        .get("/globals/vars")
        .authorization_bearer(TOKEN)
        .await;
    assert_eq!(ok.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_execute_script() {
    let (_dir, server, _state) = server();

    let response = server
        .post("/")
        .authorization_bearer(TOKEN)
        .text(r#"exports.sum = 1 + 2; exports.hash = utils::md5("abc");"#)
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(
        response.json::<Value>(),
        json!({
            "success": true,
            "result": {"sum": 3, "hash": "900150983cd24fb0d6963f7d28e17f72"}
        })
    );
}

#[tokio::test]
async fn test_execute_failures_map_to_status_codes() {
    let (_dir, server, _state) = server_with(|config| config.sandbox.max_exec_time = 1);

    let empty = server.post("/").authorization_bearer(TOKEN).text("  ").await;
    assert_eq!(empty.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(empty.json::<Value>()["kind"], "InputError");

    let syntax = server
        .post("/")
        .authorization_bearer(TOKEN)
        .text("let = ;")
        .await;
    assert_eq!(syntax.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(syntax.json::<Value>()["kind"], "SyntaxError");

    let looping = server
        .post("/")
        .authorization_bearer(TOKEN)
        .text("loop { }")
        .await;
    assert_eq!(looping.status_code(), StatusCode::REQUEST_TIMEOUT);
    let body = looping.json::<Value>();
    assert_eq!(body["success"], false);
    assert_eq!(body["kind"], "Timeout");
    assert!(body["error"].as_str().unwrap().contains("(1 sec)"));
}

#[tokio::test]
async fn test_procedure_lifecycle() {
    let (_dir, server, _state) = server();

    let saved = server
        .post("/procedure/hello")
        .authorization_bearer(TOKEN)
        .add_query_param("tags", "demo,,web")
        .text(r#"exports.msg = "hello " + request.query.name; exports.method = request.method;"#)
        .await;
    assert_eq!(saved.status_code(), StatusCode::OK);
    assert_eq!(saved.json::<Value>()["data"]["tags"], json!(["demo", "web"]));

    let found = server
        .post("/procedure/search")
        .authorization_bearer(TOKEN)
        .json(&json!({"query": "+tags:web"}))
        .await
        .json::<Value>();
    assert_eq!(found["data"]["total"], 1);
    assert_eq!(found["data"]["hits"][0]["key"], "hello");

    // Running a procedure is public.
    let ran = server
        .get("/procedure/hello/result")
        .add_query_param("name", "bob")
        .await;
    assert_eq!(ran.status_code(), StatusCode::OK);
    assert_eq!(
        ran.json::<Value>(),
        json!({"success": true, "result": {"msg": "hello bob", "method": "GET"}})
    );

    let deleted = server
        .delete("/procedure/hello")
        .authorization_bearer(TOKEN)
        .await;
    assert_eq!(deleted.status_code(), StatusCode::OK);

    let gone = server.get("/procedure/hello/result").await;
    assert_eq!(gone.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(gone.json::<Value>()["kind"], "NotFound");
}

#[tokio::test]
async fn test_procedure_sees_posted_json_body() {
    let (_dir, server, _state) = server();

    server
        .post("/procedure/echo")
        .authorization_bearer(TOKEN)
        .text("exports.name = request.body.name; exports.proto = request.proto;")
        .await;

    let ran = server
        .post("/procedure/echo/result")
        .json(&json!({"name": "runlet"}))
        .await;
    assert_eq!(ran.status_code(), StatusCode::OK);
    let body = ran.json::<Value>();
    assert_eq!(body["result"]["name"], "runlet");
    assert!(body["result"]["proto"].as_str().unwrap().starts_with("HTTP/"));
}

#[tokio::test]
async fn test_procedures_cannot_manage_crons() {
    let (_dir, server, state) = server();

    server
        .post("/procedure/sneaky")
        .authorization_bearer(TOKEN)
        .text(r#"cron::set("x", "@hourly", "|| 1");"#)
        .await;

    let ran = server.get("/procedure/sneaky/result").await;
    assert_eq!(ran.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(state.store.crons_get().is_empty());

    // The admin execution endpoint may.
    let admin = server
        .post("/")
        .authorization_bearer(TOKEN)
        .text(r#"cron::set("x", "@hourly", "|| 1");"#)
        .await;
    assert_eq!(admin.status_code(), StatusCode::OK);
    assert!(state.store.crons_get().contains_key("x"));
}

#[tokio::test]
async fn test_search_rejects_bad_input() {
    let (_dir, server, _state) = server();

    let bad_query = server
        .post("/procedure/search")
        .authorization_bearer(TOKEN)
        .json(&json!({"query": "colour:red"}))
        .await;
    assert_eq!(bad_query.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(bad_query.json::<Value>()["kind"], "QuerySyntaxError");

    let bad_json = server
        .post("/procedure/search")
        .authorization_bearer(TOKEN)
        .text("{not json")
        .await;
    assert_eq!(bad_json.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(bad_json.json::<Value>()["kind"], "InputError");

    let everything = server
        .post("/procedure/search")
        .authorization_bearer(TOKEN)
        .await;
    assert_eq!(everything.status_code(), StatusCode::OK);
    assert_eq!(everything.json::<Value>()["data"]["total"], 0);
}

#[tokio::test]
async fn test_globals_routes() {
    let (_dir, server, _state) = server();

    server
        .post("/globals/vars")
        .authorization_bearer(TOKEN)
        .json(&json!({"a": 1}))
        .await;
    let set = server
        .post("/globals/var/b")
        .authorization_bearer(TOKEN)
        .json(&json!({"nested": true}))
        .await
        .json::<Value>();
    assert_eq!(set["data"], json!({"a": 1, "b": {"nested": true}}));

    let unset = server
        .delete("/globals/var/a")
        .authorization_bearer(TOKEN)
        .await
        .json::<Value>();
    assert_eq!(unset["data"], json!({"b": {"nested": true}}));

    let listed = server
        .get("/globals/vars")
        .authorization_bearer(TOKEN)
        .await
        .json::<Value>();
    assert_eq!(listed, json!({"success": true, "data": {"b": {"nested": true}}}));

    let not_object = server
        .post("/globals/vars")
        .authorization_bearer(TOKEN)
        .json(&json!([1, 2]))
        .await;
    assert_eq!(not_object.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

    // Scripts see the merged map.
    let ran = server
        .post("/")
        .authorization_bearer(TOKEN)
        .text("exports.nested = globals.b.nested;")
        .await
        .json::<Value>();
    assert_eq!(ran["result"]["nested"], true);
}

#[tokio::test]
async fn test_cron_routes() {
    let (_dir, server, state) = server();
    let mut reload = state.store.take_reload_receiver().unwrap();

    let set = server
        .post("/crons/tick")
        .authorization_bearer(TOKEN)
        .json(&json!({"interval": "@hourly", "job": "|| 1"}))
        .await;
    assert_eq!(set.status_code(), StatusCode::OK);
    assert_eq!(
        set.json::<Value>()["data"]["tick"],
        json!({"interval": "@hourly", "job": "|| 1"})
    );
    assert!(reload.try_recv().is_ok());

    let invalid = server
        .post("/crons/bad")
        .authorization_bearer(TOKEN)
        .json(&json!({"interval": "whenever", "job": "|| 1"}))
        .await;
    assert_eq!(invalid.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(invalid.json::<Value>()["kind"], "InvalidSchedule");

    let missing_job = server
        .post("/crons/bad")
        .authorization_bearer(TOKEN)
        .json(&json!({"interval": "@daily"}))
        .await;
    assert_eq!(missing_job.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

    let removed = server
        .delete("/crons/tick")
        .authorization_bearer(TOKEN)
        .await
        .json::<Value>();
    assert_eq!(removed["data"], json!({}));
    assert!(reload.try_recv().is_ok());
}

#[tokio::test]
async fn test_body_limit() {
    let (_dir, server, _state) = server_with(|config| config.server.max_body_size = "1K".into());

    let script = format!("exports.x = \"{}\";", "a".repeat(4096));
    let response = server
        .post("/")
        .authorization_bearer(TOKEN)
        .text(script)
        .await;
    assert_eq!(response.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = response.json::<Value>();
    assert_eq!(body["success"], false);
    assert_eq!(body["kind"], "InputError");
    assert!(body["error"].as_str().unwrap().contains("length limit exceeded"));
}

#[tokio::test]
async fn test_request_timeout_and_unknown_routes_are_json() {
    let (_dir, server, _state) = server_with(|config| {
        config.server.request_timeout_secs = 1;
        config.sandbox.max_exec_time = 5;
    });

    let response = server
        .post("/")
        .authorization_bearer(TOKEN)
        .text("loop { }")
        .await;
    assert_eq!(response.status_code(), StatusCode::REQUEST_TIMEOUT);
    let body = response.json::<Value>();
    assert_eq!(body["success"], false);
    assert_eq!(body["kind"], "Timeout");

    let response = server.get("/no/such/route").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let body = response.json::<Value>();
    assert_eq!(body["success"], false);
    assert_eq!(body["kind"], "NotFound");
}

#[tokio::test]
async fn test_execute_sees_request_descriptor() {
    let (_dir, server, _state) = server();

    let response = server
        .post("/")
        .add_query_param("name", "bob")
        .authorization_bearer(TOKEN)
        .text("exports.name = request.query.name; exports.body = request.body;")
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(
        response.json::<Value>()["result"],
        json!({"name": "bob", "body": null})
    );
}
