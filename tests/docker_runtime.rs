//! Docker client tests against a fake Engine API served on an ephemeral port.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use exec_sandbox::demux::encode_frame;
use exec_sandbox::docker::DockerRuntime;
use exec_sandbox::{ExecutionPolicy, Executor, SandboxRuntime};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
struct Script {
    exit_code: i64,
    hang: bool,
    logs: Vec<u8>,
}

#[derive(Default)]
struct Engine {
    script: Option<Script>,
    create_error: Option<(u16, String)>,
    stall_kill: bool,
    images: Vec<String>,
    created: Vec<(String, Value)>,
    containers: HashMap<String, Script>,
    started: Vec<String>,
    killed: Vec<String>,
    removed: Vec<String>,
}

type Shared = Arc<Mutex<Engine>>;

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "message": format!("No such container: {id}") })),
    )
        .into_response()
}

async fn create(
    State(engine): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    let mut engine = engine.lock().unwrap();
    if let Some((status, message)) = engine.create_error.clone() {
        return (
            StatusCode::from_u16(status).unwrap(),
            Json(json!({ "message": message })),
        )
            .into_response();
    }
    let id = format!("c{:04}", engine.created.len() + 1);
    let name = query.get("name").cloned().unwrap_or_default();
    engine.created.push((name, body));
    let script = engine.script.clone().expect("script");
    engine.containers.insert(id.clone(), script);
    (StatusCode::CREATED, Json(json!({ "Id": id, "Warnings": [] }))).into_response()
}

async fn start(State(engine): State<Shared>, Path(id): Path<String>) -> Response {
    let mut engine = engine.lock().unwrap();
    if !engine.containers.contains_key(&id) {
        return not_found(&id);
    }
    engine.started.push(id);
    StatusCode::NO_CONTENT.into_response()
}

async fn wait(State(engine): State<Shared>, Path(id): Path<String>) -> Response {
    let script = engine.lock().unwrap().containers.get(&id).cloned();
    let Some(script) = script else {
        return not_found(&id);
    };
    if script.hang {
        tokio::time::sleep(Duration::from_secs(30)).await;
    }
    Json(json!({ "StatusCode": script.exit_code, "Error": null })).into_response()
}

async fn kill(State(engine): State<Shared>, Path(id): Path<String>) -> Response {
    let stalled = engine.lock().unwrap().stall_kill;
    if stalled {
        tokio::time::sleep(Duration::from_secs(30)).await;
    }
    let mut engine = engine.lock().unwrap();
    match engine.containers.get(&id) {
        None => not_found(&id),
        Some(script) if !script.hang => (
            StatusCode::CONFLICT,
            Json(json!({ "message": format!("Container {id} is not running") })),
        )
            .into_response(),
        Some(_) => {
            engine.killed.push(id);
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

async fn logs(
    State(engine): State<Shared>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    assert_eq!(query.get("stdout").map(String::as_str), Some("true"));
    assert_eq!(query.get("stderr").map(String::as_str), Some("true"));
    let engine = engine.lock().unwrap();
    match engine.containers.get(&id) {
        Some(script) => (StatusCode::OK, script.logs.clone()).into_response(),
        None => not_found(&id),
    }
}

async fn remove(
    State(engine): State<Shared>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    assert_eq!(query.get("force").map(String::as_str), Some("true"));
    let mut engine = engine.lock().unwrap();
    if engine.containers.remove(&id).is_none() {
        return not_found(&id);
    }
    engine.removed.push(id);
    StatusCode::NO_CONTENT.into_response()
}

async fn inspect_image(State(engine): State<Shared>, Path(rest): Path<String>) -> Response {
    let engine = engine.lock().unwrap();
    let rest = rest.trim_start_matches('/');
    let found = engine
        .images
        .iter()
        .any(|image| rest == format!("{image}/json"));
    if found {
        Json(json!({ "Id": "sha256:feed" })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": format!("No such image: {rest}") })),
        )
            .into_response()
    }
}

async fn spawn_engine(engine: Shared) -> String {
    let app = Router::new()
        .route("/containers/create", post(create))
        .route("/containers/:id/start", post(start))
        .route("/containers/:id/wait", post(wait))
        .route("/containers/:id/kill", post(kill))
        .route("/containers/:id/logs", get(logs))
        .route("/containers/:id", delete(remove))
        .route("/images/*rest", get(inspect_image))
        .with_state(engine);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn engine_with(script: Script) -> Shared {
    Arc::new(Mutex::new(Engine {
        script: Some(script),
        images: vec!["python:3.11-alpine".to_string()],
        ..Engine::default()
    }))
}

#[tokio::test]
async fn executes_and_removes_container() {
    let mut logs = encode_frame(1, b"Hello, ");
    logs.extend(encode_frame(2, b"warning\n"));
    logs.extend(encode_frame(1, b"World!\n"));
    let engine = engine_with(Script {
        exit_code: 0,
        hang: false,
        logs,
    });
    let url = spawn_engine(engine.clone()).await;
    let executor = Executor::new(
        Arc::new(DockerRuntime::new(&url).unwrap()),
        ExecutionPolicy::default(),
    );

    let result = executor
        .execute("print(\"Hello, World!\")", Some("s1"))
        .await;

    assert!(result.success);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "Hello, World!\n");
    assert_eq!(result.stderr, "warning\n");

    let engine = engine.lock().unwrap();
    assert_eq!(engine.started, vec!["c0001"]);
    assert_eq!(engine.removed, vec!["c0001"]);
    assert!(engine.killed.is_empty());
    assert!(engine.containers.is_empty());

    let (name, body) = &engine.created[0];
    assert!(name.starts_with("exec-"));
    assert_eq!(
        body["Cmd"],
        json!(["python3", "-c", "print(\"Hello, World!\")"])
    );
    assert_eq!(body["Tty"], false);
    assert_eq!(body["HostConfig"]["NetworkMode"], "none");
    assert_eq!(body["HostConfig"]["ReadonlyRootfs"], true);
    assert_eq!(body["HostConfig"]["CapDrop"], json!(["ALL"]));
    assert_eq!(body["HostConfig"]["MemorySwap"], body["HostConfig"]["Memory"]);
}

#[tokio::test]
async fn nonzero_exit_is_reported() {
    let mut logs = encode_frame(1, b"before\n");
    logs.extend(encode_frame(2, b"NameError: name 'x' is not defined\n"));
    let engine = engine_with(Script {
        exit_code: 1,
        hang: false,
        logs,
    });
    let url = spawn_engine(engine.clone()).await;
    let executor = Executor::new(
        Arc::new(DockerRuntime::new(&url).unwrap()),
        ExecutionPolicy::default(),
    );

    let result = executor.execute("print('before')\nx", None).await;

    assert!(!result.success);
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.stdout, "before\n");
    assert!(result.stderr.contains("NameError"));
    assert!(engine.lock().unwrap().containers.is_empty());
}

#[tokio::test]
async fn timeout_kills_and_removes_container() {
    let engine = engine_with(Script {
        exit_code: 137,
        hang: true,
        logs: encode_frame(1, b"spinning\n"),
    });
    let url = spawn_engine(engine.clone()).await;
    let policy = ExecutionPolicy {
        time_limit: Duration::from_millis(200),
        ..ExecutionPolicy::default()
    };
    let executor = Executor::new(Arc::new(DockerRuntime::new(&url).unwrap()), policy);

    let started = std::time::Instant::now();
    let result = executor.execute("while True: pass", None).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.exit_code, -1);
    assert!(result.stderr.contains("timed out after 200ms"));
    assert_eq!(result.stdout, "spinning\n");

    let engine = engine.lock().unwrap();
    assert_eq!(engine.killed, vec!["c0001"]);
    assert_eq!(engine.removed, vec!["c0001"]);
}

#[tokio::test]
async fn unanswered_kill_does_not_block_removal() {
    let engine = engine_with(Script {
        exit_code: 137,
        hang: true,
        logs: encode_frame(1, b"spinning\n"),
    });
    engine.lock().unwrap().stall_kill = true;
    let url = spawn_engine(engine.clone()).await;
    let policy = ExecutionPolicy {
        time_limit: Duration::from_millis(200),
        cleanup_grace: Duration::from_millis(200),
        ..ExecutionPolicy::default()
    };
    let executor = Executor::new(Arc::new(DockerRuntime::new(&url).unwrap()), policy);

    let started = std::time::Instant::now();
    let result = executor.execute("while True: pass", None).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.exit_code, -1);
    assert!(result.stderr.contains("timed out after 200ms"));
    assert_eq!(result.stdout, "spinning\n");

    let engine = engine.lock().unwrap();
    assert!(engine.killed.is_empty());
    assert_eq!(engine.removed, vec!["c0001"]);
    assert!(engine.containers.is_empty());
}

#[tokio::test]
async fn creation_error_message_is_surfaced() {
    let engine = engine_with(Script {
        exit_code: 0,
        hang: false,
        logs: Vec::new(),
    });
    engine.lock().unwrap().create_error =
        Some((404, "No such image: python:3.11-alpine".to_string()));
    let url = spawn_engine(engine.clone()).await;
    let executor = Executor::new(
        Arc::new(DockerRuntime::new(&url).unwrap()),
        ExecutionPolicy::default(),
    );

    let result = executor.execute("print(1)", None).await;

    assert_eq!(result.exit_code, -1);
    assert!(result.stderr.contains("No such image: python:3.11-alpine"));
    assert!(engine.lock().unwrap().removed.is_empty());
}

#[tokio::test]
async fn remove_twice_is_ok() {
    let engine = engine_with(Script {
        exit_code: 0,
        hang: false,
        logs: Vec::new(),
    });
    let url = spawn_engine(engine.clone()).await;
    let runtime = DockerRuntime::new(&url).unwrap();

    let id = runtime
        .create(&ExecutionPolicy::default(), "print(1)")
        .await
        .unwrap();
    runtime.remove(&id).await.unwrap();
    runtime.remove(&id).await.unwrap();

    assert_eq!(engine.lock().unwrap().removed, vec![id]);
}

#[tokio::test]
async fn image_lookup_reports_presence() {
    let engine = engine_with(Script {
        exit_code: 0,
        hang: false,
        logs: Vec::new(),
    });
    let url = spawn_engine(engine).await;
    let runtime = DockerRuntime::new(&url).unwrap();

    assert!(runtime.image_available("python:3.11-alpine").await.unwrap());
    assert!(!runtime.image_available("python:2.7").await.unwrap());
}

#[tokio::test]
async fn unreachable_daemon_is_a_creation_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let executor = Executor::new(
        Arc::new(DockerRuntime::new(&format!("http://{addr}")).unwrap()),
        ExecutionPolicy::default(),
    );
    let result = executor.execute("print(1)", None).await;

    assert!(!result.success);
    assert_eq!(result.exit_code, -1);
    assert!(result.stderr.starts_with("Failed to start execution"));
}
