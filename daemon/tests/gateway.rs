//! Engine API tests against the router, without a listener.

use std::collections::HashMap;
use std::sync::Arc;

use andock_core::config::{DaemonConfig, MirrorSeed};
use andock_core::container::Container;
use andock_core::exec::ExecResult;
use andock_core::image::{Image, ImageConfig};
use andock_core::mirror::Mirror;
use andock_core::store::{EntityStore, MemoryStore};
use andock_daemon::create_router;
use andock_runtime::{FakeSandbox, Runtime, RuntimeParts};
use axum::body::Body;
use axum::extract::Query;
use axum::http::{Method, Request, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const IMAGE_ID: &str = "sha256:aaaabbbbccccddddeeeeffff0000111122223333444455556666777788889999";

struct Harness {
    router: Router,
    sandbox: Arc<FakeSandbox>,
    _tmp: TempDir,
}

/// A gateway over in-memory stores, holding one layerless `alpine` image.
async fn harness() -> Harness {
    harness_with(|_| {}).await
}

async fn harness_with(adjust: impl FnOnce(&mut DaemonConfig)) -> Harness {
    let tmp = TempDir::new().unwrap();
    let mut config = DaemonConfig {
        data_dir: tmp.path().to_path_buf(),
        tcp_addr: None,
        builtin_mirrors: Vec::new(),
        max_retries: 0,
        stop_grace_secs: 1,
        ..DaemonConfig::default()
    };
    adjust(&mut config);

    let images = Arc::new(MemoryStore::<Image>::new());
    images
        .put(&Image {
            id: IMAGE_ID.to_string(),
            repo_tags: vec!["docker.io/library/alpine:latest".to_string()],
            config_digest: "sha256:cfg".to_string(),
            layers: Vec::new(),
            size: 0,
            created: chrono::Utc::now(),
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            config: ImageConfig {
                cmd: Some(vec!["/bin/sh".to_string()]),
                ..Default::default()
            },
        })
        .await
        .unwrap();

    let sandbox = Arc::new(FakeSandbox::new());
    let parts = RuntimeParts {
        images,
        containers: Arc::new(MemoryStore::<Container>::new()),
        mirrors: Arc::new(MemoryStore::<Mirror>::new()),
        sandbox: sandbox.clone(),
    };
    let runtime = Runtime::with_parts(config, parts).await.unwrap();
    Harness {
        router: create_router(Arc::new(runtime)),
        sandbox,
        _tmp: tmp,
    }
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

fn json_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap()
}

async fn create_web(router: &Router) -> String {
    let (status, body) = send(
        router,
        Method::POST,
        "/containers/create?name=web",
        Some(json!({"Image": "alpine", "Env": ["A=1"]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", String::from_utf8_lossy(&body));
    json_body(&body)["Id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_ping_versioned_and_unversioned() {
    let h = harness().await;
    for uri in ["/_ping", "/v1.43/_ping", "/v1.24/_ping"] {
        let (status, body) = send(&h.router, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        assert_eq!(body, b"OK");
    }
    let (status, _) = send(&h.router, Method::HEAD, "/_ping", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&h.router, Method::GET, "/v1.99/_ping", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_version_and_info() {
    let h = harness().await;
    let (status, body) = send(&h.router, Method::GET, "/version", None).await;
    assert_eq!(status, StatusCode::OK);
    let version = json_body(&body);
    assert_eq!(version["ApiVersion"], "1.43");
    assert_eq!(version["MinAPIVersion"], "1.24");

    create_web(&h.router).await;
    let (status, body) = send(&h.router, Method::GET, "/v1.41/info", None).await;
    assert_eq!(status, StatusCode::OK);
    let info = json_body(&body);
    assert_eq!(info["Containers"], 1);
    assert_eq!(info["ContainersStopped"], 1);
    assert_eq!(info["Images"], 1);
    assert_eq!(info["Driver"], "fake");
}

#[tokio::test]
async fn test_unknown_container_is_404_with_message() {
    let h = harness().await;
    let (status, body) = send(&h.router, Method::GET, "/containers/nope/json", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body), json!({"message": "No such container: nope"}));
}

#[tokio::test]
async fn test_container_lifecycle_status_codes() {
    let h = harness().await;
    let id = create_web(&h.router).await;

    // Stopping a created container is a no-op
    let (status, _) = send(&h.router, Method::POST, "/containers/web/stop", None).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);

    let (status, _) = send(&h.router, Method::POST, "/containers/web/start", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(h.sandbox.is_running(&id));

    let (status, _) = send(&h.router, Method::POST, "/containers/web/start", None).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);

    let (status, body) = send(&h.router, Method::GET, "/containers/json", None).await;
    assert_eq!(status, StatusCode::OK);
    let list = json_body(&body);
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["Names"][0], "/web");
    assert_eq!(list[0]["State"], "running");

    let (status, body) = send(&h.router, Method::DELETE, "/containers/web", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json_body(&body)["message"].as_str().unwrap().contains("running"));

    let (status, _) = send(&h.router, Method::POST, "/containers/web/pause", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&h.router, Method::POST, "/containers/web/start", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = send(&h.router, Method::POST, "/containers/web/stop", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = send(&h.router, Method::POST, "/containers/web/unpause", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&h.router, Method::POST, "/containers/web/stop?t=0", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&h.router, Method::POST, "/containers/web/stop", None).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);

    let (status, body) = send(&h.router, Method::POST, "/containers/web/wait", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json_body(&body)["StatusCode"].is_i64());

    let (status, body) = send(&h.router, Method::GET, &format!("/containers/{id}/json"), None).await;
    assert_eq!(status, StatusCode::OK);
    let inspect = json_body(&body);
    assert_eq!(inspect["State"]["Running"], false);
    assert_eq!(inspect["Name"], "/web");

    let (status, _) = send(&h.router, Method::POST, "/containers/web/remove", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&h.router, Method::GET, "/containers/web/json", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_duplicate_name_conflicts() {
    let h = harness().await;
    create_web(&h.router).await;
    let (status, _) = send(
        &h.router,
        Method::POST,
        "/containers/create?name=web",
        Some(json!({"Image": "alpine"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_create_from_missing_image() {
    let h = harness().await;
    let (status, body) = send(
        &h.router,
        Method::POST,
        "/containers/create",
        Some(json!({"Image": "busybox"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json_body(&body)["message"].as_str().unwrap().contains("busybox"));
}

#[tokio::test]
async fn test_exec_streamed_and_detached() {
    let h = harness().await;
    create_web(&h.router).await;
    send(&h.router, Method::POST, "/containers/web/start", None).await;
    h.sandbox.set_exec_result(ExecResult {
        exit_code: 7,
        stdout: b"out\n".to_vec(),
        stderr: b"err\n".to_vec(),
    });

    let (status, body) = send(
        &h.router,
        Method::POST,
        "/containers/web/exec",
        Some(json!({"Cmd": ["sh", "-c", "true"], "AttachStdout": true, "AttachStderr": true})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let exec_id = json_body(&body)["Id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &h.router,
        Method::POST,
        &format!("/exec/{exec_id}/start"),
        Some(json!({"Detach": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let lines: Vec<Value> = String::from_utf8(body)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(lines.contains(&json!({"stream": "stdout", "data": "out\n"})));
    assert!(lines.contains(&json!({"stream": "stderr", "data": "err\n"})));
    assert_eq!(lines.last().unwrap(), &json!({"exitCode": 7}));

    let (status, body) = send(&h.router, Method::GET, &format!("/exec/{exec_id}/json"), None).await;
    assert_eq!(status, StatusCode::OK);
    let inspect = json_body(&body);
    assert_eq!(inspect["ExitCode"], 7);
    assert_eq!(inspect["Running"], false);

    let (_, body) = send(
        &h.router,
        Method::POST,
        "/containers/web/exec",
        Some(json!({"Cmd": ["true"]})),
    )
    .await;
    let exec_id = json_body(&body)["Id"].as_str().unwrap().to_string();
    let (status, body) = send(
        &h.router,
        Method::POST,
        &format!("/exec/{exec_id}/start"),
        Some(json!({"Detach": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        json_body(&body),
        json!({"ExitCode": 7, "Stdout": "out\n", "Stderr": "err\n"})
    );
}

#[tokio::test]
async fn test_exec_in_stopped_container_conflicts() {
    let h = harness().await;
    create_web(&h.router).await;
    let (status, _) = send(
        &h.router,
        Method::POST,
        "/containers/web/exec",
        Some(json!({"Cmd": ["ls"]})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&h.router, Method::GET, "/exec/missing/json", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_images_list_inspect_remove() {
    let h = harness().await;
    let (status, body) = send(&h.router, Method::GET, "/images/json", None).await;
    assert_eq!(status, StatusCode::OK);
    let list = json_body(&body);
    assert_eq!(list[0]["Id"], IMAGE_ID);
    assert_eq!(list[0]["RepoTags"][0], "docker.io/library/alpine:latest");

    let (status, body) = send(&h.router, Method::GET, "/images/alpine/json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["Config"]["Cmd"][0], "/bin/sh");

    create_web(&h.router).await;
    let (status, _) = send(&h.router, Method::DELETE, "/images/alpine", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&h.router, Method::DELETE, "/images/alpine?force=1", None).await;
    assert_eq!(status, StatusCode::OK);
    let report = json_body(&body);
    assert_eq!(report.as_array().unwrap().last().unwrap(), &json!({"Deleted": IMAGE_ID}));

    let (status, _) = send(&h.router, Method::GET, "/images/alpine/json", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_pull_of_present_image_streams_status() {
    let h = harness().await;
    let (status, body) = send(
        &h.router,
        Method::POST,
        "/images/create?fromImage=alpine&tag=latest",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    let last: Value = serde_json::from_str(text.lines().last().unwrap()).unwrap();
    assert_eq!(last["status"], "Status: Image is up to date for alpine:latest");
}

#[tokio::test]
async fn test_pull_rejects_bad_query() {
    let h = harness().await;
    let (status, _) = send(&h.router, Method::POST, "/images/create", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &h.router,
        Method::POST,
        "/images/create?fromImage=INVALID::ref",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_failed_pull_streams_error_kind() {
    let registry = spawn_server(Router::new().fallback(|| async { StatusCode::NOT_FOUND })).await;
    let h = harness_with(|c| c.builtin_mirrors = vec![MirrorSeed::new(&registry, "empty")]).await;

    let (status, body) = send(
        &h.router,
        Method::POST,
        "/images/create?fromImage=busybox&tag=latest",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    let last: Value = serde_json::from_str(text.lines().last().unwrap()).unwrap();
    assert_eq!(last["errorDetail"]["kind"], "NotFoundError", "{text}");
    assert_eq!(last["errorDetail"]["message"], last["error"]);
}

/// Serve `router` on a loopback port and return its base url.
async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_search_keeps_hub_paging() {
    let hub = Router::new().route(
        "/v2/search/repositories/",
        get(|Query(q): Query<HashMap<String, String>>| async move {
            assert_eq!(q.get("query").map(String::as_str), Some("nginx"));
            Json(json!({
                "count": 1,
                "next": "https://hub.example/page2",
                "previous": null,
                "results": [{
                    "repo_name": "nginx",
                    "short_description": "web server",
                    "star_count": 5,
                    "is_official": true,
                    "is_automated": false
                }]
            }))
        }),
    );
    let hub_url = spawn_server(hub).await;
    let h = harness_with(|c| c.search_url = format!("{hub_url}/v2/search/repositories/")).await;

    let (status, body) = send(&h.router, Method::GET, "/images/search?term=nginx", None).await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    let page = json_body(&body);
    assert_eq!(page["count"], 1);
    assert_eq!(page["next"], "https://hub.example/page2");
    assert!(page["previous"].is_null());
    assert_eq!(
        page["results"][0],
        json!({
            "name": "nginx",
            "description": "web server",
            "star_count": 5,
            "is_official": true,
            "is_automated": false
        })
    );

    let (status, _) = send(&h.router, Method::GET, "/images/search", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_mirror_crud() {
    let h = harness().await;
    let (status, body) = send(
        &h.router,
        Method::POST,
        "/mirrors",
        Some(json!({"url": "https://mirror.example.com/", "name": "example", "priority": 5})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let mirror = json_body(&body);
    assert_eq!(mirror["url"], "https://mirror.example.com");
    assert_eq!(mirror["is_selected"], true);

    let (status, _) = send(
        &h.router,
        Method::POST,
        "/mirrors",
        Some(json!({"url": "https://mirror.example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let encoded = "https%3A%2F%2Fmirror.example.com";
    let (status, body) = send(
        &h.router,
        Method::PATCH,
        &format!("/mirrors/{encoded}"),
        Some(json!({"is_selected": false, "priority": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    let mirror = json_body(&body);
    assert_eq!(mirror["is_selected"], false);
    assert_eq!(mirror["priority"], 1);

    let (status, body) = send(&h.router, Method::GET, "/mirrors", None).await;
    assert_eq!(status, StatusCode::OK);
    let list = json_body(&body);
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["url"], "https://mirror.example.com");
    assert_eq!(list[0]["health"]["consecutive_failures"], 0);

    let (status, _) = send(&h.router, Method::DELETE, &format!("/mirrors/{encoded}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&h.router, Method::DELETE, &format!("/mirrors/{encoded}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &h.router,
        Method::POST,
        "/mirrors",
        Some(json!({"url": "ftp://nope"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_metrics_exposition() {
    let h = harness().await;
    create_web(&h.router).await;
    let (status, body) = send(&h.router, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("andock_containers"));
}

#[tokio::test]
async fn test_logs_endpoint_filters_streams() {
    let h = harness().await;
    let id = create_web(&h.router).await;
    send(&h.router, Method::POST, "/containers/web/start", None).await;
    h.sandbox
        .emit(&id, andock_core::log::LogStream::Stdout, "to stdout\n")
        .await;
    h.sandbox
        .emit(&id, andock_core::log::LogStream::Stderr, "to stderr\n")
        .await;

    // The log pump writes on a blocking thread
    let mut text = String::new();
    for _ in 0..50 {
        let (_, body) = send(&h.router, Method::GET, "/containers/web/logs", None).await;
        text = String::from_utf8(body).unwrap();
        if text.lines().count() == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(text.contains("to stdout\n") && text.contains("to stderr\n"));

    let (status, body) = send(
        &h.router,
        Method::GET,
        "/containers/web/logs?stderr=1&tail=all",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), "to stderr\n");

    let (status, _) = send(&h.router, Method::GET, "/containers/web/logs?tail=x", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
