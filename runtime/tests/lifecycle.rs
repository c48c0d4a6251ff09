//! Pull an image, then drive a container through its lifecycle on the
//! fake sandbox.

mod support;

use std::time::Duration;

use andock_core::container::ContainerStatus;
use andock_core::error::AndockError;
use andock_core::exec::{ExecRequest, ExecResult};
use andock_core::log::LogStream;
use andock_runtime::{CreateRequest, ExecIo};
use support::{config, layer, runtime, FakeRegistry};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_container_lifecycle_on_pulled_image() {
    let registry = FakeRegistry::start().await;
    registry.publish(
        "library/alpine",
        "latest",
        &[layer(&[("etc/hostname", b"fake\n")])],
    );

    let tmp = TempDir::new().unwrap();
    let (runtime, sandbox) = runtime(config(tmp.path(), vec![registry.seed("fake", 100)])).await;
    let image = runtime
        .pull("alpine", None, CancellationToken::new())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let containers = &runtime.containers;
    let created = containers
        .create(CreateRequest {
            image: "alpine".to_string(),
            name: Some("web".to_string()),
            env: vec!["MODE=test".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(created.status, ContainerStatus::Created);
    assert_eq!(created.image_id, image.id);
    assert_eq!(created.command, vec!["/bin/sh".to_string()]);
    assert!(created.rootfs.join("etc/hostname").exists());

    let running = containers.start("web").await.unwrap();
    assert_eq!(running.status, ContainerStatus::Running);
    let spec = sandbox.spec(&created.id).unwrap();
    assert!(spec.env.iter().any(|e| e == "MODE=test"));

    sandbox.set_exec_result(ExecResult {
        exit_code: 0,
        stdout: b"hello\n".to_vec(),
        stderr: Vec::new(),
    });
    let result = containers
        .exec(
            "web",
            &ExecRequest {
                cmd: vec!["echo".to_string(), "hello".to_string()],
                ..Default::default()
            },
            ExecIo::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.stdout_lossy(), "hello\n");

    sandbox.emit(&created.id, LogStream::Stdout, "serving\n").await;

    // Images in use need force
    let err = runtime.remove_image("alpine", false).await.unwrap_err();
    assert!(matches!(err, AndockError::Conflict(_)), "{err}");

    sandbox.exit(&created.id, 3);
    let code = tokio::time::timeout(Duration::from_secs(2), containers.wait("web"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code, 3);
    assert_eq!(
        containers.inspect("web").await.unwrap().status,
        ContainerStatus::Exited
    );

    // The log pump writes on a blocking thread
    let mut logs = Vec::new();
    for _ in 0..50 {
        logs = containers.logs("web", None).await.unwrap();
        if !logs.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].log, "serving\n");

    let info = runtime.info().await.unwrap();
    assert_eq!(info.containers, 1);
    assert_eq!(info.containers_stopped, 1);
    assert_eq!(info.driver, "fake");

    containers.remove("web", false).await.unwrap();
    assert!(!created.rootfs.exists());
    runtime.remove_image("alpine", false).await.unwrap();
    assert!(runtime.images.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_from_missing_image_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let (runtime, _) = runtime(config(tmp.path(), Vec::new())).await;

    let err = runtime
        .containers
        .create(CreateRequest {
            image: "nothere".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AndockError::NotFound { .. }), "{err}");
}

#[tokio::test]
async fn test_image_removal_racing_create_never_orphans_container() {
    let registry = FakeRegistry::start().await;
    registry.publish("library/alpine", "latest", &[layer(&[("etc/issue", b"x\n")])]);

    let tmp = TempDir::new().unwrap();
    let (runtime, _) = runtime(config(tmp.path(), vec![registry.seed("fake", 100)])).await;

    for round in 0..5 {
        let image = runtime
            .pull("alpine", None, CancellationToken::new())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let (created, removed) = tokio::join!(
            runtime.containers.create(CreateRequest {
                image: "alpine".to_string(),
                name: Some(format!("race{round}")),
                ..Default::default()
            }),
            runtime.remove_image("alpine", false)
        );

        match (created, removed) {
            (Ok(container), Err(AndockError::Conflict(_))) => {
                assert!(runtime.images.get(&image.id).await.is_ok());
                runtime.containers.remove(&container.id, false).await.unwrap();
                runtime.remove_image("alpine", false).await.unwrap();
            }
            (Err(AndockError::NotFound { .. }), Ok(_)) => {}
            (created, removed) => panic!("unexpected outcome: {created:?} / {removed:?}"),
        }
        assert!(runtime.containers.list(true).await.unwrap().is_empty());
    }
}
