// ABOUTME: Integration tests for sandbox lifecycle against the in-memory engine
// ABOUTME: Covers create, naming conflicts, port collisions, pause/resume, kill, host URLs and export

use csbx_sandbox::constants::{LABEL_MANAGED, LABEL_NAME};
use csbx_sandbox::{
    CreateSandboxRequest, EngineChoice, ExportRequest, MockEngine, Mount, PortMapping,
    SandboxClient, SandboxError, SandboxSettings, SandboxState,
};
use flate2::read::GzDecoder;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (Arc<MockEngine>, SandboxClient) {
    let engine = Arc::new(MockEngine::new());
    let client = SandboxClient::new(engine.clone(), SandboxSettings::default());
    (engine, client)
}

fn named(name: &str) -> CreateSandboxRequest {
    CreateSandboxRequest {
        name: Some(name.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_then_resolve_by_every_token_form() {
    let (_engine, client) = setup();
    let created = client.sandboxes.create(named("test-1")).await.unwrap();

    assert_eq!(created.name, "test-1");
    assert_eq!(created.container_name, "csbx-test-1");
    assert_eq!(created.template, "docker-sandbox:base");
    assert_eq!(created.state, SandboxState::Running);

    for token in [
        created.id.as_str(),
        "test-1",
        "csbx-test-1",
        &created.id[..8],
    ] {
        let resolved = client.sandboxes.resolve(token).await.unwrap();
        assert_eq!(resolved.id, created.id, "token {}", token);
    }

    // Resolving twice gives the same sandbox
    let again = client.sandboxes.resolve("test-1").await.unwrap();
    assert_eq!(again.id, created.id);
}

#[tokio::test]
async fn test_explicit_name_collision_creates_nothing() {
    let (engine, client) = setup();
    client.sandboxes.create(named("dup")).await.unwrap();
    let calls = engine.create_calls();

    let err = client.sandboxes.create(named("dup")).await.unwrap_err();
    assert!(matches!(err, SandboxError::NameInUse(ref name) if name == "dup"));
    assert_eq!(engine.container_count(), 1);
    assert_eq!(engine.create_calls(), calls);
}

#[tokio::test]
async fn test_generated_names_are_unique() {
    let (_engine, client) = setup();
    let a = client
        .sandboxes
        .create(CreateSandboxRequest::default())
        .await
        .unwrap();
    let b = client
        .sandboxes
        .create(CreateSandboxRequest::default())
        .await
        .unwrap();
    assert_ne!(a.name, b.name);
    assert_eq!(client.sandboxes.list(&[]).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_invalid_name_is_rejected() {
    let (engine, client) = setup();
    let err = client.sandboxes.create(named("bad name!")).await.unwrap_err();
    assert!(matches!(err, SandboxError::InvalidRequest(_)));
    assert_eq!(engine.create_calls(), 0);
}

#[tokio::test]
async fn test_missing_template_is_pulled() {
    let (engine, client) = setup();
    engine.add_pullable_image("python:3.12-slim");

    let sandbox = client
        .sandboxes
        .create(CreateSandboxRequest {
            template: Some("python:3.12-slim".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(sandbox.template, "python:3.12-slim");
    assert!(engine.has_image("python:3.12-slim"));
}

#[tokio::test]
async fn test_unknown_template_surfaces_engine_error() {
    let (engine, client) = setup();
    let err = client
        .sandboxes
        .create(CreateSandboxRequest {
            template: Some("nope:latest".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), Some(404));
    assert_eq!(engine.container_count(), 0);
}

#[tokio::test]
async fn test_duplicate_host_port_fails_and_first_keeps_running() {
    let (engine, client) = setup();
    let ports = vec![PortMapping::new(18080, 8000)];

    let first = client
        .sandboxes
        .create(CreateSandboxRequest {
            name: Some("first".to_string()),
            ports: ports.clone(),
            ..Default::default()
        })
        .await
        .unwrap();

    let err = client
        .sandboxes
        .create(CreateSandboxRequest {
            name: Some("second".to_string()),
            ports,
            ..Default::default()
        })
        .await
        .unwrap_err();
    match &err {
        SandboxError::EngineCall { message, .. } => {
            assert!(message.contains("port is already allocated"), "{}", message)
        }
        other => panic!("expected EngineCall, got {:?}", other),
    }

    // The half-created second container is cleaned up
    assert_eq!(engine.container_count(), 1);
    assert!(client.sandboxes.is_running(&first.id).await.unwrap());
}

#[tokio::test]
async fn test_repeated_ports_in_one_request_are_rejected() {
    let (engine, client) = setup();
    let err = client
        .sandboxes
        .create(CreateSandboxRequest {
            ports: vec![PortMapping::new(9000, 80), PortMapping::new(9000, 81)],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::InvalidRequest(_)));
    assert_eq!(engine.create_calls(), 0);
}

#[tokio::test]
async fn test_get_host() {
    let (_engine, client) = setup();
    client
        .sandboxes
        .create(CreateSandboxRequest {
            name: Some("web".to_string()),
            ports: vec![PortMapping::new(18081, 8000)],
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(
        client.sandboxes.get_host("web", 8000).await.unwrap(),
        "http://127.0.0.1:18081"
    );
    assert!(matches!(
        client.sandboxes.get_host("web", 9999).await,
        Err(SandboxError::PortNotMapped { port: 9999, .. })
    ));
}

#[tokio::test]
async fn test_pause_and_resume() {
    let (_engine, client) = setup();
    client.sandboxes.create(named("pz")).await.unwrap();

    let paused = client.sandboxes.pause("pz").await.unwrap();
    assert_eq!(paused.state, SandboxState::Paused);

    let err = client.sandboxes.pause("pz").await.unwrap_err();
    assert!(matches!(
        err,
        SandboxError::InvalidState {
            expected: SandboxState::Running,
            actual: SandboxState::Paused,
            ..
        }
    ));

    let resumed = client.sandboxes.resume("pz").await.unwrap();
    assert_eq!(resumed.state, SandboxState::Running);

    assert!(matches!(
        client.sandboxes.resume("pz").await,
        Err(SandboxError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_kill_is_terminal() {
    let (engine, client) = setup();
    let sandbox = client.sandboxes.create(named("doomed")).await.unwrap();

    client.sandboxes.kill("doomed").await.unwrap();
    assert_eq!(engine.container_count(), 0);
    assert!(matches!(
        client.sandboxes.resolve(&sandbox.id).await,
        Err(SandboxError::SandboxNotFound(_))
    ));
    assert!(matches!(
        client.sandboxes.kill("doomed").await,
        Err(SandboxError::SandboxNotFound(_))
    ));
}

#[tokio::test]
async fn test_kill_paused_sandbox() {
    let (engine, client) = setup();
    client.sandboxes.create(named("frozen")).await.unwrap();
    client.sandboxes.pause("frozen").await.unwrap();

    client.sandboxes.kill("frozen").await.unwrap();
    assert_eq!(engine.container_count(), 0);
}

#[tokio::test]
async fn test_list_ignores_unmanaged_containers_and_filters_metadata() {
    let (engine, client) = setup();
    engine.insert_container("someone-elses", HashMap::new());
    engine.insert_container(
        "adopted",
        HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_NAME.to_string(), "adopted".to_string()),
        ]),
    );

    client
        .sandboxes
        .create(CreateSandboxRequest {
            name: Some("tagged".to_string()),
            metadata: HashMap::from([("team".to_string(), "infra".to_string())]),
            ..Default::default()
        })
        .await
        .unwrap();

    let all = client.sandboxes.list(&[]).await.unwrap();
    let names: Vec<&str> = all.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(all.len(), 2, "{:?}", names);
    assert!(names.contains(&"adopted"));
    assert!(names.contains(&"tagged"));

    let filtered = client
        .sandboxes
        .list(&["csbx.metadata.team=infra".to_string()])
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].name, "tagged");
    assert_eq!(
        filtered[0].metadata().get("team").map(String::as_str),
        Some("infra")
    );
}

#[tokio::test]
async fn test_vanished_sandbox_is_not_found() {
    let (engine, client) = setup();
    let sandbox = client.sandboxes.create(named("ghost")).await.unwrap();
    engine.vanish(&sandbox.id);

    assert!(matches!(
        client.sandboxes.get("ghost").await,
        Err(SandboxError::SandboxNotFound(_))
    ));
}

#[tokio::test]
async fn test_export_writes_gzipped_tar() {
    let (engine, client) = setup();
    let sandbox = client.sandboxes.create(named("exp")).await.unwrap();
    engine.put_file(&sandbox.id, "/home/user/app/main.py", b"print('hi')\n");

    let out = tempfile::tempdir().unwrap();
    let artifact = client
        .sandboxes
        .export(
            "exp",
            ExportRequest {
                output_dir: out.path().to_path_buf(),
                name: Some("snapshot".to_string()),
                path: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(artifact.path, out.path().join("snapshot.tar.gz"));
    assert!(artifact.byte_count > 0);

    let file = std::fs::File::open(&artifact.path).unwrap();
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let paths: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
        .collect();
    assert!(
        paths.iter().any(|p| p.trim_end_matches('/') == "user/app/main.py"),
        "{:?}",
        paths
    );
}

#[tokio::test]
async fn test_interrupted_export_leaves_nothing() {
    let (engine, client) = setup();
    let sandbox = client.sandboxes.create(named("cut")).await.unwrap();
    engine.put_file(&sandbox.id, "/home/user/big.bin", &vec![7u8; 8192]);
    engine.interrupt_copy_out(true);

    let out = tempfile::tempdir().unwrap();
    let err = client
        .sandboxes
        .export(
            "cut",
            ExportRequest {
                output_dir: out.path().to_path_buf(),
                name: Some("partial".to_string()),
                path: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Transfer { .. }), "{:?}", err);
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_engine_stays_selected_until_reset() {
    let engine = Arc::new(MockEngine::new());
    let settings = SandboxSettings {
        engine: EngineChoice::Docker,
        docker_host: Some("unix:///nonexistent/csbx/docker.sock".to_string()),
        ..Default::default()
    };
    let client = SandboxClient::new(engine.clone(), settings);

    client.sandboxes.create(named("kept")).await.unwrap();
    assert_eq!(client.sandboxes.list(&[]).await.unwrap().len(), 1);
    assert_eq!(engine.create_calls(), 1);

    // After a reset the next call selects again from the settings, which name no live engine
    client.reset_engine();
    assert!(matches!(
        client.sandboxes.list(&[]).await,
        Err(SandboxError::EngineNotFound { .. })
    ));
}

#[tokio::test]
async fn test_create_with_mounts_and_timeout() {
    let (engine, client) = setup();
    let mounts = vec![
        Mount::new("/srv/project", "/home/user/app"),
        "/srv/data:/home/user/data:ro".parse::<Mount>().unwrap(),
    ];
    let sandbox = client
        .sandboxes
        .create(CreateSandboxRequest {
            name: Some("bound".to_string()),
            mounts: mounts.clone(),
            timeout: Some(Duration::from_secs(1800)),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(engine.mounts(&sandbox.id), mounts);
    assert_eq!(sandbox.timeout(), Some(Duration::from_secs(1800)));
    assert!(sandbox.metadata().is_empty());
}

#[tokio::test]
async fn test_relative_mount_is_rejected_before_create() {
    let (engine, client) = setup();
    let err = client
        .sandboxes
        .create(CreateSandboxRequest {
            mounts: vec!["project:/home/user/app".parse().unwrap()],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::InvalidRequest(_)), "{:?}", err);
    assert_eq!(engine.create_calls(), 0);
}
