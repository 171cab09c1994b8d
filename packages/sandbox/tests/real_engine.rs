// ABOUTME: End-to-end checks against whichever Docker or Podman engine is reachable
// ABOUTME: Every test skips with a note when no engine answers or the template cannot be pulled

use csbx_sandbox::{
    CreateSandboxRequest, ExecTimeout, PortMapping, RunOptions, Sandbox, SandboxClient,
    SandboxError, SandboxSettings, WriteOptions,
};
use std::time::{Duration, Instant};

const TEMPLATE: &str = "alpine:latest";

async fn connect() -> Option<SandboxClient> {
    let settings = SandboxSettings::from_env().ok()?;
    match SandboxClient::connect(settings).await {
        Ok(client) => Some(client),
        Err(e) => {
            println!("Skipping: {}", e);
            None
        }
    }
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, std::process::id())
}

async fn create(client: &SandboxClient, name: &str, ports: Vec<PortMapping>) -> Option<Sandbox> {
    let request = CreateSandboxRequest {
        template: Some(TEMPLATE.to_string()),
        name: Some(name.to_string()),
        ports,
        ..Default::default()
    };
    match client.sandboxes.create(request).await {
        Ok(sandbox) => Some(sandbox),
        Err(SandboxError::EngineCall {
            operation, message, ..
        }) if operation == "pull" => {
            println!("Skipping: cannot pull {}: {}", TEMPLATE, message);
            None
        }
        Err(e) => panic!("create {} failed: {}", name, e),
    }
}

async fn cleanup(client: &SandboxClient, token: &str) {
    if let Err(e) = client.sandboxes.kill(token).await {
        println!("cleanup of {} failed: {}", token, e);
    }
}

#[tokio::test]
async fn test_echo_hello_and_exit_codes() {
    let Some(client) = connect().await else { return };
    let name = unique("csbx-it-echo");
    let Some(sandbox) = create(&client, &name, Vec::new()).await else {
        return;
    };

    let output = client
        .commands
        .run(&name, "echo hello", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout_text(), "hello\n");

    let output = client
        .commands
        .run(
            &sandbox.id,
            "exit 7",
            RunOptions {
                shell: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(output.exit_code, 7);

    client
        .files
        .write(&name, "/tmp/round.bin", &[0, 159, 146, 150, 255], WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(
        client.files.read(&name, "/tmp/round.bin").await.unwrap(),
        vec![0, 159, 146, 150, 255]
    );

    cleanup(&client, &name).await;
    assert!(matches!(
        client.sandboxes.resolve(&sandbox.id).await,
        Err(SandboxError::SandboxNotFound(_))
    ));
}

#[tokio::test]
async fn test_timeout_kills_sleep() {
    let Some(client) = connect().await else { return };
    let name = unique("csbx-it-timeout");
    if create(&client, &name, Vec::new()).await.is_none() {
        return;
    }

    let started = Instant::now();
    let err = client
        .commands
        .run(
            &name,
            "sleep 10",
            RunOptions {
                timeout: ExecTimeout::After(Duration::from_secs(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Timeout { .. }), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(8));

    let processes = client.commands.list_processes(&name).await.unwrap();
    assert!(
        processes.iter().all(|p| p.command != "sleep 10"),
        "{:?}",
        processes
    );

    cleanup(&client, &name).await;
}

#[tokio::test]
async fn test_duplicate_host_port() {
    let Some(client) = connect().await else { return };
    let first = unique("csbx-it-port-a");
    let second = unique("csbx-it-port-b");
    let ports = vec![PortMapping::new(18777, 8000)];

    if create(&client, &first, ports.clone()).await.is_none() {
        return;
    }
    let err = client
        .sandboxes
        .create(CreateSandboxRequest {
            template: Some(TEMPLATE.to_string()),
            name: Some(second.clone()),
            ports,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::EngineCall { .. }), "{:?}", err);
    assert!(client.sandboxes.is_running(&first).await.unwrap());
    assert!(matches!(
        client.sandboxes.resolve(&second).await,
        Err(SandboxError::SandboxNotFound(_))
    ));

    cleanup(&client, &first).await;
}
