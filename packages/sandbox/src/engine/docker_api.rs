// ABOUTME: Engine implementation over the Docker-compatible HTTP API via bollard
// ABOUTME: Serves both Docker and Podman; only the control socket differs between them

use super::{
    ArchiveStream, ContainerDetails, ContainerSpec, Engine, EngineKind, ExecChunk, ExecSession,
    ExecSpec, ExecState, StreamKind,
};
use crate::constants::LOOPBACK_HOST;
use crate::error::{Result, SandboxError};
use crate::sandbox::{Mount, PortMapping};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
        LogOutput, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{ContainerInspectResponse, HostConfig, PortBinding},
    Docker,
};
use futures::{future, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Request timeout handed to bollard, in seconds
const CLIENT_TIMEOUT_SECS: u64 = 120;

pub struct BollardEngine {
    client: Docker,
    kind: EngineKind,
}

impl BollardEngine {
    /// Connect lazily to a unix control socket; nothing is sent until the first call
    pub fn connect(kind: EngineKind, socket: &Path) -> Result<Self> {
        let path = socket.to_string_lossy();
        let client =
            Docker::connect_with_socket(&path, CLIENT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| map_err(kind, "connect", e))?;
        Ok(Self { client, kind })
    }

    /// Wrap an existing bollard client
    pub fn with_client(kind: EngineKind, client: Docker) -> Self {
        Self { client, kind }
    }

    fn err(&self, operation: &str, e: bollard::errors::Error) -> SandboxError {
        map_err(self.kind, operation, e)
    }

    fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();

        for port in &spec.ports {
            let container_port = format!("{}/tcp", port.container_port);
            exposed_ports.insert(container_port.clone(), HashMap::new());

            // Loopback only, sandboxes are never reachable from other hosts
            let binding = vec![PortBinding {
                host_ip: Some(LOOPBACK_HOST.to_string()),
                host_port: Some(port.host_port.to_string()),
            }];
            port_bindings.insert(container_port, Some(binding));
        }

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let binds: Vec<String> = spec.mounts.iter().map(Mount::bind).collect();

        let host_config = HostConfig {
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            binds: if binds.is_empty() { None } else { Some(binds) },
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            tty: Some(true),
            ..Default::default()
        }
    }

    fn to_details(inspect: ContainerInspectResponse) -> ContainerDetails {
        let status = inspect
            .state
            .as_ref()
            .and_then(|state| state.status.as_ref())
            .map(|s| {
                let s: &str = s.as_ref();
                s.to_string()
            })
            .unwrap_or_else(|| "unknown".to_string());

        // Configured bindings survive stop/pause; live network settings fill in the rest
        let mut ports = Vec::new();
        let configured = inspect
            .host_config
            .as_ref()
            .and_then(|hc| hc.port_bindings.as_ref());
        let live = inspect
            .network_settings
            .as_ref()
            .and_then(|ns| ns.ports.as_ref());
        for port_map in [configured, live].into_iter().flatten() {
            for (container_port_str, bindings) in port_map {
                let Some(binding) = bindings.as_ref().and_then(|b| b.first()) else {
                    continue;
                };
                // Format: "3000/tcp"
                let container_port = container_port_str
                    .split('/')
                    .next()
                    .and_then(|p| p.parse::<u16>().ok());
                let host_port = binding
                    .host_port
                    .as_ref()
                    .and_then(|p| p.parse::<u16>().ok());
                if let (Some(container_port), Some(host_port)) = (container_port, host_port) {
                    if !ports
                        .iter()
                        .any(|p: &PortMapping| p.container_port == container_port)
                    {
                        ports.push(PortMapping::new(host_port, container_port));
                    }
                }
            }
        }

        let created_at = inspect
            .created
            .as_ref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);

        let config = inspect.config.unwrap_or_default();
        let id = inspect.id.unwrap_or_default();

        ContainerDetails {
            name: inspect
                .name
                .unwrap_or_else(|| id.clone())
                .trim_start_matches('/')
                .to_string(),
            id,
            image: config.image.unwrap_or_default(),
            status,
            labels: config.labels.unwrap_or_default(),
            created_at,
            working_dir: config.working_dir,
            ports,
        }
    }

    async fn create_exec(&self, id: &str, spec: &ExecSpec, attach: bool) -> Result<String> {
        let options = CreateExecOptions {
            cmd: Some(spec.argv.clone()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env_strings())
            },
            working_dir: spec.working_dir.clone(),
            user: spec.user.clone(),
            attach_stdout: Some(attach),
            attach_stderr: Some(attach),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(id, options)
            .await
            .map_err(|e| self.err("exec", e))?;
        Ok(exec.id)
    }
}

/// Translate a bollard failure, keeping the engine's status code and text
fn map_err(kind: EngineKind, operation: &str, e: bollard::errors::Error) -> SandboxError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => SandboxError::engine_call(kind.as_str(), operation, Some(status_code), message),
        other => SandboxError::engine_call(kind.as_str(), operation, None, other.to_string()),
    }
}

#[async_trait]
impl Engine for BollardEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| self.err("ping", e))
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(self.err("inspect image", e)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {}", image);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        let mut last_status = String::new();
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| self.err("pull", e))?;
            if let Some(error) = info.error {
                return Err(SandboxError::engine_call(
                    self.kind.as_str(),
                    "pull",
                    None,
                    format!("{}: {}", image, error),
                ));
            }
            if let Some(status) = info.status {
                if status != last_status {
                    debug!("Pull status: {}", status);
                    last_status = status;
                }
            }
        }

        info!("Pulled image: {}", image);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        info!("Creating container: {}", spec.name);

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), Self::to_bollard_config(spec))
            .await
            .map_err(|e| self.err("create", e))?;

        for warning in &container.warnings {
            warn!("Engine warning for {}: {}", spec.name, warning);
        }
        debug!("Created container: {}", container.id);
        Ok(container.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        info!("Starting container: {}", id);
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| self.err("start", e))
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        info!("Stopping container: {} (timeout: {:?})", id, timeout);

        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.client.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304 Not Modified: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already stopped", id);
                Ok(())
            }
            Err(e) => Err(self.err("stop", e)),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        info!("Removing container: {} (force: {})", id, force);

        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(|e| self.err("remove", e))
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        info!("Pausing container: {}", id);
        self.client
            .pause_container(id)
            .await
            .map_err(|e| self.err("pause", e))
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        info!("Unpausing container: {}", id);
        self.client
            .unpause_container(id)
            .await
            .map_err(|e| self.err("unpause", e))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let inspect = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(|e| self.err("inspect", e))?;
        Ok(Self::to_details(inspect))
    }

    async fn list_containers(&self, label_filters: &[String]) -> Result<Vec<ContainerDetails>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), label_filters.to_vec());

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| self.err("list", e))?;

        let mut details = Vec::with_capacity(containers.len());
        for container in containers {
            let Some(id) = container.id else { continue };
            match self.inspect_container(&id).await {
                Ok(info) => details.push(info),
                // Removed between list and inspect
                Err(e) if e.is_engine_not_found() => {
                    debug!("Container {} vanished during listing", id);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(details)
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecSession> {
        debug!("Executing in container {}: {:?}", id, spec.argv);

        let exec_id = self.create_exec(id, spec, true).await?;
        let start_result = self
            .client
            .start_exec(&exec_id, None)
            .await
            .map_err(|e| self.err("exec", e))?;

        let kind = self.kind;
        let output = match start_result {
            StartExecResults::Attached { output, .. } => output
                .filter_map(move |item| {
                    let chunk = match item {
                        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                            Some(Ok(ExecChunk {
                                stream: StreamKind::Stdout,
                                data: message,
                            }))
                        }
                        Ok(LogOutput::StdErr { message }) => Some(Ok(ExecChunk {
                            stream: StreamKind::Stderr,
                            data: message,
                        })),
                        Ok(_) => None,
                        Err(e) => Some(Err(map_err(kind, "exec output", e))),
                    };
                    future::ready(chunk)
                })
                .boxed(),
            StartExecResults::Detached => {
                return Err(SandboxError::engine_call(
                    kind.as_str(),
                    "exec",
                    None,
                    "exec was detached unexpectedly",
                ))
            }
        };

        Ok(ExecSession { exec_id, output })
    }

    async fn exec_detached(&self, id: &str, spec: &ExecSpec) -> Result<String> {
        debug!("Launching detached exec in {}: {:?}", id, spec.argv);

        let exec_id = self.create_exec(id, spec, false).await?;
        let options = StartExecOptions {
            detach: true,
            ..Default::default()
        };
        self.client
            .start_exec(&exec_id, Some(options))
            .await
            .map_err(|e| self.err("exec", e))?;
        Ok(exec_id)
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState> {
        let inspect = self
            .client
            .inspect_exec(exec_id)
            .await
            .map_err(|e| self.err("inspect exec", e))?;
        Ok(ExecState {
            running: inspect.running.unwrap_or(false),
            exit_code: inspect.exit_code,
        })
    }

    async fn copy_in(&self, id: &str, dest_dir: &str, archive: ArchiveStream) -> Result<()> {
        debug!("Streaming archive to {}:{}", id, dest_dir);

        let options = UploadToContainerOptions {
            path: dest_dir.to_string(),
            ..Default::default()
        };

        // The body ends at the first broken chunk; that error outranks the engine's reaction
        let broken: Arc<Mutex<Option<SandboxError>>> = Arc::default();
        let slot = broken.clone();
        let body = archive.scan((), move |_, chunk| {
            future::ready(match chunk {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(e);
                    None
                }
            })
        });

        let result = self
            .client
            .upload_to_container_streaming(id, Some(options), body)
            .await;
        if let Some(e) = broken.lock().unwrap_or_else(|p| p.into_inner()).take() {
            return Err(e);
        }
        result.map_err(|e| self.err("copy in", e))
    }

    async fn copy_out(&self, id: &str, path: &str) -> Result<ArchiveStream> {
        debug!("Downloading {}:{}", id, path);

        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };

        let kind = self.kind;
        let stream = self
            .client
            .download_from_container(id, Some(options))
            .map(move |chunk| chunk.map_err(|e| map_err(kind, "copy out", e)))
            .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, ContainerState, ContainerStateStatusEnum};

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "csbx-web".to_string(),
            image: "docker-sandbox:base".to_string(),
            labels: HashMap::from([("csbx.managed".to_string(), "true".to_string())]),
            env: HashMap::from([("FOO".to_string(), "bar".to_string())]),
            ports: vec![PortMapping::new(8080, 80)],
            mounts: Vec::new(),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            working_dir: "/home/user".to_string(),
        }
    }

    #[test]
    fn test_container_config_conversion() {
        let config = BollardEngine::to_bollard_config(&spec());

        assert_eq!(config.image.as_deref(), Some("docker-sandbox:base"));
        assert_eq!(config.env, Some(vec!["FOO=bar".to_string()]));
        assert_eq!(config.working_dir.as_deref(), Some("/home/user"));
        assert!(config.exposed_ports.unwrap().contains_key("80/tcp"));

        let bindings = config.host_config.unwrap().port_bindings.unwrap();
        let binding = bindings["80/tcp"].as_ref().unwrap()[0].clone();
        assert_eq!(binding.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(binding.host_port.as_deref(), Some("8080"));
    }

    #[test]
    fn test_mounts_become_binds() {
        let mut spec = spec();
        assert_eq!(
            BollardEngine::to_bollard_config(&spec)
                .host_config
                .unwrap()
                .binds,
            None
        );

        spec.mounts = vec![
            Mount::new("/srv/app", "/home/user/app"),
            "/srv/data:/home/user/data:ro".parse().unwrap(),
        ];
        let binds = BollardEngine::to_bollard_config(&spec)
            .host_config
            .unwrap()
            .binds
            .unwrap();
        assert_eq!(
            binds,
            vec![
                "/srv/app:/home/user/app:rw,Z".to_string(),
                "/srv/data:/home/user/data:ro".to_string(),
            ]
        );
    }

    #[test]
    fn test_inspect_conversion_reads_configured_ports() {
        let mut bindings = HashMap::new();
        bindings.insert(
            "80/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some("8080".to_string()),
            }]),
        );

        let inspect = ContainerInspectResponse {
            id: Some("abc123".to_string()),
            name: Some("/csbx-web".to_string()),
            created: Some("2024-05-01T10:00:00Z".to_string()),
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::PAUSED),
                ..Default::default()
            }),
            config: Some(ContainerConfig {
                image: Some("docker-sandbox:base".to_string()),
                labels: Some(HashMap::from([(
                    "csbx.name".to_string(),
                    "web".to_string(),
                )])),
                ..Default::default()
            }),
            host_config: Some(HostConfig {
                port_bindings: Some(bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let details = BollardEngine::to_details(inspect);
        assert_eq!(details.id, "abc123");
        assert_eq!(details.name, "csbx-web");
        assert_eq!(details.status, "paused");
        assert_eq!(details.ports, vec![PortMapping::new(8080, 80)]);
        assert_eq!(details.labels["csbx.name"], "web");
    }

    #[test]
    fn test_server_errors_keep_status_code() {
        let err = map_err(
            EngineKind::Podman,
            "create",
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message: "name is already in use".to_string(),
            },
        );
        assert!(err.is_engine_conflict());
        assert!(err.to_string().contains("name is already in use"));
        assert!(err.to_string().starts_with("podman create failed"));
    }
}
