// ABOUTME: Engine trait and engine selection for Docker and Podman backends
// ABOUTME: Defines the abstract container operations every other component is written against

use crate::constants::*;
use crate::error::{Result, SandboxError};
use crate::sandbox::{Mount, PortMapping};
use crate::settings::{EngineChoice, SandboxSettings};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub mod docker_api;
pub mod mock;

pub use self::docker_api::BollardEngine;
pub use self::mock::{MockEngine, MockExecReply, MockNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Podman,
    Docker,
}

impl EngineKind {
    /// Auto-detection preference order
    pub const PROBE_ORDER: [EngineKind; 2] = [EngineKind::Podman, EngineKind::Docker];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Podman => "podman",
            EngineKind::Docker => "docker",
        }
    }

    /// Control sockets to try for this engine, most specific first
    pub fn socket_candidates(&self, settings: &SandboxSettings) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        match self {
            EngineKind::Podman => {
                if let Some(path) = &settings.podman_socket {
                    candidates.push(path.clone());
                } else {
                    if let Ok(runtime_dir) = std::env::var(ENV_XDG_RUNTIME_DIR) {
                        candidates.push(Path::new(&runtime_dir).join("podman/podman.sock"));
                    }
                    let uid = nix::unistd::getuid();
                    candidates.push(PathBuf::from(format!(
                        "/run/user/{}/podman/podman.sock",
                        uid
                    )));
                    candidates.push(PathBuf::from(ROOTFUL_PODMAN_SOCKET));
                }
            }
            EngineKind::Docker => match settings.docker_host.as_deref() {
                Some(host) if host.starts_with("unix://") => {
                    candidates.push(PathBuf::from(host.trim_start_matches("unix://")));
                }
                Some(host) if host.starts_with('/') => candidates.push(PathBuf::from(host)),
                _ => candidates.push(PathBuf::from(DEFAULT_DOCKER_SOCKET)),
            },
        }
        candidates.dedup();
        candidates
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to create one sandbox container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<Mount>,
    pub command: Vec<String>,
    pub working_dir: String,
}

/// Engine view of one container, from inspect
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Raw engine status string, e.g. `running`
    pub status: String,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub working_dir: Option<String>,
    pub ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
    /// `None` runs as the image's default user
    pub user: Option<String>,
}

impl ExecSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Default::default()
        }
    }

    pub fn env_strings(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct ExecChunk {
    pub stream: StreamKind,
    pub data: Bytes,
}

pub type ExecOutputStream = BoxStream<'static, Result<ExecChunk>>;

/// Chunked tar archive going into or coming out of a container
pub type ArchiveStream = BoxStream<'static, Result<Bytes>>;

/// An attached exec: the engine's exec id plus its output stream
pub struct ExecSession {
    pub exec_id: String,
    pub output: ExecOutputStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecState {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Uniform container operations over Docker and Podman
#[async_trait]
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Check the control socket answers
    async fn ping(&self) -> Result<()>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create (but do not start) a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container; already-stopped containers are not an error
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    async fn pause_container(&self, id: &str) -> Result<()>;

    async fn unpause_container(&self, id: &str) -> Result<()>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails>;

    /// Containers carrying every `key=value` label in `label_filters`, stopped ones included
    async fn list_containers(&self, label_filters: &[String]) -> Result<Vec<ContainerDetails>>;

    /// Start an exec with stdout/stderr attached
    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecSession>;

    /// Start an exec and return its id without waiting for output
    async fn exec_detached(&self, id: &str, spec: &ExecSpec) -> Result<String>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState>;

    /// Extract a streamed tar archive into `dest_dir`, which must already exist.
    /// An `Err` item aborts the upload and is returned as the call's error.
    async fn copy_in(&self, id: &str, dest_dir: &str, archive: ArchiveStream) -> Result<()>;

    /// Stream `path` out of the container as a tar archive rooted at its basename
    async fn copy_out(&self, id: &str, path: &str) -> Result<ArchiveStream>;
}

/// Resolves the active engine once and hands out the cached connection.
///
/// The selector is itself an `Engine`: every call goes to the cached engine, selecting it
/// on first use. Nothing is selected again until `reset`.
pub struct EngineSelector {
    settings: Arc<SandboxSettings>,
    selected: RwLock<Option<Arc<dyn Engine>>>,
    selecting: Mutex<()>,
}

impl EngineSelector {
    pub fn new(settings: Arc<SandboxSettings>) -> Self {
        Self {
            settings,
            selected: RwLock::new(None),
            selecting: Mutex::new(()),
        }
    }

    /// Selector pre-seeded with `engine`, skipping the first selection
    pub fn with_engine(settings: Arc<SandboxSettings>, engine: Arc<dyn Engine>) -> Self {
        Self {
            settings,
            selected: RwLock::new(Some(engine)),
            selecting: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &Arc<SandboxSettings> {
        &self.settings
    }

    pub fn selected(&self) -> Option<Arc<dyn Engine>> {
        self.selected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn engine(&self) -> Result<Arc<dyn Engine>> {
        if let Some(engine) = self.selected() {
            return Ok(engine);
        }

        // Concurrent first calls share one selection
        let _selecting = self.selecting.lock().await;
        if let Some(engine) = self.selected() {
            return Ok(engine);
        }
        let engine = select_engine(&self.settings).await?;
        *self
            .selected
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(engine.clone());
        Ok(engine)
    }

    /// Forget the cached engine so the next call selects again
    pub fn reset(&self) {
        if self
            .selected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("Engine selection reset");
        }
    }
}

#[async_trait]
impl Engine for EngineSelector {
    /// The selected engine's kind; before selection, the first kind the settings allow
    fn kind(&self) -> EngineKind {
        match (self.selected(), self.settings.engine) {
            (Some(engine), _) => engine.kind(),
            (None, EngineChoice::Docker) => EngineKind::Docker,
            (None, EngineChoice::Podman) => EngineKind::Podman,
            (None, EngineChoice::Auto) => EngineKind::PROBE_ORDER[0],
        }
    }

    async fn ping(&self) -> Result<()> {
        self.engine().await?.ping().await
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.engine().await?.image_exists(image).await
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.engine().await?.pull_image(image).await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.engine().await?.create_container(spec).await
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.engine().await?.start_container(id).await
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        self.engine().await?.stop_container(id, timeout).await
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        self.engine().await?.remove_container(id, force).await
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        self.engine().await?.pause_container(id).await
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        self.engine().await?.unpause_container(id).await
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        self.engine().await?.inspect_container(id).await
    }

    async fn list_containers(&self, label_filters: &[String]) -> Result<Vec<ContainerDetails>> {
        self.engine().await?.list_containers(label_filters).await
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecSession> {
        self.engine().await?.exec(id, spec).await
    }

    async fn exec_detached(&self, id: &str, spec: &ExecSpec) -> Result<String> {
        self.engine().await?.exec_detached(id, spec).await
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState> {
        self.engine().await?.inspect_exec(exec_id).await
    }

    async fn copy_in(&self, id: &str, dest_dir: &str, archive: ArchiveStream) -> Result<()> {
        self.engine().await?.copy_in(id, dest_dir, archive).await
    }

    async fn copy_out(&self, id: &str, path: &str) -> Result<ArchiveStream> {
        self.engine().await?.copy_out(id, path).await
    }
}

/// Connect to the configured engine, probing Podman then Docker in auto mode
pub async fn select_engine(settings: &SandboxSettings) -> Result<Arc<dyn Engine>> {
    let kinds: Vec<EngineKind> = match settings.engine {
        EngineChoice::Auto => EngineKind::PROBE_ORDER.to_vec(),
        EngineChoice::Docker => vec![EngineKind::Docker],
        EngineChoice::Podman => vec![EngineKind::Podman],
    };

    let mut tried = Vec::new();
    for kind in kinds {
        for socket in kind.socket_candidates(settings) {
            tried.push(format!("{} at {}", kind, socket.display()));
            if !socket.exists() {
                debug!("No {} socket at {}", kind, socket.display());
                continue;
            }
            match probe(kind, &socket, settings.probe_timeout).await {
                Some(engine) => {
                    info!("Using {} at {}", kind, socket.display());
                    return Ok(Arc::new(engine));
                }
                None => continue,
            }
        }
    }

    Err(SandboxError::EngineNotFound { tried })
}

async fn probe(kind: EngineKind, socket: &Path, timeout: Duration) -> Option<BollardEngine> {
    let engine = match BollardEngine::connect(kind, socket) {
        Ok(engine) => engine,
        Err(e) => {
            debug!("Could not connect to {}: {}", socket.display(), e);
            return None;
        }
    };

    match tokio::time::timeout(timeout, engine.ping()).await {
        Ok(Ok(())) => Some(engine),
        Ok(Err(e)) => {
            debug!("{} at {} did not answer ping: {}", kind, socket.display(), e);
            None
        }
        Err(_) => {
            debug!(
                "{} at {} timed out after {:?}",
                kind,
                socket.display(),
                timeout
            );
            None
        }
    }
}
