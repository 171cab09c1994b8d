// ABOUTME: Sandbox lifecycle: create, kill, pause, resume, list, host URLs and export
// ABOUTME: The engine is the source of truth; every operation re-reads it through the registry

use crate::constants::LOOPBACK_HOST;
use crate::engine::{ContainerSpec, Engine};
use crate::error::{Result, SandboxError};
use crate::registry::SandboxRegistry;
use crate::sandbox::{
    container_name_for, generate_name, sandbox_labels, validate_name, Mount, PortMapping,
    Sandbox, SandboxState,
};
use crate::settings::SandboxSettings;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct CreateSandboxRequest {
    /// Image reference; the configured default template when unset
    pub template: Option<String>,
    /// Friendly name; generated when unset
    pub name: Option<String>,
    pub ports: Vec<PortMapping>,
    /// Host directories to bind; host paths must be absolute
    pub mounts: Vec<Mount>,
    pub env: HashMap<String, String>,
    /// Stored as `csbx.metadata.<key>` labels
    pub metadata: HashMap<String, String>,
    /// Lifetime recorded in the `csbx.timeout` label for an external reaper
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ExportRequest {
    pub output_dir: PathBuf,
    /// Archive name without extension
    pub name: Option<String>,
    /// Subtree to export; the sandbox working root when unset
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportArtifact {
    pub path: PathBuf,
    pub byte_count: u64,
}

pub struct SandboxManager {
    engine: Arc<dyn Engine>,
    settings: Arc<SandboxSettings>,
    registry: SandboxRegistry,
}

impl SandboxManager {
    pub fn new(engine: Arc<dyn Engine>, settings: Arc<SandboxSettings>) -> Self {
        let registry = SandboxRegistry::new(engine.clone(), settings.working_root.clone());
        Self {
            engine,
            settings,
            registry,
        }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SandboxRegistry {
        &self.registry
    }

    pub async fn resolve(&self, token: &str) -> Result<Sandbox> {
        self.registry.resolve(token).await
    }

    pub async fn create(&self, request: CreateSandboxRequest) -> Result<Sandbox> {
        validate_ports(&request.ports)?;
        for mount in &request.mounts {
            mount.validate().map_err(SandboxError::InvalidRequest)?;
        }

        let template = request
            .template
            .clone()
            .unwrap_or_else(|| self.settings.default_template.clone());
        self.ensure_image(&template).await?;

        let existing = self.registry.list(&[]).await?;
        let taken: HashSet<&str> = existing
            .iter()
            .flat_map(|s| [s.name.as_str(), s.container_name.as_str()])
            .collect();

        let explicit = request.name.is_some();
        let mut name = match &request.name {
            Some(name) => {
                validate_name(name).map_err(SandboxError::InvalidRequest)?;
                if taken.contains(name.as_str())
                    || taken.contains(container_name_for(name).as_str())
                {
                    return Err(SandboxError::NameInUse(name.clone()));
                }
                name.clone()
            }
            None => unique_name(&taken),
        };

        // A generated name may still race another creator; retry that once
        let mut retried = false;
        let id = loop {
            let created_at = Utc::now();
            let spec = ContainerSpec {
                name: container_name_for(&name),
                image: template.clone(),
                labels: sandbox_labels(
                    &name,
                    &template,
                    created_at,
                    request.timeout,
                    &request.metadata,
                ),
                env: request.env.clone(),
                ports: request.ports.clone(),
                mounts: request.mounts.clone(),
                command: vec!["sleep".to_string(), "infinity".to_string()],
                working_dir: self.settings.working_root.clone(),
            };

            match self.engine.create_container(&spec).await {
                Ok(id) => break id,
                Err(e) if e.is_engine_conflict() && explicit => {
                    return Err(SandboxError::NameInUse(name));
                }
                Err(e) if e.is_engine_conflict() && !retried => {
                    debug!("Generated name {} collided, picking another", name);
                    retried = true;
                    name = unique_name(&taken);
                }
                Err(e) => return Err(e),
            }
        };

        if let Err(e) = self.engine.start_container(&id).await {
            warn!("Sandbox {} failed to start, removing it: {}", name, e);
            if let Err(cleanup) = self.engine.remove_container(&id, true).await {
                warn!("Could not remove half-created sandbox {}: {}", id, cleanup);
            }
            return Err(e);
        }

        let details = self.engine.inspect_container(&id).await?;
        let sandbox = Sandbox::from_details(details, &self.settings.working_root)
            .ok_or_else(|| SandboxError::SandboxNotFound(id.clone()))?;
        info!("Created sandbox {} ({})", sandbox.name, sandbox.short_id());
        Ok(sandbox)
    }

    async fn ensure_image(&self, template: &str) -> Result<()> {
        if self.engine.image_exists(template).await? {
            return Ok(());
        }
        info!("Template {} not present locally, pulling", template);
        self.engine.pull_image(template).await
    }

    /// Stop and remove a sandbox; terminal
    pub async fn kill(&self, token: &str) -> Result<Sandbox> {
        let sandbox = self.registry.resolve(token).await?;

        if sandbox.state == SandboxState::Running {
            self.engine
                .stop_container(&sandbox.id, self.settings.stop_timeout)
                .await
                .map_err(|e| e.gone_as(token))?;
        }
        self.engine
            .remove_container(&sandbox.id, true)
            .await
            .map_err(|e| e.gone_as(token))?;

        info!("Killed sandbox {} ({})", sandbox.name, sandbox.short_id());
        Ok(sandbox)
    }

    pub async fn pause(&self, token: &str) -> Result<Sandbox> {
        let sandbox = self
            .expect_state(token, SandboxState::Running)
            .await?;
        self.engine
            .pause_container(&sandbox.id)
            .await
            .map_err(|e| e.gone_as(token))?;
        info!("Paused sandbox {}", sandbox.name);
        self.refresh(token, &sandbox).await
    }

    pub async fn resume(&self, token: &str) -> Result<Sandbox> {
        let sandbox = self.expect_state(token, SandboxState::Paused).await?;
        self.engine
            .unpause_container(&sandbox.id)
            .await
            .map_err(|e| e.gone_as(token))?;
        info!("Resumed sandbox {}", sandbox.name);
        self.refresh(token, &sandbox).await
    }

    async fn expect_state(&self, token: &str, expected: SandboxState) -> Result<Sandbox> {
        let sandbox = self.registry.resolve(token).await?;
        if sandbox.state != expected {
            return Err(SandboxError::InvalidState {
                token: token.to_string(),
                expected,
                actual: sandbox.state,
            });
        }
        Ok(sandbox)
    }

    async fn refresh(&self, token: &str, sandbox: &Sandbox) -> Result<Sandbox> {
        let details = self
            .engine
            .inspect_container(&sandbox.id)
            .await
            .map_err(|e| e.gone_as(token))?;
        Sandbox::from_details(details, &self.settings.working_root)
            .ok_or_else(|| SandboxError::SandboxNotFound(token.to_string()))
    }

    pub async fn list(&self, label_filter: &[String]) -> Result<Vec<Sandbox>> {
        self.registry.list(label_filter).await
    }

    pub async fn get(&self, token: &str) -> Result<Sandbox> {
        self.registry.resolve(token).await
    }

    pub async fn is_running(&self, token: &str) -> Result<bool> {
        Ok(self.registry.resolve(token).await?.is_running())
    }

    /// Loopback URL for a container port
    pub async fn get_host(&self, token: &str, port: u16) -> Result<String> {
        let sandbox = self.registry.resolve(token).await?;
        match sandbox.host_port_for(port) {
            Some(host_port) => Ok(format!("http://{}:{}", LOOPBACK_HOST, host_port)),
            None => Err(SandboxError::PortNotMapped {
                token: token.to_string(),
                port,
            }),
        }
    }

    /// Write a sandbox subtree to `<output_dir>/<name>.tar.gz`
    pub async fn export(&self, token: &str, request: ExportRequest) -> Result<ExportArtifact> {
        let sandbox = self.registry.resolve(token).await?;
        let path = request
            .path
            .clone()
            .unwrap_or_else(|| sandbox.working_root.clone());
        let name = match &request.name {
            Some(name) => name.trim_end_matches(".tar.gz").to_string(),
            None => format!("{}-{}", sandbox.name, Utc::now().format("%Y%m%d-%H%M%S")),
        };

        std::fs::create_dir_all(&request.output_dir)?;
        let destination = request.output_dir.join(format!("{}.tar.gz", name));

        let mut stream = self
            .engine
            .copy_out(&sandbox.id, &path)
            .await
            .map_err(|e| e.at_path(token, &path))?;

        let staging = tempfile::Builder::new()
            .prefix(".csbx-export-")
            .tempfile_in(&request.output_dir)?;
        let mut encoder = GzEncoder::new(staging, Compression::default());
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| e.at_path(token, &path))
                .map_err(|e| interrupted(&path, e))?;
            encoder.write_all(&chunk)?;
        }
        let staging = encoder.finish()?;
        persist(staging, &destination)?;

        let byte_count = std::fs::metadata(&destination)?.len();
        info!(
            "Exported {}:{} to {} ({} bytes)",
            sandbox.name,
            path,
            destination.display(),
            byte_count
        );
        Ok(ExportArtifact {
            path: destination,
            byte_count,
        })
    }
}

/// A stream that broke after it started is a transfer failure, not a lookup failure
fn interrupted(path: &str, e: SandboxError) -> SandboxError {
    match e {
        SandboxError::EngineCall { message, .. } => SandboxError::transfer(path, message),
        other => other,
    }
}

fn persist(file: tempfile::NamedTempFile, destination: &Path) -> Result<()> {
    file.persist(destination).map_err(|e| e.error)?;
    Ok(())
}

fn unique_name(taken: &HashSet<&str>) -> String {
    loop {
        let name = generate_name();
        if !taken.contains(name.as_str()) && !taken.contains(container_name_for(&name).as_str()) {
            return name;
        }
    }
}

fn validate_ports(ports: &[PortMapping]) -> Result<()> {
    let mut host_ports = HashSet::new();
    let mut container_ports = HashSet::new();
    for port in ports {
        if port.host_port == 0 || port.container_port == 0 {
            return Err(SandboxError::InvalidRequest(
                "port 0 cannot be mapped".to_string(),
            ));
        }
        if !host_ports.insert(port.host_port) {
            return Err(SandboxError::InvalidRequest(format!(
                "host port {} is listed twice",
                port.host_port
            )));
        }
        if !container_ports.insert(port.container_port) {
            return Err(SandboxError::InvalidRequest(format!(
                "container port {} is listed twice",
                port.container_port
            )));
        }
    }
    Ok(())
}
