// ABOUTME: Entry point wiring the lifecycle, exec, file and git layers onto one engine
// ABOUTME: Front ends build one of these per invocation; the engine is selected once and cached

use crate::engine::{Engine, EngineSelector};
use crate::error::Result;
use crate::exec::CommandExecutor;
use crate::files::FileTransfer;
use crate::git::GitBridge;
use crate::lifecycle::SandboxManager;
use crate::settings::SandboxSettings;
use std::sync::Arc;

pub struct SandboxClient {
    pub sandboxes: Arc<SandboxManager>,
    pub commands: Arc<CommandExecutor>,
    pub files: FileTransfer,
    pub git: GitBridge,
    selector: Arc<EngineSelector>,
}

impl SandboxClient {
    /// Client over an already connected engine
    pub fn new(engine: Arc<dyn Engine>, settings: SandboxSettings) -> Self {
        let selector = EngineSelector::with_engine(Arc::new(settings), engine);
        Self::with_selector(Arc::new(selector))
    }

    /// Select an engine per `settings` now, so a missing engine fails here rather than on first use
    pub async fn connect(settings: SandboxSettings) -> Result<Self> {
        let selector = Arc::new(EngineSelector::new(Arc::new(settings)));
        selector.engine().await?;
        Ok(Self::with_selector(selector))
    }

    fn with_selector(selector: Arc<EngineSelector>) -> Self {
        let engine: Arc<dyn Engine> = selector.clone();
        let sandboxes = Arc::new(SandboxManager::new(engine, selector.settings().clone()));
        let commands = Arc::new(CommandExecutor::new(sandboxes.clone()));
        Self {
            files: FileTransfer::new(commands.clone()),
            git: GitBridge::new(commands.clone()),
            sandboxes,
            commands,
            selector,
        }
    }

    /// The engine every layer talks to; calls go to the cached selection
    pub fn engine(&self) -> &Arc<dyn Engine> {
        self.sandboxes.engine()
    }

    /// Drop the cached engine; the next operation selects one again from the settings
    pub fn reset_engine(&self) {
        self.selector.reset();
    }
}
