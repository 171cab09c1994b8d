// ABOUTME: Local container sandbox management over Docker and Podman
// ABOUTME: Sandboxes are labelled containers; the engine is the only state store

pub mod archive;
pub mod client;
pub mod constants;
pub mod engine;
pub mod error;
pub mod exec;
pub mod files;
pub mod git;
pub mod lifecycle;
pub mod registry;
pub mod sandbox;
pub mod settings;

pub use client::SandboxClient;
pub use engine::{
    select_engine, BollardEngine, Engine, EngineKind, EngineSelector, MockEngine, MockExecReply,
};
pub use error::{Result, SandboxError};
pub use exec::{
    CommandExecutor, ExecOutput, ExecTimeout, ExecUser, ProcessHandle, ProcessInfo,
    ProcessStatus, RunOptions,
};
pub use files::{FileEntry, FileTransfer, TransferDescriptor, WriteOptions};
pub use git::{GitBridge, GitCloneRequest, GitPushOutcome, GitPushRequest, PushMode};
pub use lifecycle::{CreateSandboxRequest, ExportArtifact, ExportRequest, SandboxManager};
pub use registry::{resolve_in, SandboxRegistry};
pub use sandbox::{Mount, PortMapping, Sandbox, SandboxState};
pub use settings::{ConfigError, EngineChoice, SandboxSettings};
