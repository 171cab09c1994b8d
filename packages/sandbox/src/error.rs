// ABOUTME: Error types for sandbox management
// ABOUTME: One taxonomy shared by the engine adapter, registry, lifecycle, exec, file and git layers

use crate::exec::ExecOutput;
use crate::sandbox::SandboxState;
use crate::settings::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Neither engine answered on any known control socket
    #[error("No container engine reachable (tried: {})", .tried.join(", "))]
    EngineNotFound { tried: Vec<String> },

    /// The engine rejected an operation; status and message are the engine's own
    #[error("{engine} {operation} failed{}: {message}", status_suffix(.status_code))]
    EngineCall {
        engine: String,
        operation: String,
        status_code: Option<u16>,
        message: String,
    },

    #[error("No sandbox matches '{0}'")]
    SandboxNotFound(String),

    #[error("'{token}' is ambiguous, it matches: {}", .candidates.join(", "))]
    AmbiguousToken {
        token: String,
        candidates: Vec<String>,
    },

    #[error("Sandbox '{token}' is {actual}, expected {expected}")]
    InvalidState {
        token: String,
        expected: SandboxState,
        actual: SandboxState,
    },

    #[error("A sandbox named '{0}' already exists")]
    NameInUse(String),

    #[error("Port {port} is not mapped on sandbox '{token}'")]
    PortNotMapped { token: String, port: u16 },

    #[error("Path not found in sandbox '{token}': {path}")]
    PathNotFound { token: String, path: String },

    #[error("Permission denied in sandbox '{token}' for {path}: {message}")]
    PermissionDenied {
        token: String,
        path: String,
        message: String,
    },

    /// Archive stream broke off; anything written at the destination is invalid
    #[error("Transfer of {path} failed: {message}")]
    Transfer { path: String, message: String },

    /// The command was killed; `output` holds what it printed before that
    #[error("Command `{command}` timed out after {}s", .timeout.as_secs_f64())]
    Timeout {
        command: String,
        timeout: Duration,
        output: Box<ExecOutput>,
    },

    /// A git step inside the sandbox exited non-zero
    #[error("git {operation} failed in '{token}' (exit {exit_code}): {message}")]
    Git {
        token: String,
        operation: String,
        exit_code: i64,
        message: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn status_suffix(status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!(" (status {})", code),
        None => String::new(),
    }
}

impl SandboxError {
    pub fn engine_call(
        engine: impl Into<String>,
        operation: impl Into<String>,
        status_code: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self::EngineCall {
            engine: engine.into(),
            operation: operation.into(),
            status_code,
            message: message.into(),
        }
    }

    pub fn transfer(path: impl Into<String>, message: impl ToString) -> Self {
        Self::Transfer {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Native status code of an engine rejection, if this is one
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::EngineCall { status_code, .. } => *status_code,
            _ => None,
        }
    }

    pub fn is_engine_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    pub fn is_engine_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }

    /// Reinterpret an engine rejection of a copy call as a path error
    pub(crate) fn at_path(self, token: &str, path: &str) -> Self {
        match self {
            Self::EngineCall {
                status_code: Some(404),
                ..
            } => Self::PathNotFound {
                token: token.to_string(),
                path: path.to_string(),
            },
            Self::EngineCall {
                status_code: Some(403),
                message,
                ..
            } => Self::PermissionDenied {
                token: token.to_string(),
                path: path.to_string(),
                message,
            },
            other => other,
        }
    }

    /// Reinterpret an engine 404 on a resolved sandbox as the sandbox being gone
    pub(crate) fn gone_as(self, token: &str) -> Self {
        if self.is_engine_not_found() {
            Self::SandboxNotFound(token.to_string())
        } else {
            self
        }
    }
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
