// ABOUTME: Runtime configuration for the sandbox layer, read from the environment
// ABOUTME: Settings are built once and passed explicitly to every component

use crate::constants::*;
use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid number for {name}: {source}")]
    InvalidNumber {
        name: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("Invalid container runtime: {0} (expected auto, docker or podman)")]
    InvalidRuntime(String),
    #[error("{0} must be an absolute path")]
    RelativePath(&'static str),
}

/// Which engine the caller wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineChoice {
    #[default]
    Auto,
    Docker,
    Podman,
}

impl FromStr for EngineChoice {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(EngineChoice::Auto),
            "docker" => Ok(EngineChoice::Docker),
            "podman" => Ok(EngineChoice::Podman),
            _ => Err(ConfigError::InvalidRuntime(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub engine: EngineChoice,
    /// Explicit Podman socket, skips discovery
    pub podman_socket: Option<PathBuf>,
    /// Docker daemon address; only `unix://` sockets and bare paths are used
    pub docker_host: Option<String>,
    pub probe_timeout: Duration,
    pub default_template: String,
    pub working_root: String,
    pub stop_timeout: Duration,
    /// `None` means foreground commands may run forever
    pub exec_timeout: Option<Duration>,
    pub git_user_name: String,
    pub git_user_email: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            engine: EngineChoice::Auto,
            podman_socket: None,
            docker_host: None,
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            default_template: DEFAULT_TEMPLATE.to_string(),
            working_root: DEFAULT_WORKING_ROOT.to_string(),
            stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
            exec_timeout: Some(Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS)),
            git_user_name: DEFAULT_GIT_USER_NAME.to_string(),
            git_user_email: DEFAULT_GIT_USER_EMAIL.to_string(),
        }
    }
}

impl SandboxSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let engine = match env::var(ENV_CONTAINER_RUNTIME) {
            Ok(value) => value.parse()?,
            Err(_) => EngineChoice::Auto,
        };

        let working_root =
            env::var(ENV_WORKING_ROOT).unwrap_or_else(|_| defaults.working_root.clone());
        if !working_root.starts_with('/') {
            return Err(ConfigError::RelativePath(ENV_WORKING_ROOT));
        }

        let exec_timeout = match read_u64(ENV_EXEC_TIMEOUT_SECS)? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.exec_timeout,
        };

        Ok(Self {
            engine,
            podman_socket: non_empty(ENV_PODMAN_SOCKET_PATH).map(PathBuf::from),
            docker_host: non_empty(ENV_DOCKER_HOST),
            probe_timeout: read_u64(ENV_PROBE_TIMEOUT_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
            default_template: non_empty(ENV_DEFAULT_TEMPLATE)
                .unwrap_or(defaults.default_template),
            working_root,
            stop_timeout: read_u64(ENV_STOP_TIMEOUT_SECS)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.stop_timeout),
            exec_timeout,
            git_user_name: non_empty(ENV_GIT_USER_NAME).unwrap_or(defaults.git_user_name),
            git_user_email: non_empty(ENV_GIT_USER_EMAIL).unwrap_or(defaults.git_user_email),
        })
    }

    pub fn with_engine(mut self, engine: EngineChoice) -> Self {
        self.engine = engine;
        self
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn read_u64(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match non_empty(name) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|source| ConfigError::InvalidNumber { name, source }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("auto", EngineChoice::Auto)]
    #[case("", EngineChoice::Auto)]
    #[case("Docker", EngineChoice::Docker)]
    #[case("PODMAN", EngineChoice::Podman)]
    fn test_engine_choice_parsing(#[case] raw: &str, #[case] expected: EngineChoice) {
        assert_eq!(raw.parse::<EngineChoice>().unwrap(), expected);
    }

    #[test]
    fn test_engine_choice_rejects_unknown() {
        let err = "containerd".parse::<EngineChoice>().unwrap_err();
        assert!(err.to_string().contains("containerd"));
    }

    // Env-mutating assertions live in one test so they cannot race each other
    #[test]
    fn test_from_env() {
        for name in [
            ENV_CONTAINER_RUNTIME,
            ENV_EXEC_TIMEOUT_SECS,
            ENV_WORKING_ROOT,
            ENV_PROBE_TIMEOUT_MS,
        ] {
            env::remove_var(name);
        }

        let settings = SandboxSettings::from_env().unwrap();
        assert_eq!(settings.engine, EngineChoice::Auto);
        assert_eq!(settings.working_root, "/home/user");
        assert_eq!(settings.exec_timeout, Some(Duration::from_secs(60)));
        assert_eq!(settings.probe_timeout, Duration::from_millis(2000));

        env::set_var(ENV_CONTAINER_RUNTIME, "podman");
        env::set_var(ENV_EXEC_TIMEOUT_SECS, "0");
        let settings = SandboxSettings::from_env().unwrap();
        assert_eq!(settings.engine, EngineChoice::Podman);
        assert_eq!(settings.exec_timeout, None);

        env::set_var(ENV_EXEC_TIMEOUT_SECS, "soon");
        assert!(matches!(
            SandboxSettings::from_env(),
            Err(ConfigError::InvalidNumber { .. })
        ));
        env::remove_var(ENV_EXEC_TIMEOUT_SECS);

        env::set_var(ENV_WORKING_ROOT, "relative/dir");
        assert!(matches!(
            SandboxSettings::from_env(),
            Err(ConfigError::RelativePath(_))
        ));

        env::remove_var(ENV_WORKING_ROOT);
        env::remove_var(ENV_CONTAINER_RUNTIME);
    }
}
