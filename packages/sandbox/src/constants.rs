// ABOUTME: Environment variable names, label keys and defaults
// ABOUTME: Single place for every string the sandbox layer shares with engines and callers

// Environment variables
pub const ENV_CONTAINER_RUNTIME: &str = "CONTAINER_RUNTIME";
pub const ENV_PODMAN_SOCKET_PATH: &str = "PODMAN_SOCKET_PATH";
pub const ENV_DOCKER_HOST: &str = "DOCKER_HOST";
pub const ENV_XDG_RUNTIME_DIR: &str = "XDG_RUNTIME_DIR";
pub const ENV_PROBE_TIMEOUT_MS: &str = "CSBX_PROBE_TIMEOUT_MS";
pub const ENV_DEFAULT_TEMPLATE: &str = "CSBX_DEFAULT_TEMPLATE";
pub const ENV_WORKING_ROOT: &str = "CSBX_WORKING_ROOT";
pub const ENV_STOP_TIMEOUT_SECS: &str = "CSBX_STOP_TIMEOUT_SECS";
pub const ENV_EXEC_TIMEOUT_SECS: &str = "CSBX_EXEC_TIMEOUT_SECS";
pub const ENV_GIT_USER_NAME: &str = "CSBX_GIT_USER_NAME";
pub const ENV_GIT_USER_EMAIL: &str = "CSBX_GIT_USER_EMAIL";

// Labels
pub const LABEL_MANAGED: &str = "csbx.managed";
pub const LABEL_NAME: &str = "csbx.name";
pub const LABEL_TEMPLATE: &str = "csbx.template";
pub const LABEL_CREATED_AT: &str = "csbx.created_at";
/// Requested lifetime in seconds, left for an external reaper
pub const LABEL_TIMEOUT: &str = "csbx.timeout";
pub const LABEL_METADATA_PREFIX: &str = "csbx.metadata.";

/// Engine-side container names are the friendly name with this prefix
pub const CONTAINER_NAME_PREFIX: &str = "csbx-";

// Defaults
pub const DEFAULT_TEMPLATE: &str = "docker-sandbox:base";
pub const DEFAULT_WORKING_ROOT: &str = "/home/user";
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 60;
/// Read-write with a private SELinux relabel, so binds work on enforcing hosts
pub const DEFAULT_MOUNT_MODE: &str = "rw,Z";
pub const DEFAULT_GIT_USER_NAME: &str = "Container Sandbox";
pub const DEFAULT_GIT_USER_EMAIL: &str = "sandbox@container.local";
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";
pub const ROOTFUL_PODMAN_SOCKET: &str = "/run/podman/podman.sock";

/// Host address every published port binds to, and the host of URLs handed out for them
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Scratch directory inside sandboxes for pid files and background logs
pub const SCRATCH_DIR: &str = "/tmp";
