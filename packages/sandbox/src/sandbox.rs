// ABOUTME: Sandbox data model: state machine, port map, labels and friendly names
// ABOUTME: Sandboxes are rebuilt from engine inspect data on every read, never cached

use crate::constants::*;
use crate::engine::ContainerDetails;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Creating,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl SandboxState {
    /// Map an engine status string (`running`, `exited`, ...) onto the state machine
    pub fn from_engine(status: &str) -> Self {
        match status.to_lowercase().as_str() {
            "created" | "configured" | "initialized" => SandboxState::Creating,
            "running" | "restarting" => SandboxState::Running,
            "paused" => SandboxState::Paused,
            "removing" | "stopping" => SandboxState::Stopping,
            _ => SandboxState::Stopped,
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxState::Creating => "creating",
            SandboxState::Running => "running",
            SandboxState::Paused => "paused",
            SandboxState::Stopping => "stopping",
            SandboxState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

impl PortMapping {
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }
}

impl std::str::FromStr for PortMapping {
    type Err = String;

    /// Accepts `HOST:CONTAINER` or a bare `PORT` meaning the same port on both sides
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.trim()
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| format!("invalid port '{}'", p))
        };
        match s.split_once(':') {
            Some((host, container)) => Ok(Self::new(parse(host)?, parse(container)?)),
            None => {
                let port = parse(s)?;
                Ok(Self::new(port, port))
            }
        }
    }
}

/// Host directory bound into a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    /// Comma-separated `ro`/`rw` plus optional SELinux relabel flag `z`/`Z`
    pub mode: String,
}

impl Mount {
    pub fn new(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            mode: DEFAULT_MOUNT_MODE.to_string(),
        }
    }

    pub fn read_only(&self) -> bool {
        self.mode.split(',').any(|flag| flag == "ro")
    }

    /// Engine bind string, `HOST:CONTAINER:MODE`
    pub fn bind(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path,
            self.mode
        )
    }

    /// Both paths absolute and the mode made of known flags
    pub fn validate(&self) -> Result<(), String> {
        if !self.host_path.is_absolute() {
            return Err(format!(
                "mount host path must be absolute: {}",
                self.host_path.display()
            ));
        }
        self.validate_target()
    }

    fn validate_target(&self) -> Result<(), String> {
        if !self.container_path.starts_with('/') {
            return Err(format!(
                "mount container path must be absolute: {}",
                self.container_path
            ));
        }
        let flags: Vec<&str> = self.mode.split(',').collect();
        if let Some(bad) = flags
            .iter()
            .find(|f| !matches!(**f, "ro" | "rw" | "z" | "Z"))
        {
            return Err(format!("unknown mount mode '{}' in '{}'", bad, self.mode));
        }
        if flags.contains(&"ro") && flags.contains(&"rw") {
            return Err(format!("mount mode '{}' is both ro and rw", self.mode));
        }
        Ok(())
    }
}

impl std::str::FromStr for Mount {
    type Err = String;

    /// Accepts `HOST:CONTAINER` or `HOST:CONTAINER:MODE`; the mode defaults to `rw,Z`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let host = parts.next().filter(|p| !p.is_empty());
        let container = parts.next().filter(|p| !p.is_empty());
        let (Some(host), Some(container)) = (host, container) else {
            return Err(format!(
                "invalid mount '{}': expected HOST:CONTAINER[:MODE]",
                s
            ));
        };
        let mount = Self {
            mode: parts
                .next()
                .filter(|m| !m.is_empty())
                .unwrap_or(DEFAULT_MOUNT_MODE)
                .to_string(),
            ..Self::new(host, container)
        };
        // Relative host paths are left for the caller to resolve
        mount.validate_target()?;
        Ok(mount)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub name: String,
    /// Engine-side name, `csbx-<name>`
    pub container_name: String,
    pub template: String,
    pub state: SandboxState,
    pub created_at: DateTime<Utc>,
    pub port_map: Vec<PortMapping>,
    pub labels: HashMap<String, String>,
    pub working_root: String,
}

impl Sandbox {
    /// Build a sandbox view from engine data; `None` when the container is not ours
    pub fn from_details(details: ContainerDetails, working_root: &str) -> Option<Self> {
        if details.labels.get(LABEL_MANAGED).map(String::as_str) != Some("true") {
            return None;
        }

        let container_name = details.name.trim_start_matches('/').to_string();
        let name = details.labels.get(LABEL_NAME).cloned().unwrap_or_else(|| {
            container_name
                .strip_prefix(CONTAINER_NAME_PREFIX)
                .unwrap_or(&container_name)
                .to_string()
        });
        let template = details
            .labels
            .get(LABEL_TEMPLATE)
            .cloned()
            .unwrap_or_else(|| details.image.clone());
        let created_at = details
            .labels
            .get(LABEL_CREATED_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(details.created_at);

        let mut port_map = details.ports;
        port_map.sort_by_key(|p| (p.container_port, p.host_port));

        Some(Self {
            id: details.id,
            name,
            container_name,
            template,
            state: SandboxState::from_engine(&details.status),
            created_at,
            port_map,
            labels: details.labels,
            working_root: details
                .working_dir
                .filter(|w| !w.is_empty())
                .unwrap_or_else(|| working_root.to_string()),
        })
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }

    /// Caller-supplied labels with the metadata prefix stripped
    pub fn metadata(&self) -> BTreeMap<String, String> {
        self.labels
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(LABEL_METADATA_PREFIX)
                    .map(|key| (key.to_string(), v.clone()))
            })
            .collect()
    }

    /// Lifetime recorded at creation for an outside reaper; nothing here enforces it
    pub fn timeout(&self) -> Option<Duration> {
        self.labels
            .get(LABEL_TIMEOUT)
            .and_then(|secs| secs.parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    pub fn host_port_for(&self, container_port: u16) -> Option<u16> {
        self.port_map
            .iter()
            .find(|p| p.container_port == container_port)
            .map(|p| p.host_port)
    }

    pub fn is_running(&self) -> bool {
        self.state == SandboxState::Running
    }

    /// `id (name)`, used in ambiguity reports
    pub fn describe(&self) -> String {
        format!("{} ({})", self.short_id(), self.name)
    }
}

/// Full label set for a new sandbox
pub fn sandbox_labels(
    name: &str,
    template: &str,
    created_at: DateTime<Utc>,
    timeout: Option<Duration>,
    metadata: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut labels: HashMap<String, String> = metadata
        .iter()
        .map(|(k, v)| (format!("{}{}", LABEL_METADATA_PREFIX, k), v.clone()))
        .collect();
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels.insert(LABEL_NAME.to_string(), name.to_string());
    labels.insert(LABEL_TEMPLATE.to_string(), template.to_string());
    labels.insert(LABEL_CREATED_AT.to_string(), created_at.to_rfc3339());
    if let Some(timeout) = timeout {
        labels.insert(LABEL_TIMEOUT.to_string(), timeout.as_secs().to_string());
    }
    labels
}

pub fn container_name_for(name: &str) -> String {
    format!("{}{}", CONTAINER_NAME_PREFIX, name)
}

/// Names must be valid engine container names once prefixed
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > 63 {
        return Err(format!(
            "sandbox name must be 1-63 characters, got {}",
            name.len()
        ));
    }
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if first_ok && rest_ok {
        Ok(())
    } else {
        Err(format!(
            "invalid sandbox name '{}': use letters, digits, '_', '.' or '-', starting with a letter or digit",
            name
        ))
    }
}

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "brisk", "calm", "clever", "cosmic", "crisp", "eager", "fuzzy", "gentle",
    "golden", "happy", "jolly", "keen", "lively", "lucky", "mellow", "nimble", "quiet", "rapid",
    "shiny", "snowy", "sunny", "swift", "tidy", "vivid", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "canyon", "comet", "falcon", "fjord", "gecko", "harbor", "heron",
    "lagoon", "lynx", "maple", "meadow", "orbit", "otter", "panda", "pebble", "quartz", "raven",
    "reef", "sparrow", "summit", "tiger", "walrus", "willow", "zephyr",
];

const SUFFIX_ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

/// Friendly word pair plus a short random suffix, e.g. `brisk-otter-4f2a`
pub fn generate_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("otter");
    format!(
        "{}-{}-{}",
        adjective,
        noun,
        nanoid::nanoid!(4, &SUFFIX_ALPHABET)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn details(labels: &[(&str, &str)]) -> ContainerDetails {
        ContainerDetails {
            id: "4f2a9c0e11d3b7a8c6e5f4d3c2b1a09f8e7d6c5b4a3928170605f4e3d2c1b0a9".to_string(),
            name: "/csbx-web".to_string(),
            image: "docker-sandbox:base".to_string(),
            status: "running".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            created_at: Utc::now(),
            working_dir: None,
            ports: vec![PortMapping::new(8080, 80), PortMapping::new(3000, 3000)],
        }
    }

    #[rstest]
    #[case("created", SandboxState::Creating)]
    #[case("running", SandboxState::Running)]
    #[case("restarting", SandboxState::Running)]
    #[case("paused", SandboxState::Paused)]
    #[case("removing", SandboxState::Stopping)]
    #[case("exited", SandboxState::Stopped)]
    #[case("dead", SandboxState::Stopped)]
    fn test_engine_state_mapping(#[case] status: &str, #[case] expected: SandboxState) {
        assert_eq!(SandboxState::from_engine(status), expected);
    }

    #[test]
    fn test_unmanaged_container_is_ignored() {
        assert!(Sandbox::from_details(details(&[]), "/home/user").is_none());
    }

    #[test]
    fn test_from_details_reads_labels() {
        let sandbox = Sandbox::from_details(
            details(&[
                (LABEL_MANAGED, "true"),
                (LABEL_NAME, "web"),
                ("csbx.metadata.owner", "ci"),
            ]),
            "/home/user",
        )
        .unwrap();

        assert_eq!(sandbox.name, "web");
        assert_eq!(sandbox.container_name, "csbx-web");
        assert_eq!(sandbox.short_id(), "4f2a9c0e11d3");
        assert_eq!(sandbox.working_root, "/home/user");
        assert_eq!(
            sandbox.port_map,
            vec![PortMapping::new(8080, 80), PortMapping::new(3000, 3000)]
        );
        assert_eq!(sandbox.host_port_for(80), Some(8080));
        assert_eq!(sandbox.host_port_for(22), None);
        assert_eq!(
            sandbox.metadata().get("owner").map(String::as_str),
            Some("ci")
        );
    }

    #[test]
    fn test_json_shape() {
        let sandbox =
            Sandbox::from_details(details(&[(LABEL_MANAGED, "true")]), "/home/user").unwrap();
        let value = serde_json::to_value(&sandbox).unwrap();

        assert_eq!(value["state"], "running");
        assert_eq!(value["name"], "web");
        assert_eq!(value["port_map"][0]["host_port"], 8080);
        assert_eq!(value["port_map"][0]["container_port"], 80);
    }

    #[rstest]
    #[case("8080:80", PortMapping::new(8080, 80))]
    #[case("3000", PortMapping::new(3000, 3000))]
    fn test_port_mapping_parsing(#[case] raw: &str, #[case] expected: PortMapping) {
        assert_eq!(raw.parse::<PortMapping>().unwrap(), expected);
    }

    #[rstest]
    #[case("0:80")]
    #[case("http:80")]
    #[case("70000")]
    fn test_port_mapping_rejects(#[case] raw: &str) {
        assert!(raw.parse::<PortMapping>().is_err());
    }

    #[rstest]
    #[case("test-1", true)]
    #[case("web.app_2", true)]
    #[case("-leading", false)]
    #[case("has space", false)]
    #[case("", false)]
    fn test_validate_name(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_name(name).is_ok(), ok);
    }

    #[test]
    fn test_generated_names_are_valid() {
        for _ in 0..50 {
            let name = generate_name();
            assert!(validate_name(&name).is_ok(), "bad name {}", name);
            assert_eq!(name.split('-').count(), 3);
        }
    }

    #[test]
    fn test_labels_carry_marker_and_metadata() {
        let metadata = HashMap::from([("task".to_string(), "42".to_string())]);
        let labels = sandbox_labels(
            "web",
            "alpine:3",
            Utc::now(),
            Some(Duration::from_secs(1800)),
            &metadata,
        );
        assert_eq!(labels.get(LABEL_MANAGED).map(String::as_str), Some("true"));
        assert_eq!(labels.get(LABEL_NAME).map(String::as_str), Some("web"));
        assert_eq!(
            labels.get("csbx.metadata.task").map(String::as_str),
            Some("42")
        );
        assert_eq!(labels.get(LABEL_TIMEOUT).map(String::as_str), Some("1800"));
    }

    #[rstest]
    #[case("/srv/app:/home/user/app", "/srv/app", "/home/user/app", "rw,Z")]
    #[case("/data:/home/user/data:ro", "/data", "/home/user/data", "ro")]
    #[case("code:/home/user/code:ro,z", "code", "/home/user/code", "ro,z")]
    fn test_mount_parsing(
        #[case] raw: &str,
        #[case] host: &str,
        #[case] container: &str,
        #[case] mode: &str,
    ) {
        let mount = raw.parse::<Mount>().unwrap();
        assert_eq!(mount.host_path, PathBuf::from(host));
        assert_eq!(mount.container_path, container);
        assert_eq!(mount.mode, mode);
    }

    #[rstest]
    #[case("/srv/app")]
    #[case(":/home/user/app")]
    #[case("/srv/app:relative")]
    #[case("/srv/app:/app:rx")]
    #[case("/srv/app:/app:ro,rw")]
    fn test_mount_rejects(#[case] raw: &str) {
        assert!(raw.parse::<Mount>().is_err());
    }

    #[test]
    fn test_mount_needs_absolute_host_path() {
        let mount = "code:/home/user/code".parse::<Mount>().unwrap();
        assert!(mount.validate().is_err());
        assert!(Mount::new("/srv/code", "/home/user/code").validate().is_ok());
        assert!("/data:/d:ro".parse::<Mount>().unwrap().read_only());
    }
}
