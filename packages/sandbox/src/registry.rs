// ABOUTME: Resolves a user token (name, id or id prefix) to exactly one live sandbox
// ABOUTME: Reads the engine fresh on every call; resolution stages are pure match functions

use crate::constants::LABEL_MANAGED;
use crate::engine::Engine;
use crate::error::{Result, SandboxError};
use crate::sandbox::Sandbox;
use std::sync::Arc;
use tracing::debug;

type MatchFn = fn(&Sandbox, &str) -> bool;

/// Tried in order; the first stage with any match decides
const STAGES: [(&str, MatchFn); 3] = [
    ("exact id", exact_id),
    ("exact name", exact_name),
    ("id prefix", id_prefix),
];

fn exact_id(sandbox: &Sandbox, token: &str) -> bool {
    sandbox.id == token
}

fn exact_name(sandbox: &Sandbox, token: &str) -> bool {
    sandbox.name == token || sandbox.container_name == token
}

fn id_prefix(sandbox: &Sandbox, token: &str) -> bool {
    sandbox.id.starts_with(token)
}

/// Apply the resolution stages to an already fetched listing
pub fn resolve_in<'a>(sandboxes: &'a [Sandbox], token: &str) -> Result<&'a Sandbox> {
    let token = token.trim();
    if token.is_empty() {
        return Err(SandboxError::SandboxNotFound(token.to_string()));
    }

    for (stage, matches) in STAGES {
        let found: Vec<&Sandbox> = sandboxes.iter().filter(|s| matches(s, token)).collect();
        match found.as_slice() {
            [] => continue,
            [single] => {
                debug!("Resolved '{}' by {} to {}", token, stage, single.id);
                return Ok(single);
            }
            many => {
                return Err(SandboxError::AmbiguousToken {
                    token: token.to_string(),
                    candidates: many.iter().map(|s| s.describe()).collect(),
                })
            }
        }
    }

    Err(SandboxError::SandboxNotFound(token.to_string()))
}

pub struct SandboxRegistry {
    engine: Arc<dyn Engine>,
    working_root: String,
}

impl SandboxRegistry {
    pub fn new(engine: Arc<dyn Engine>, working_root: impl Into<String>) -> Self {
        Self {
            engine,
            working_root: working_root.into(),
        }
    }

    /// Managed sandboxes, optionally narrowed by `key=value` label predicates
    pub async fn list(&self, label_filter: &[String]) -> Result<Vec<Sandbox>> {
        let mut filters = vec![format!("{}=true", LABEL_MANAGED)];
        filters.extend(label_filter.iter().cloned());

        let mut sandboxes: Vec<Sandbox> = self
            .engine
            .list_containers(&filters)
            .await?
            .into_iter()
            .filter_map(|details| Sandbox::from_details(details, &self.working_root))
            .collect();
        sandboxes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(sandboxes)
    }

    pub async fn resolve(&self, token: &str) -> Result<Sandbox> {
        let sandboxes = self.list(&[]).await?;
        resolve_in(&sandboxes, token).cloned()
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxState;
    use chrono::Utc;
    use std::collections::HashMap;

    fn sandbox(id: &str, name: &str) -> Sandbox {
        Sandbox {
            id: id.to_string(),
            name: name.to_string(),
            container_name: format!("csbx-{}", name),
            template: "alpine:latest".to_string(),
            state: SandboxState::Running,
            created_at: Utc::now(),
            port_map: Vec::new(),
            labels: HashMap::new(),
            working_root: "/home/user".to_string(),
        }
    }

    fn fleet() -> Vec<Sandbox> {
        vec![
            sandbox("abc123456789", "web"),
            sandbox("abd987654321", "db"),
            // A name that looks like another sandbox's id prefix
            sandbox("ffff00001111", "abc"),
        ]
    }

    #[test]
    fn test_exact_name() {
        let fleet = fleet();
        assert_eq!(resolve_in(&fleet, "db").unwrap().id, "abd987654321");
        assert_eq!(resolve_in(&fleet, "csbx-db").unwrap().id, "abd987654321");
    }

    #[test]
    fn test_exact_id_beats_everything() {
        let fleet = fleet();
        assert_eq!(resolve_in(&fleet, "ffff00001111").unwrap().name, "abc");
    }

    #[test]
    fn test_name_stage_precedes_prefix_stage() {
        // "abc" is both a name and a prefix of web's id; the name wins
        let fleet = fleet();
        assert_eq!(resolve_in(&fleet, "abc").unwrap().id, "ffff00001111");
    }

    #[test]
    fn test_unique_prefix() {
        let fleet = fleet();
        assert_eq!(resolve_in(&fleet, "abd9").unwrap().name, "db");
    }

    #[test]
    fn test_ambiguous_prefix_lists_candidates() {
        let fleet = fleet();
        match resolve_in(&fleet, "ab") {
            Err(SandboxError::AmbiguousToken { token, candidates }) => {
                assert_eq!(token, "ab");
                assert_eq!(
                    candidates,
                    vec!["abc123456789 (web)".to_string(), "abd987654321 (db)".to_string()]
                );
            }
            other => panic!("expected ambiguity, got {:?}", other.map(|s| s.id.clone())),
        }
    }

    #[test]
    fn test_unknown_and_empty_tokens() {
        let fleet = fleet();
        assert!(matches!(
            resolve_in(&fleet, "zzz"),
            Err(SandboxError::SandboxNotFound(_))
        ));
        assert!(matches!(
            resolve_in(&fleet, "  "),
            Err(SandboxError::SandboxNotFound(_))
        ));
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let fleet = fleet();
        for token in ["web", "abd9", "ffff00001111"] {
            let first = resolve_in(&fleet, token).unwrap().id.clone();
            let second = resolve_in(&fleet, token).unwrap().id.clone();
            assert_eq!(first, second);
        }
    }
}
