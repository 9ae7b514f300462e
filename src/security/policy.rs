//! Tag-based authorization.
//!
//! # Responsibilities
//! - Decide whether a client certificate's OU may reach an upstream
//! - Audit-log every denial with user and upstream

use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::BalancerConfig;

/// Error type for policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// The queried upstream is not in the configuration.
    UnknownUpstream(String),
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyError::UnknownUpstream(name) => {
                write!(f, "upstream '{}' was not found in config", name)
            }
        }
    }
}

impl std::error::Error for PolicyError {}

/// One authorization question.
#[derive(Debug)]
pub struct PolicyQuery<'a> {
    /// Certificate common name; identifies the client in audit logs.
    pub user: &'a str,
    /// Certificate organizational unit; the authorization principal.
    pub ou: &'a str,
    /// Target upstream name.
    pub upstream: &'a str,
}

/// Grants access when the client's OU appears in the upstream's tag set.
/// Deny is the default.
pub struct PolicyEnforcer {
    upstream_tags: RwLock<HashMap<String, Vec<String>>>,
}

impl PolicyEnforcer {
    pub fn from_config(config: &BalancerConfig) -> Self {
        let mut upstream_tags = HashMap::new();
        for upstream in &config.upstreams {
            upstream_tags.insert(upstream.name.clone(), upstream.tags.clone());
        }
        Self {
            upstream_tags: RwLock::new(upstream_tags),
        }
    }

    /// Evaluate a query. Unknown upstreams are an error; a known upstream
    /// without a matching tag is a (logged) denial.
    pub fn query(&self, q: &PolicyQuery<'_>) -> Result<bool, PolicyError> {
        let upstream_tags = self.upstream_tags.read().expect("policy lock poisoned");
        let tags = upstream_tags
            .get(q.upstream)
            .ok_or_else(|| PolicyError::UnknownUpstream(q.upstream.to_string()))?;

        if tags.iter().any(|tag| tag == q.ou) {
            return Ok(true);
        }

        tracing::info!(
            target: "audit",
            user = %q.user,
            upstream = %q.upstream,
            "access_denied"
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;

    fn enforcer() -> PolicyEnforcer {
        let mut config = BalancerConfig::default();
        config.upstreams = vec![
            UpstreamConfig {
                name: "web".into(),
                tags: vec!["sre".into(), "webdev".into()],
                backends: vec![],
            },
            UpstreamConfig {
                name: "db".into(),
                tags: vec!["sre".into(), "dba".into()],
                backends: vec![],
            },
            UpstreamConfig {
                name: "telemetry".into(),
                tags: vec!["sre".into(), "webdev".into()],
                backends: vec![],
            },
        ];
        PolicyEnforcer::from_config(&config)
    }

    fn allowed(e: &PolicyEnforcer, ou: &str, upstream: &str) -> bool {
        e.query(&PolicyQuery {
            user: "test-user",
            ou,
            upstream,
        })
        .unwrap()
    }

    #[test]
    fn test_access_matrix() {
        let e = enforcer();

        // SRE reaches everything
        assert!(allowed(&e, "sre", "web"));
        assert!(allowed(&e, "sre", "db"));
        assert!(allowed(&e, "sre", "telemetry"));

        // DBA reaches only db
        assert!(allowed(&e, "dba", "db"));
        assert!(!allowed(&e, "dba", "web"));
        assert!(!allowed(&e, "dba", "telemetry"));

        // Webdev reaches web and telemetry
        assert!(allowed(&e, "webdev", "web"));
        assert!(allowed(&e, "webdev", "telemetry"));
        assert!(!allowed(&e, "webdev", "db"));

        // Unknown OU reaches nothing
        assert!(!allowed(&e, "intern", "web"));
    }

    #[test]
    fn test_unknown_upstream_is_error() {
        let e = enforcer();
        assert_eq!(
            e.query(&PolicyQuery {
                user: "test-user",
                ou: "sre",
                upstream: "missing",
            }),
            Err(PolicyError::UnknownUpstream("missing".into()))
        );
    }
}
