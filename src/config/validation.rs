//! Configuration validation logic.

use std::collections::HashSet;

use crate::config::schema::BalancerConfig;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validate a BalancerConfig for semantic correctness.
pub fn validate_config(config: &BalancerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // 1. Upstream names must be unique
    let mut upstream_names: HashSet<&str> = HashSet::new();
    for upstream in &config.upstreams {
        if !upstream_names.insert(upstream.name.as_str()) {
            errors.push(ValidationError(format!(
                "Upstream '{}' is defined more than once",
                upstream.name
            )));
        }
    }

    // 2. Referential integrity: listeners must point to configured upstreams
    for listener in &config.listeners {
        if !upstream_names.contains(listener.upstream.as_str()) {
            errors.push(ValidationError(format!(
                "Listener '{}' references unknown upstream '{}'",
                listener.bind_address, listener.upstream
            )));
        }
    }

    // 3. Validate health check settings
    if config.health_check.interval_secs == 0 {
        errors.push(ValidationError(
            "health_check.interval_secs must be > 0".to_string(),
        ));
    }
    if config.health_check.timeout_secs == 0 {
        errors.push(ValidationError(
            "health_check.timeout_secs must be > 0".to_string(),
        ));
    }

    // 4. Validate rate limit bucket size
    if config.rate_limit.max_tokens == 0 && config.rate_limit.token_refill_per_second.is_finite() {
        errors.push(ValidationError(
            "rate_limit.max_tokens must be > 0 unless limiting is disabled".to_string(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
