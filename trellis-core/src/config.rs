//! Kernel configuration

use serde::{Deserialize, Serialize};

/// Tunables of the data and computation core.
///
/// Every field has an environment override (`TRELLIS_*`) read by
/// `from_env`; defaults are safe for development.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Eagerly re-evaluate computed properties touched by a write.
    pub evaluate_on_write: bool,
    /// Hard cap applied to query `limit`.
    pub max_query_limit: i64,
    /// Optimistic-lock retries when writing back computed values.
    pub compute_retry_budget: u32,
    /// Bound on inherited-property resolution chains.
    pub max_inheritance_depth: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            evaluate_on_write: true,
            max_query_limit: 500,
            compute_retry_budget: 3,
            max_inheritance_depth: 16,
        }
    }
}

impl KernelConfig {
    /// Read configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    ///
    /// # Environment Variables
    /// - `TRELLIS_EVALUATE_ON_WRITE`: "true" | "false" (default: true)
    /// - `TRELLIS_MAX_QUERY_LIMIT`: maximum query page size (default: 500)
    /// - `TRELLIS_COMPUTE_RETRY_BUDGET`: write-back retries (default: 3)
    /// - `TRELLIS_MAX_INHERITANCE_DEPTH`: inheritance chain bound (default: 16)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            evaluate_on_write: std::env::var("TRELLIS_EVALUATE_ON_WRITE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.evaluate_on_write),
            max_query_limit: std::env::var("TRELLIS_MAX_QUERY_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_query_limit),
            compute_retry_budget: std::env::var("TRELLIS_COMPUTE_RETRY_BUDGET")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compute_retry_budget),
            max_inheritance_depth: std::env::var("TRELLIS_MAX_INHERITANCE_DEPTH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_inheritance_depth),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KernelConfig::default();
        assert!(config.evaluate_on_write);
        assert_eq!(config.max_query_limit, 500);
        assert_eq!(config.compute_retry_budget, 3);
    }
}
