use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GantryError, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Per-node execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum handler attempts before a node is marked FAILED.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay; attempt n waits `base * 2^(n-1)`.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Wall-clock budget for a single handler attempt.
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            node_timeout_secs: default_node_timeout_secs(),
        }
    }
}

/// Execution-round policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on simultaneously executing nodes within a round.
    /// 0 means unbounded.
    #[serde(default)]
    pub max_concurrent_nodes: usize,
    /// Safety bound on drain-loop rounds per task.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: 0,
            max_rounds: default_max_rounds(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_node_timeout_secs() -> u64 {
    300
}

fn default_max_rounds() -> usize {
    64
}

impl EngineConfig {
    /// Load configuration from a TOML file, expanding `${ENV_VAR}`
    /// references.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| GantryError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| GantryError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    result.push_str("${");
                    result.push_str(&var_name);
                    result.push('}');
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.executor.max_retries, 3);
        assert_eq!(config.executor.retry_base_delay_ms, 1_000);
        assert_eq!(config.executor.node_timeout_secs, 300);
        assert_eq!(config.orchestrator.max_concurrent_nodes, 0);
        assert_eq!(config.orchestrator.max_rounds, 64);
    }

    #[test]
    fn test_load_partial_file() {
        let toml_content = r#"
[executor]
max_retries = 5
node_timeout_secs = 30

[orchestrator]
max_concurrent_nodes = 8
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.executor.max_retries, 5);
        assert_eq!(config.executor.node_timeout_secs, 30);
        // Unspecified fields fall back to defaults
        assert_eq!(config.executor.retry_base_delay_ms, 1_000);
        assert_eq!(config.orchestrator.max_concurrent_nodes, 8);
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load(Path::new("/nonexistent/gantry.toml")).unwrap_err();
        assert!(matches!(err, GantryError::ConfigNotFound(_)));
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("GANTRY_TEST_RETRIES", "7");
        let expanded = expand_env_vars("max_retries = ${GANTRY_TEST_RETRIES}");
        assert_eq!(expanded, "max_retries = 7");

        // Unknown vars are left as-is
        let expanded = expand_env_vars("x = ${GANTRY_NO_SUCH_VAR}");
        assert_eq!(expanded, "x = ${GANTRY_NO_SUCH_VAR}");
    }
}
