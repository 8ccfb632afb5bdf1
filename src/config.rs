//! User configuration: `~/.converge/config.toml`
//!
//! Every key is optional; command line flags win over the file.
//!
//! ```toml
//! jobs = 4
//! parallel = 8
//! remote_out_dir = "/var/lib/converge"
//! remote_user = "root"
//! cache_path_pattern = "%h"
//! on_error = "continue"
//! order_dependency = false
//! beta = false
//! conf_dirs = ["~/src/site-conf"]
//! exec_timeout_secs = 600
//! ```

use anyhow::{Context, Result};
use declarative::FailurePolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConvergeConfig {
    /// Parallel code jobs within one host (beta when > 1)
    pub jobs: Option<usize>,
    /// Hosts converged at once
    pub parallel: Option<usize>,
    /// Base of the remote session directories
    pub remote_out_dir: Option<String>,
    /// User for ssh connections
    pub remote_user: Option<String>,
    /// Cache directory name pattern
    pub cache_path_pattern: Option<String>,
    /// `continue` or `abort`
    pub on_error: Option<String>,
    pub order_dependency: Option<bool>,
    pub beta: Option<bool>,
    #[serde(default)]
    pub conf_dirs: Vec<String>,
    pub exec_timeout_secs: Option<u64>,
}

impl ConvergeConfig {
    /// Load the config file; a missing file is an empty config
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config file at {}", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.failure_policy()?;
        Ok(config)
    }

    /// Failure policy named by `on_error`
    pub fn failure_policy(&self) -> Result<Option<FailurePolicy>> {
        self.on_error
            .as_deref()
            .map(|value| value.parse::<FailurePolicy>().map_err(anyhow::Error::msg))
            .transpose()
    }

    /// Configuration directories with `~` expanded
    pub fn conf_dirs(&self) -> Vec<PathBuf> {
        self.conf_dirs.iter().map(|d| paths::expand(d)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_config() {
        let config = ConvergeConfig::parse(
            r#"
jobs = 4
parallel = 8
remote_out_dir = "/srv/converge"
on_error = "abort"
order_dependency = true
conf_dirs = ["/etc/converge"]
exec_timeout_secs = 30
"#,
        )
        .unwrap();
        assert_eq!(config.jobs, Some(4));
        assert_eq!(config.parallel, Some(8));
        assert_eq!(
            config.failure_policy().unwrap(),
            Some(FailurePolicy::AbortOnFirstError)
        );
        assert_eq!(config.conf_dirs(), vec![PathBuf::from("/etc/converge")]);
        assert_eq!(config.beta, None);
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!(ConvergeConfig::parse("on_error = \"sometimes\"").is_err());
        assert!(ConvergeConfig::parse("unknown_key = 1").is_err());
    }

    #[test]
    fn test_missing_file_is_empty_config() {
        let tmp = TempDir::new().unwrap();
        let config = ConvergeConfig::load_from(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(config, ConvergeConfig::default());
    }
}
