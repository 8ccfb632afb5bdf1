//! Centralized path resolution for converge
//!
//! # Environment Variables
//!
//! - `CONVERGE_HOME` - Override the home directory (default `~/.converge`)
//! - `CONVERGE_CONFIG` - Override the config file (default `<home>/config.toml`)
//! - `CONVERGE_PATH` - Extra configuration directories, `:` separated
//! - `CONVERGE_INVENTORY_DIR` - Override the inventory directory
//! - `CONVERGE_BETA` - Enable beta features
//!
//! # Configuration Search Path
//!
//! Lowest priority first:
//! 1. Distribution directory `<prefix>/share/converge/conf`, if present
//! 2. `~/.converge`
//! 3. `CONVERGE_PATH` entries, the first entry winning
//! 4. `--conf-dir` arguments and `conf_dirs` from the config file

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable for the home directory override
pub const ENV_HOME_DIR: &str = "CONVERGE_HOME";

/// Environment variable for the config file override
pub const ENV_CONFIG_FILE: &str = "CONVERGE_CONFIG";

/// Environment variable with extra configuration directories
pub const ENV_PATH: &str = "CONVERGE_PATH";

/// Environment variable for the inventory directory override
pub const ENV_INVENTORY_DIR: &str = "CONVERGE_INVENTORY_DIR";

/// Environment variable enabling beta features
pub const ENV_BETA: &str = "CONVERGE_BETA";

/// Get the converge home directory
///
/// Priority:
/// 1. `CONVERGE_HOME` env var
/// 2. `~/.converge`
pub fn home_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_HOME_DIR) {
        let path = expand(&dir);
        log::debug!("Using home dir from {}: {}", ENV_HOME_DIR, path.display());
        return Ok(path);
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".converge"))
}

/// Directory finished workspaces are cached in
pub fn cache_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join("cache"))
}

/// Get the config file path
pub fn config_file() -> Result<PathBuf> {
    if let Ok(file) = std::env::var(ENV_CONFIG_FILE) {
        return Ok(expand(&file));
    }
    Ok(home_dir()?.join("config.toml"))
}

/// Get the inventory directory
pub fn inventory_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_INVENTORY_DIR) {
        let path = expand(&dir);
        log::debug!(
            "Using inventory dir from {}: {}",
            ENV_INVENTORY_DIR,
            path.display()
        );
        return Ok(path);
    }
    Ok(home_dir()?.join("inventory"))
}

/// Configuration shipped next to the installed binary
fn dist_conf_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let prefix = exe.parent()?.parent()?;
    let dir = prefix.join("share").join("converge").join("conf");
    dir.is_dir().then_some(dir)
}

/// Configuration directories, lowest priority first
pub fn conf_search_path(extra: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let home = home_dir()?;
    let env_value = std::env::var(ENV_PATH).ok();
    let dirs = declarative::search_path(
        dist_conf_dir().as_deref(),
        Some(home.as_path()).filter(|h| h.is_dir()),
        env_value.as_deref(),
        extra,
    );
    log::debug!("Configuration search path: {:?}", dirs);
    Ok(dirs)
}

/// Whether an environment value switches a feature on
///
/// Any non-empty value other than `0`, `false` or `no` counts.
pub fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && !matches!(value.to_lowercase().as_str(), "0" | "false" | "no")
}

/// Whether `CONVERGE_BETA` enables beta features
pub fn beta_from_env() -> bool {
    std::env::var(ENV_BETA).is_ok_and(|v| is_truthy(&v))
}

/// Expand ~ and environment variables in a path string.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

/// Expand a path given as a `Path`
pub fn expand_path(path: &Path) -> PathBuf {
    expand(&path.to_string_lossy())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Helper to run a test with temporary env var
    ///
    /// # Safety
    /// This function uses unsafe env::set_var/remove_var which can cause issues
    /// if other threads read environment variables concurrently.
    /// Only use in single-threaded test contexts.
    fn with_env_var<F, R>(key: &str, value: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let original = env::var(key).ok();
        // SAFETY: Tests run in isolation and don't read env vars concurrently
        unsafe { env::set_var(key, value) };
        let result = f();
        match original {
            // SAFETY: Tests run in isolation
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
        result
    }

    #[test]
    fn test_home_dir_env_override() {
        with_env_var(ENV_HOME_DIR, "/custom/converge", || {
            assert_eq!(home_dir().unwrap(), PathBuf::from("/custom/converge"));
            assert_eq!(cache_dir().unwrap(), PathBuf::from("/custom/converge/cache"));
        });
    }

    #[test]
    fn test_inventory_dir_env_override_with_tilde() {
        let home = dirs::home_dir().unwrap();
        with_env_var(ENV_INVENTORY_DIR, "~/converge-inventory-test", || {
            assert_eq!(
                inventory_dir().unwrap(),
                home.join("converge-inventory-test")
            );
        });
    }

    #[test]
    fn test_is_truthy() {
        for value in ["1", "yes", "true", "on", "anything"] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["", " ", "0", "false", "FALSE", "no"] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test]
    fn test_expand_with_tilde() {
        let result = expand("~/test/path");
        let home = dirs::home_dir().unwrap();
        assert_eq!(result, home.join("test").join("path"));
    }

    #[test]
    fn test_expand_unknown_env_var_unchanged() {
        let result = expand("/path/$NONEXISTENT_VAR_12345/file");
        assert_eq!(result, PathBuf::from("/path/$NONEXISTENT_VAR_12345/file"));
    }
}
