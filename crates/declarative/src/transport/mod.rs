//! Transport to the target host
//!
//! The engine never talks to a host directly. It copies files and runs
//! commands through a [`Transport`], obtained per host run from a
//! [`TransportFactory`]. Both implementations shipped here shell out:
//!
//! - [`SshTransport`]: `ssh`/`scp` with a ControlMaster session per host run
//! - [`LocalTransport`]: the controller itself plays the target

pub mod local;
pub mod ssh;

pub use local::{LocalTransport, LocalTransportFactory};
pub use ssh::{SshTransport, SshTransportFactory};

use crate::allocator::RemoteSession;
use crate::error::{Error, Result};
use crate::types::CommandOutput;
use std::collections::BTreeMap;
use std::path::Path;

/// Copy and exec on one target host
///
/// `exec` returns the command's output whatever its exit status; an `Err`
/// means the transport itself failed.
pub trait Transport: Send + Sync {
    /// Copy a local file or directory to exactly `remote`
    fn copy(&self, local: &Path, remote: &str) -> Result<()>;

    /// Run a shell command on the target with extra environment
    fn exec(&self, command: &str, env: &BTreeMap<String, String>) -> Result<CommandOutput>;

    /// Create a directory and its parents
    fn mkdir(&self, path: &str) -> Result<()> {
        self.exec_checked(&format!("mkdir -p {}", shell_quote(path)))
    }

    /// Remove a directory tree
    fn rmdir(&self, path: &str) -> Result<()> {
        self.exec_checked(&format!("rm -rf {}", shell_quote(path)))
    }

    /// Run a command that must succeed
    fn exec_checked(&self, command: &str) -> Result<()> {
        let output = self.exec(command, &BTreeMap::new())?;
        if output.success {
            Ok(())
        } else {
            Err(Error::Transport(format!(
                "'{}' failed: {}",
                command,
                output.stderr_str().trim()
            )))
        }
    }

    /// Remove the session directory and close any persistent connection
    fn cleanup(&self, session_dir: &str) -> Result<()>;
}

/// Opens a transport for one host run
pub trait TransportFactory: Send + Sync {
    fn connect(&self, host: &str, session: &RemoteSession) -> Result<Box<dyn Transport>>;
}

/// Quote a string for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:,+@%".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// `export k=v; ` prefix for a remote command line
pub(crate) fn env_prefix(env: &BTreeMap<String, String>) -> String {
    if env.is_empty() {
        return String::new();
    }
    let assignments: Vec<String> = env
        .iter()
        .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
        .collect();
    format!("export {}; ", assignments.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/var/lib/converge1"), "/var/lib/converge1");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_env_prefix() {
        let mut env = BTreeMap::new();
        assert_eq!(env_prefix(&env), "");
        env.insert("__object_id".to_string(), "etc/motd".to_string());
        env.insert("__target_host".to_string(), "web 1".to_string());
        assert_eq!(
            env_prefix(&env),
            "export __object_id=etc/motd __target_host='web 1'; "
        );
    }
}
