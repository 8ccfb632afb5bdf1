//! Local transport: remote paths are local paths

use super::{Transport, TransportFactory};
use crate::allocator::RemoteSession;
use crate::error::{Error, Result};
use crate::process::{SHELL, run_command};
use crate::types::CommandOutput;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use walkdir::WalkDir;

/// Runs "remote" commands with the local shell
///
/// Used to converge the controller itself and to test the engine without a
/// network.
#[derive(Debug, Clone, Default)]
pub struct LocalTransport {
    timeout: Option<Duration>,
}

impl LocalTransport {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl Transport for LocalTransport {
    fn copy(&self, local: &Path, remote: &str) -> Result<()> {
        log::trace!("Local copy: {} -> {}", local.display(), remote);
        let remote = Path::new(remote);
        // Links are followed: the merged conf tree is made of them
        let meta = fs::metadata(local).map_err(|e| Error::io(local, e))?;
        if !meta.is_dir() {
            fs::copy(local, remote).map_err(|e| Error::io(remote, e))?;
            return Ok(());
        }

        for entry in WalkDir::new(local).follow_links(true) {
            let entry = entry.map_err(|e| Error::Transport(e.to_string()))?;
            let rel = entry.path().strip_prefix(local).unwrap_or(entry.path());
            let target = remote.join(rel);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target).map_err(|e| Error::io(&target, e))?;
            } else {
                fs::copy(entry.path(), &target).map_err(|e| Error::io(&target, e))?;
            }
        }
        Ok(())
    }

    fn exec(&self, command: &str, env: &BTreeMap<String, String>) -> Result<CommandOutput> {
        log::trace!("Local exec: {}", command);
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c").arg(command).envs(env);
        run_command(cmd, None, self.timeout)
    }

    fn cleanup(&self, session_dir: &str) -> Result<()> {
        self.rmdir(session_dir)
    }
}

/// Hands every host a [`LocalTransport`]
#[derive(Debug, Clone, Default)]
pub struct LocalTransportFactory {
    pub timeout: Option<Duration>,
}

impl TransportFactory for LocalTransportFactory {
    fn connect(&self, host: &str, session: &RemoteSession) -> Result<Box<dyn Transport>> {
        log::debug!("Local transport for {} in {}", host, session.path);
        Ok(Box::new(LocalTransport::new(self.timeout)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_exec_passes_env() {
        let transport = LocalTransport::default();
        let mut env = BTreeMap::new();
        env.insert("__target_host".to_string(), "localhost".to_string());
        let out = transport.exec("echo \"$__target_host\"", &env).unwrap();
        assert!(out.success);
        assert_eq!(out.stdout_str(), "localhost\n");
    }

    #[test]
    fn test_copy_directory_follows_links() {
        let tmp = TempDir::new().unwrap();
        let real = tmp.path().join("real");
        fs::create_dir_all(&real).unwrap();
        fs::write(real.join("os"), "uname\n").unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        std::os::unix::fs::symlink(real.join("os"), src.join("os")).unwrap();

        let dest = tmp.path().join("session/conf/explorer");
        let transport = LocalTransport::default();
        transport.mkdir(tmp.path().join("session/conf").to_str().unwrap()).unwrap();
        transport.copy(&src, dest.to_str().unwrap()).unwrap();

        let copied = dest.join("os");
        assert!(!fs::symlink_metadata(&copied).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(copied).unwrap(), "uname\n");
    }

    #[test]
    fn test_cleanup_removes_session() {
        let tmp = TempDir::new().unwrap();
        let session = tmp.path().join("session1");
        let transport = LocalTransport::default();
        transport.mkdir(session.join("object").to_str().unwrap()).unwrap();
        transport.cleanup(session.to_str().unwrap()).unwrap();
        assert!(!session.exists());
    }
}
