//! SSH transport
//!
//! Every host run gets its own ControlMaster socket, keyed by the remote
//! session index, so the many small copies and execs of a run share one
//! connection.

use super::{Transport, TransportFactory, env_prefix, shell_quote};
use crate::allocator::RemoteSession;
use crate::error::{Error, Result};
use crate::process::run_command;
use crate::types::CommandOutput;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// ssh reports its own failures with this exit status
const SSH_FAILURE: i32 = 255;

/// Fragments of ssh's own connection diagnostics on stderr
const SSH_DIAGNOSTICS: &[&str] = &[
    "ssh:",
    "scp:",
    "kex_exchange_identification:",
    "mux_client_",
    "Control socket connect",
    "Connection closed by",
    "Connection reset by",
    "Connection timed out",
    "Host key verification failed",
    "Permission denied (",
];

/// Whether an exit came from ssh itself rather than the remote command
///
/// Remote commands may exit 255 too; only ssh's diagnostics on stderr tell
/// the two apart.
fn is_ssh_failure(output: &CommandOutput) -> bool {
    output.code == Some(SSH_FAILURE)
        && output
            .stderr_str()
            .lines()
            .any(|line| SSH_DIAGNOSTICS.iter().any(|d| line.contains(d)))
}

/// `ssh`/`scp` transport for one host
#[derive(Debug, Clone)]
pub struct SshTransport {
    host: String,
    user: String,
    control_path: PathBuf,
    timeout: Option<Duration>,
}

impl SshTransport {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        control_path: impl Into<PathBuf>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            control_path: control_path.into(),
            timeout,
        }
    }

    fn common_options(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            format!("User={}", self.user),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "ControlPersist=125".to_string(),
        ]
    }

    /// Build the `ssh` command line for a remote command
    pub fn exec_command(&self, command: &str, env: &BTreeMap<String, String>) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.common_options())
            .arg(&self.host)
            .arg("--")
            .arg(format!("/bin/sh -c {}", shell_quote(&format!("{}{}", env_prefix(env), command))));
        cmd
    }

    /// Build the `scp` command line for a copy
    pub fn copy_command(&self, local: &Path, remote: &str) -> Command {
        let mut cmd = Command::new("scp");
        cmd.args(self.common_options())
            .arg("-q")
            .arg("-r")
            .arg(local)
            .arg(format!("{}:{}", scp_host(&self.host), remote));
        cmd
    }

    fn run(&self, cmd: Command, what: &str) -> Result<CommandOutput> {
        let output = run_command(cmd, None, self.timeout)?;
        if is_ssh_failure(&output) {
            return Err(Error::Transport(format!(
                "{} on {} failed: {}",
                what,
                self.host,
                output.stderr_str().trim()
            )));
        }
        if output.timed_out {
            return Err(Error::Transport(format!(
                "{} on {} timed out",
                what, self.host
            )));
        }
        Ok(output)
    }
}

impl Transport for SshTransport {
    fn copy(&self, local: &Path, remote: &str) -> Result<()> {
        log::trace!("scp {} -> {}:{}", local.display(), self.host, remote);
        let output = self.run(self.copy_command(local, remote), "copy")?;
        if output.success {
            Ok(())
        } else {
            Err(Error::Transport(format!(
                "copy of {} to {}:{} failed: {}",
                local.display(),
                self.host,
                remote,
                output.stderr_str().trim()
            )))
        }
    }

    fn exec(&self, command: &str, env: &BTreeMap<String, String>) -> Result<CommandOutput> {
        log::trace!("ssh {}: {}", self.host, command);
        self.run(self.exec_command(command, env), "exec")
    }

    fn cleanup(&self, session_dir: &str) -> Result<()> {
        let removed = self.rmdir(session_dir);

        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("User={}", self.user))
            .arg("-O")
            .arg("exit")
            .arg("-S")
            .arg(&self.control_path)
            .arg(&self.host);
        match run_command(cmd, None, self.timeout) {
            Ok(output) if !output.success => log::debug!(
                "Closing ssh master for {}: {}",
                self.host,
                output.stderr_str().trim()
            ),
            Ok(_) => {}
            Err(e) => log::debug!("Closing ssh master for {}: {}", self.host, e),
        }
        removed
    }
}

/// Hands out [`SshTransport`]s with per-session control sockets
#[derive(Debug, Clone)]
pub struct SshTransportFactory {
    pub user: String,
    pub control_dir: PathBuf,
    pub timeout: Option<Duration>,
}

impl SshTransportFactory {
    pub fn new(control_dir: impl Into<PathBuf>) -> Self {
        Self {
            user: "root".to_string(),
            control_dir: control_dir.into(),
            timeout: None,
        }
    }
}

impl TransportFactory for SshTransportFactory {
    fn connect(&self, host: &str, session: &RemoteSession) -> Result<Box<dyn Transport>> {
        std::fs::create_dir_all(&self.control_dir).map_err(|e| Error::io(&self.control_dir, e))?;
        let control_path = self.control_dir.join(format!("ssh-{}", session.index));
        Ok(Box::new(SshTransport::new(
            host,
            self.user.clone(),
            control_path,
            self.timeout,
        )))
    }
}

/// scp needs IPv6 literals in brackets
fn scp_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_exec_command_line() {
        let transport = SshTransport::new("web1", "root", "/tmp/ctl/ssh-1", None);
        let mut env = BTreeMap::new();
        env.insert("__object_id".to_string(), "etc/motd".to_string());
        let cmd = transport.exec_command("/bin/sh -e /var/lib/converge1/code-remote", &env);
        let args = args(&cmd);

        assert_eq!(cmd.get_program(), "ssh");
        assert!(args.contains(&"User=root".to_string()));
        assert!(args.contains(&"ControlPath=/tmp/ctl/ssh-1".to_string()));
        assert!(args.contains(&"web1".to_string()));
        let remote = args.last().unwrap();
        assert!(remote.starts_with("/bin/sh -c '"));
        assert!(remote.contains("export __object_id=etc/motd;"));
    }

    #[test]
    fn test_copy_brackets_ipv6() {
        let transport = SshTransport::new("fe80::1", "root", "/tmp/ctl/ssh-2", None);
        let cmd = transport.copy_command(Path::new("/tmp/out/explorer"), "/var/lib/converge2/explorer");
        assert_eq!(cmd.get_program(), "scp");
        assert_eq!(
            args(&cmd).last().unwrap(),
            "[fe80::1]:/var/lib/converge2/explorer"
        );
    }

    fn exited(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: b"partial\n".to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            success: false,
            code: Some(code),
            timed_out: false,
        }
    }

    #[test]
    fn test_exit_255_is_transport_failure_only_with_ssh_diagnostics() {
        assert!(is_ssh_failure(&exited(
            255,
            "ssh: connect to host web1 port 22: Connection refused\n"
        )));
        assert!(is_ssh_failure(&exited(
            255,
            "root@web1: Permission denied (publickey).\r\n"
        )));
        assert!(!is_ssh_failure(&exited(255, "apt: held packages\n")));
        assert!(!is_ssh_failure(&exited(255, "")));
        assert!(!is_ssh_failure(&exited(1, "ssh: connect to host web1 port 22\n")));
    }

    #[test]
    fn test_scp_host() {
        assert_eq!(scp_host("example.com"), "example.com");
        assert_eq!(scp_host("::1"), "[::1]");
        assert_eq!(scp_host("[::1]"), "[::1]");
    }
}
