//! Child processes with optional timeouts
//!
//! Output is read on helper threads while the child runs so a chatty child
//! cannot fill a pipe and block.

use crate::error::{Error, Result};
use crate::types::CommandOutput;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

/// Shell used for manifests, explorers and generated code
pub const SHELL: &str = "/bin/sh";

/// Run a command, capturing stdout and stderr
///
/// With a timeout the child is killed once it expires and the output is
/// marked `timed_out`.
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let program = PathBuf::from(cmd.get_program());
    let spawn_err = |e: io::Error| Error::io(&program, e);

    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    log::trace!("Spawning {:?}", cmd);
    let mut child = cmd.spawn().map_err(spawn_err)?;

    let stdout = child.stdout.take().map(|out| thread::spawn(move || read_all(out)));
    let stderr = child.stderr.take().map(|err| thread::spawn(move || read_all(err)));

    if let Some(input) = stdin
        && let Some(mut child_stdin) = child.stdin.take()
    {
        // A child that exits without reading stdin is not an error
        if let Err(e) = child_stdin.write_all(input)
            && e.kind() != io::ErrorKind::BrokenPipe
        {
            return Err(spawn_err(e));
        }
    }

    let mut timed_out = false;
    let status = match timeout {
        Some(limit) => match child.wait_timeout(limit).map_err(spawn_err)? {
            Some(status) => status,
            None => {
                log::warn!(
                    "{} timed out after {}s, killing",
                    program.display(),
                    limit.as_secs()
                );
                timed_out = true;
                child.kill().map_err(spawn_err)?;
                child.wait().map_err(spawn_err)?
            }
        },
        None => child.wait().map_err(spawn_err)?,
    };

    let stdout = join_output(stdout).map_err(spawn_err)?;
    let stderr = join_output(stderr).map_err(spawn_err)?;

    log::trace!("{} exited with {:?}", program.display(), status.code());
    Ok(CommandOutput {
        stdout,
        stderr,
        success: status.success() && !timed_out,
        code: status.code(),
        timed_out,
    })
}

/// Run a script with `/bin/sh -e`
pub fn run_script(
    script: &Path,
    env: &BTreeMap<String, String>,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let mut cmd = Command::new(SHELL);
    cmd.arg("-e").arg(script).envs(env);
    run_command(cmd, None, timeout)
}

fn read_all<R: Read>(mut reader: R) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

fn join_output(handle: Option<thread::JoinHandle<io::Result<Vec<u8>>>>) -> io::Result<Vec<u8>> {
    match handle {
        Some(handle) => handle
            .join()
            .map_err(|_| io::Error::other("output reader thread panicked"))?,
        None => Ok(Vec::new()),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_captures_both_streams() {
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        let out = run_command(cmd, None, None).unwrap();
        assert_eq!(out.stdout_str(), "out\n");
        assert_eq!(out.stderr_str(), "err\n");
        assert_eq!(out.code, Some(3));
        assert!(!out.success);
    }

    #[test]
    fn test_feeds_stdin() {
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c").arg("cat");
        let out = run_command(cmd, Some(b"piped"), None).unwrap();
        assert_eq!(out.stdout, b"piped");
    }

    #[test]
    fn test_timeout_kills_child() {
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c").arg("exec sleep 5");
        let out = run_command(cmd, None, Some(Duration::from_millis(100))).unwrap();
        assert!(out.timed_out);
        assert!(!out.success);
    }

    #[test]
    fn test_run_script_uses_errexit() {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("script");
        std::fs::write(&script, "false\necho unreachable\n").unwrap();
        let out = run_script(&script, &BTreeMap::new(), None).unwrap();
        assert!(!out.success);
        assert!(out.stdout.is_empty());
    }

    #[test]
    fn test_missing_program_is_io_error() {
        let cmd = Command::new("/nonexistent/program");
        assert!(matches!(run_command(cmd, None, None), Err(Error::Io { .. })));
    }
}
