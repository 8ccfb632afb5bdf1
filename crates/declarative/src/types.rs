//! Core types for object convergence

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Output;
use std::str::FromStr;
use std::time::Duration;

/// Lifecycle of a configuration object within one host run.
///
/// Objects only move forward. `Error` and `Skipped` are reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    /// Declared by a manifest, nothing run yet
    Discovered,
    /// Object explorers have run
    Explored,
    /// Type manifest has run (or the type has none)
    ManifestRun,
    /// Graph is closed, waiting for the code stage
    ReadyForCode,
    /// Code stage finished successfully
    Executed,
    /// A phase failed
    Error,
    /// A requirement failed upstream
    Skipped,
}

impl ObjectState {
    /// Marker text stored in the object directory
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Explored => "explored",
            Self::ManifestRun => "manifest_run",
            Self::ReadyForCode => "ready_for_code",
            Self::Executed => "executed",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Discovered => 0,
            Self::Explored => 1,
            Self::ManifestRun => 2,
            Self::ReadyForCode => 3,
            Self::Executed => 4,
            Self::Error | Self::Skipped => 5,
        }
    }

    /// No further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed | Self::Error | Self::Skipped)
    }

    /// The object failed or was skipped because something it needs failed
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Error | Self::Skipped)
    }

    /// The object finished its explorer and manifest phases
    pub fn is_prepared(&self) -> bool {
        matches!(
            self,
            Self::ManifestRun | Self::ReadyForCode | Self::Executed
        )
    }

    /// Check whether moving to `next` keeps the forward-only invariant
    pub fn can_transition_to(&self, next: ObjectState) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if next.is_failed() {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "discovered" => Ok(Self::Discovered),
            "explored" => Ok(Self::Explored),
            "manifest_run" => Ok(Self::ManifestRun),
            "ready_for_code" => Ok(Self::ReadyForCode),
            "executed" => Ok(Self::Executed),
            "error" => Ok(Self::Error),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown object state '{}'", other)),
        }
    }
}

/// Execution stages whose output is captured per object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Explorer,
    Manifest,
    GencodeLocal,
    GencodeRemote,
    CodeLocal,
    CodeRemote,
}

impl Stage {
    /// All stages in execution order
    pub const ALL: [Stage; 6] = [
        Stage::Explorer,
        Stage::Manifest,
        Stage::GencodeLocal,
        Stage::GencodeRemote,
        Stage::CodeLocal,
        Stage::CodeRemote,
    ];

    /// File name used for captures and scripts
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explorer => "explorer",
            Self::Manifest => "manifest",
            Self::GencodeLocal => "gencode-local",
            Self::GencodeRemote => "gencode-remote",
            Self::CodeLocal => "code-local",
            Self::CodeRemote => "code-remote",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running one phase for one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseOutcome {
    /// Phase completed
    Success,
    /// Phase was not run
    Skipped { reason: String },
    /// Phase failed; the object moves to `Error`
    Failed { detail: String },
}

impl PhaseOutcome {
    /// Check if the outcome represents success (no failure)
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// Convenience constructor for failures
    pub fn failed(detail: impl Into<String>) -> Self {
        Self::Failed {
            detail: detail.into(),
        }
    }
}

/// What happens to the rest of a host run after an object fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip dependents of the failed object, keep converging independent branches
    Continue,
    /// Abandon every unstarted object and report failure immediately
    #[serde(alias = "abort")]
    AbortOnFirstError,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue" => Ok(Self::Continue),
            "abort" | "abort_on_first_error" => Ok(Self::AbortOnFirstError),
            other => Err(format!(
                "unknown failure policy '{}' (expected 'continue' or 'abort')",
                other
            )),
        }
    }
}

/// Options for one convergence run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Behaviour after an object fails
    pub policy: FailurePolicy,
    /// Executable linked as every type name in `bin/`
    pub exec_path: PathBuf,
    /// Configuration directories, lowest priority first
    pub conf_dirs: Vec<PathBuf>,
    /// Initial manifest (defaults to `conf/manifest/init`)
    pub initial_manifest: Option<PathBuf>,
    /// Parallel object code jobs within one host (beta when > 1)
    pub jobs: usize,
    /// Beta features enabled
    pub beta: bool,
    /// Each object implicitly requires the previous one from the same manifest
    pub order_dependency: bool,
    /// Timeout for a single local or remote command
    pub exec_timeout: Option<Duration>,
    /// Where finished workspaces are kept; `None` disables caching
    pub cache_dir: Option<PathBuf>,
    /// Cache directory name pattern (`%h` host, `%N` session index, `%P` pid)
    pub cache_path_pattern: String,
}

impl RunOptions {
    /// Create options with an explicit failure policy
    pub fn new(policy: FailurePolicy, exec_path: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            exec_path: exec_path.into(),
            conf_dirs: Vec::new(),
            initial_manifest: None,
            jobs: 1,
            beta: false,
            order_dependency: false,
            exec_timeout: None,
            cache_dir: None,
            cache_path_pattern: "%h".to_string(),
        }
    }

    /// Reject option combinations that need beta
    pub fn check_beta(&self) -> crate::Result<()> {
        if self.jobs > 1 && !self.beta {
            return Err(crate::Error::BetaRequired {
                feature: "jobs".to_string(),
            });
        }
        Ok(())
    }
}

/// Output from a local or remote command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub success: bool,
    pub code: Option<i32>,
    pub timed_out: bool,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            success: output.status.success(),
            code: output.status.code(),
            timed_out: false,
        }
    }
}

impl CommandOutput {
    /// Get stdout as a string
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as a string
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_marker() {
        for state in [
            ObjectState::Discovered,
            ObjectState::ManifestRun,
            ObjectState::Skipped,
        ] {
            assert_eq!(state.as_str().parse::<ObjectState>(), Ok(state));
        }
        assert!("bogus".parse::<ObjectState>().is_err());
    }

    #[test]
    fn test_transitions_are_forward_only() {
        use ObjectState::*;
        assert!(Discovered.can_transition_to(Explored));
        assert!(Discovered.can_transition_to(ManifestRun));
        assert!(ManifestRun.can_transition_to(Skipped));
        assert!(ReadyForCode.can_transition_to(Error));
        assert!(!Explored.can_transition_to(Discovered));
        assert!(!Executed.can_transition_to(Error));
        assert!(!Error.can_transition_to(Executed));
        assert!(!Skipped.can_transition_to(Error));
        assert!(Executed.can_transition_to(Executed));
    }

    #[test]
    fn test_failure_policy_parse() {
        assert_eq!("continue".parse(), Ok(FailurePolicy::Continue));
        assert_eq!("abort".parse(), Ok(FailurePolicy::AbortOnFirstError));
        assert!("sometimes".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn test_jobs_need_beta() {
        let mut opts = RunOptions::new(FailurePolicy::Continue, "/bin/true");
        assert!(opts.check_beta().is_ok());
        opts.jobs = 4;
        assert!(matches!(
            opts.check_beta(),
            Err(crate::Error::BetaRequired { .. })
        ));
        opts.beta = true;
        assert!(opts.check_beta().is_ok());
    }
}
