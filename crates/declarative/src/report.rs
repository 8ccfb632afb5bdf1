//! Per-host results handed back to the caller

use crate::emulator::Rejection;
use crate::error::Result;
use crate::object::ConfigObject;
use crate::store::ObjectRepository;
use crate::types::{ObjectState, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const LINE_LENGTH: usize = 74;

/// Captured stderr of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutput {
    pub stage: Stage,
    pub text: String,
}

/// Final state of one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReport {
    pub name: String,
    pub state: ObjectState,
    /// Manifests that declared the object
    pub source: Vec<String>,
    /// Object directory in the workspace, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Type directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_path: Option<String>,
    /// Non-empty stderr captures, in stage order
    pub stderr: Vec<StageOutput>,
    /// Why the object failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ObjectReport {
    /// Collect an object's record and captures from the store
    pub fn from_store(
        store: &dyn ObjectRepository,
        object: &ConfigObject,
        failure: Option<String>,
    ) -> Result<Self> {
        let mut stderr = Vec::new();
        for stage in Stage::ALL {
            if let Some(output) = store.captured_output(&object.name, stage)?
                && !output.stderr.is_empty()
            {
                stderr.push(StageOutput {
                    stage,
                    text: String::from_utf8_lossy(&output.stderr).to_string(),
                });
            }
        }
        Ok(Self {
            name: object.name.to_string(),
            state: object.state,
            source: object.source.clone(),
            path: None,
            type_path: None,
            stderr,
            failure,
        })
    }

    /// Failure rendering with name, source and verbatim stderr
    pub fn failure(&self) -> ObjectFailure<'_> {
        ObjectFailure(self)
    }
}

/// Display of a failed object
pub struct ObjectFailure<'a>(&'a ObjectReport);

impl fmt::Display for ObjectFailure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.0;
        if let Some(message) = &report.failure {
            writeln!(f, "{}", message.trim_end())?;
        }
        writeln!(f, "{:-<width$}", "---- object ", width = LINE_LENGTH)?;
        writeln!(f, "name: {}", report.name)?;
        if let Some(path) = &report.path {
            writeln!(f, "path: {}", path)?;
        }
        writeln!(f, "source: {}", report.source.join(" "))?;
        if let Some(type_path) = &report.type_path {
            writeln!(f, "type: {}", type_path)?;
        }
        for output in &report.stderr {
            let label = format!("{}:stderr ", output.stage);
            writeln!(f, "{:-<width$}", label, width = LINE_LENGTH)?;
            write!(f, "{}", output.text)?;
            if !output.text.ends_with('\n') {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

/// Result of converging one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostReport {
    pub host: String,
    pub success: bool,
    pub objects: Vec<ObjectReport>,
    /// Declarations the initial manifest had rejected
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<Rejection>,
    /// Run-scoped error that ended the run early
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl HostReport {
    /// Report for a run that ended with a run-scoped error
    pub fn aborted(host: &str, error: String, started_at: DateTime<Utc>) -> Self {
        Self {
            host: host.to_string(),
            success: false,
            objects: Vec::new(),
            rejected: Vec::new(),
            error: Some(error),
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Objects grouped by final state
    pub fn by_state(&self) -> BTreeMap<ObjectState, Vec<&ObjectReport>> {
        let mut grouped: BTreeMap<ObjectState, Vec<&ObjectReport>> = BTreeMap::new();
        for object in &self.objects {
            grouped.entry(object.state).or_default().push(object);
        }
        grouped
    }

    /// Objects that ended in `Error`
    pub fn failed_objects(&self) -> impl Iterator<Item = &ObjectReport> {
        self.objects
            .iter()
            .filter(|o| o.state == ObjectState::Error)
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
