//! Object store: durable CRUD for configuration objects
//!
//! The [`ObjectRepository`] trait is the typed interface the emulator and the
//! scheduler share. [`DirectoryStore`] keeps the on-disk layout external
//! tooling relies on; [`MemoryStore`] serves tests and callers that do not
//! need persistence.

pub mod directory;
pub mod memory;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;

use crate::error::{Error, Result};
use crate::object::{ConfigObject, MergeOutcome, ObjectDraft, ObjectName};
use crate::types::{ObjectState, Stage};
use std::sync::{Mutex, MutexGuard};

/// Captured stdout/stderr of one stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Repository of objects for one host run
///
/// Implementations serialize mutations; the scheduler may call them from
/// several threads during a parallel code stage.
pub trait ObjectRepository: Send + Sync {
    /// Create a `Discovered` object, or merge an identical re-declaration
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` if the object exists with different parameters.
    fn create_or_merge(&self, draft: ObjectDraft) -> Result<MergeOutcome>;

    /// Look up one object
    fn get(&self, name: &ObjectName) -> Result<Option<ConfigObject>>;

    /// All objects, in declaration order
    fn list_all(&self) -> Result<Vec<ConfigObject>>;

    /// All objects of one type, in declaration order
    fn list_by_type(&self, type_name: &str) -> Result<Vec<ConfigObject>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|o| o.name.type_name() == type_name)
            .collect())
    }

    /// Move an object to a new state, enforcing forward-only transitions
    fn set_state(&self, name: &ObjectName, state: ObjectState) -> Result<()>;

    /// Add a requirement edge `name -> requirement` (idempotent)
    fn add_requirement(&self, name: &ObjectName, requirement: &ObjectName) -> Result<()>;

    /// Store the output of one stage, replacing any previous capture
    fn record_output(
        &self,
        name: &ObjectName,
        stage: Stage,
        stdout: &[u8],
        stderr: &[u8],
    ) -> Result<()>;

    /// Read back the output of one stage
    fn captured_output(&self, name: &ObjectName, stage: Stage) -> Result<Option<CapturedOutput>>;
}

/// Merge a draft into an existing record, or fail on conflicting parameters
pub(crate) fn merge_into(existing: &mut ConfigObject, draft: &ObjectDraft) -> Result<()> {
    if existing.parameters != draft.parameters {
        return Err(Error::Conflict {
            object: existing.name.to_string(),
            message: format!(
                "parameters differ from first definition ({})",
                existing.parameters.describe_difference(&draft.parameters)
            ),
        });
    }
    for requirement in &draft.requirements {
        if !existing.requirements.contains(requirement) && *requirement != existing.name {
            existing.requirements.push(requirement.clone());
        }
    }
    if let Some(source) = &draft.source
        && !existing.source.contains(source)
    {
        existing.source.push(source.clone());
    }
    Ok(())
}

/// Check a transition and build the error the stores report
pub(crate) fn check_transition(
    name: &ObjectName,
    current: ObjectState,
    next: ObjectState,
) -> Result<()> {
    if current.can_transition_to(next) {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "illegal state transition for {}: {} -> {}",
            name, current, next
        )))
    }
}

/// Lock a mutex, recovering the data if another thread panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
