//! In-memory object store

use super::{CapturedOutput, ObjectRepository, check_transition, lock, merge_into};
use crate::error::{Error, Result};
use crate::object::{ConfigObject, MergeOutcome, ObjectDraft, ObjectName};
use crate::types::{ObjectState, Stage};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<ObjectName, ConfigObject>,
    outputs: HashMap<(ObjectName, Stage), CapturedOutput>,
    next_sequence: u64,
}

/// Object store kept entirely in memory
///
/// Useful for tests and for driving the scheduler without a workspace.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(name: &ObjectName) -> Error {
    Error::Configuration(format!("no such object: {}", name))
}

impl ObjectRepository for MemoryStore {
    fn create_or_merge(&self, draft: ObjectDraft) -> Result<MergeOutcome> {
        let mut inner = lock(&self.inner);
        if let Some(existing) = inner.objects.get_mut(&draft.name) {
            merge_into(existing, &draft)?;
            return Ok(MergeOutcome::Merged);
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let object = ConfigObject {
            name: draft.name.clone(),
            parameters: draft.parameters,
            requirements: draft.requirements,
            state: ObjectState::Discovered,
            sequence,
            source: draft.source.into_iter().collect(),
        };
        inner.objects.insert(draft.name, object);
        Ok(MergeOutcome::Created)
    }

    fn get(&self, name: &ObjectName) -> Result<Option<ConfigObject>> {
        Ok(lock(&self.inner).objects.get(name).cloned())
    }

    fn list_all(&self) -> Result<Vec<ConfigObject>> {
        let mut all: Vec<ConfigObject> = lock(&self.inner).objects.values().cloned().collect();
        all.sort_by_key(|o| o.sequence);
        Ok(all)
    }

    fn set_state(&self, name: &ObjectName, state: ObjectState) -> Result<()> {
        let mut inner = lock(&self.inner);
        let object = inner.objects.get_mut(name).ok_or_else(|| missing(name))?;
        check_transition(name, object.state, state)?;
        object.state = state;
        Ok(())
    }

    fn add_requirement(&self, name: &ObjectName, requirement: &ObjectName) -> Result<()> {
        let mut inner = lock(&self.inner);
        let object = inner.objects.get_mut(name).ok_or_else(|| missing(name))?;
        if !object.requires(requirement) && requirement != name {
            object.requirements.push(requirement.clone());
        }
        Ok(())
    }

    fn record_output(
        &self,
        name: &ObjectName,
        stage: Stage,
        stdout: &[u8],
        stderr: &[u8],
    ) -> Result<()> {
        let mut inner = lock(&self.inner);
        if !inner.objects.contains_key(name) {
            return Err(missing(name));
        }
        inner.outputs.insert(
            (name.clone(), stage),
            CapturedOutput {
                stdout: stdout.to_vec(),
                stderr: stderr.to_vec(),
            },
        );
        Ok(())
    }

    fn captured_output(&self, name: &ObjectName, stage: Stage) -> Result<Option<CapturedOutput>> {
        Ok(lock(&self.inner).outputs.get(&(name.clone(), stage)).cloned())
    }
}
