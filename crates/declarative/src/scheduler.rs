//! Scheduler: drives objects through their phases
//!
//! One work loop per host run. Each round looks at every object that has
//! not reached a terminal state:
//!
//! - an object whose requirements have all executed is **prepared**: its
//!   explorers and manifest run, and the manifest may declare more objects
//!   or add requirements (a parent requires every child it declares);
//! - a prepared object whose requirements have all executed runs its
//!   **code**. With `jobs > 1` every such object of a round runs on a
//!   thread pool, since none of them requires another;
//! - an object with a failed or skipped requirement is skipped.
//!
//! A round that can do none of these means the requirements can never be
//! met. Phases report [`PhaseOutcome`]s. A failed object moves to `Error`
//! and every object depending on it to `Skipped`.

use crate::context::ProgressCallback;
use crate::emulator::Rejection;
use crate::error::{Error, Result};
use crate::object::{ConfigObject, ObjectName};
use crate::resolver::RequirementGraph;
use crate::store::ObjectRepository;
use crate::types::{FailurePolicy, ObjectState, PhaseOutcome};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;

/// Phase of one object, as reported to progress callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Explore,
    Manifest,
    Code,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explore => "explore",
            Self::Manifest => "manifest",
            Self::Code => "code",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs the phases of single objects
///
/// Errors with object scope are turned into a failed outcome for that
/// object; any other error aborts the host run.
pub trait PhaseRunner: Sync {
    /// Run the object's explorers
    fn explore(&self, object: &ConfigObject) -> Result<PhaseOutcome>;

    /// Run the object's type manifest, which may declare more objects
    fn run_manifest(&self, object: &ConfigObject) -> Result<PhaseOutcome>;

    /// Generate and run the object's code
    fn run_code(&self, object: &ConfigObject) -> Result<PhaseOutcome>;
}

/// How a host run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Stopped at the first failure under `AbortOnFirstError`
    Aborted { object: ObjectName },
}

/// Outcome of scheduling one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub status: RunStatus,
    /// Failed objects with the failure detail, in the order they failed
    pub failures: Vec<(ObjectName, String)>,
    /// Declarations the initial manifest had rejected
    pub rejected: Vec<Rejection>,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            status: RunStatus::Completed,
            failures: Vec::new(),
            rejected: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed && self.failures.is_empty() && self.rejected.is_empty()
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.status, RunStatus::Aborted { .. })
    }
}

enum Readiness {
    Ready,
    Blocked,
    /// A requirement failed or was skipped
    Doomed(ObjectName),
}

/// Whether every requirement of `object` has executed
fn readiness(object: &ConfigObject, index: &BTreeMap<&ObjectName, &ConfigObject>) -> Readiness {
    let mut blocked = false;
    for requirement in object.requirements.iter().filter(|r| **r != object.name) {
        match index.get(requirement) {
            Some(req) if req.state.is_failed() => return Readiness::Doomed(requirement.clone()),
            Some(req) if req.state == ObjectState::Executed => {}
            _ => blocked = true,
        }
    }
    if blocked {
        Readiness::Blocked
    } else {
        Readiness::Ready
    }
}

/// What one round of the work loop found to do
#[derive(Default)]
struct Round {
    /// Objects not yet terminal, in declaration order
    pending: Vec<ObjectName>,
    doomed: Vec<(ObjectName, ObjectName)>,
    /// First object ready for its explorers and manifest
    prepare: Option<ConfigObject>,
    /// Prepared objects ready for code
    code: Vec<ConfigObject>,
}

impl Round {
    fn plan(snapshot: &[ConfigObject]) -> Self {
        let index: BTreeMap<&ObjectName, &ConfigObject> =
            snapshot.iter().map(|o| (&o.name, o)).collect();
        let mut round = Self::default();
        for object in snapshot.iter().filter(|o| !o.state.is_terminal()) {
            round.pending.push(object.name.clone());
            match readiness(object, &index) {
                Readiness::Blocked => {}
                Readiness::Doomed(requirement) => {
                    round.doomed.push((object.name.clone(), requirement));
                }
                Readiness::Ready if object.state.is_prepared() => round.code.push(object.clone()),
                Readiness::Ready => {
                    if round.prepare.is_none() {
                        round.prepare = Some(object.clone());
                    }
                }
            }
        }
        round
    }
}

/// Drives one host's objects to a terminal state
pub struct Scheduler<'a> {
    host: &'a str,
    store: &'a dyn ObjectRepository,
    runner: &'a dyn PhaseRunner,
    progress: &'a dyn ProgressCallback,
    policy: FailurePolicy,
    jobs: usize,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        host: &'a str,
        store: &'a dyn ObjectRepository,
        runner: &'a dyn PhaseRunner,
        progress: &'a dyn ProgressCallback,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            host,
            store,
            runner,
            progress,
            policy,
            jobs: 1,
        }
    }

    /// Run code for independent objects on up to `jobs` threads
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Drive every object to a terminal state
    ///
    /// # Errors
    ///
    /// Run-scoped errors, including `Error::UnresolvableRequirements`.
    pub fn run(&self) -> Result<RunSummary> {
        let pool = if self.jobs > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.jobs)
                .build()
                .map_err(|e| Error::Configuration(format!("failed to build thread pool: {}", e)))?;
            Some(pool)
        } else {
            None
        };

        let mut summary = RunSummary::new();
        loop {
            let snapshot = self.store.list_all()?;
            let round = Round::plan(&snapshot);
            if round.pending.is_empty() {
                return Ok(summary);
            }

            if !round.doomed.is_empty() {
                for (name, requirement) in &round.doomed {
                    log::info!("{}: skipping {}, {} did not execute", self.host, name, requirement);
                    self.skip_with_dependents(name)?;
                }
            } else if let Some(object) = round.prepare {
                // Manifests may declare objects or edges, so plan again after each
                self.prepare_object(&object, &mut summary)?;
            } else if !round.code.is_empty() {
                self.execute(round.code, pool.as_ref(), &mut summary)?;
            } else {
                return Err(unresolvable(&snapshot, &round.pending));
            }

            if summary.is_aborted() {
                return Ok(summary);
            }
        }
    }

    fn prepare_object(&self, object: &ConfigObject, summary: &mut RunSummary) -> Result<()> {
        if object.state == ObjectState::Discovered {
            self.progress.on_object(self.host, &object.name, Phase::Explore);
            let outcome = settle(self.runner.explore(object))?;
            if let PhaseOutcome::Failed { detail } = outcome {
                return self.fail(&object.name, detail, summary);
            }
            self.store.set_state(&object.name, ObjectState::Explored)?;
        }

        self.progress.on_object(self.host, &object.name, Phase::Manifest);
        let outcome = settle(self.runner.run_manifest(object))?;
        if let PhaseOutcome::Failed { detail } = outcome {
            return self.fail(&object.name, detail, summary);
        }
        self.store.set_state(&object.name, ObjectState::ManifestRun)
    }

    /// Run code for prepared objects whose requirements have all executed
    ///
    /// No object of `batch` requires another, so with a pool they run
    /// concurrently.
    fn execute(
        &self,
        mut batch: Vec<ConfigObject>,
        pool: Option<&rayon::ThreadPool>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        for object in &mut batch {
            self.store.set_state(&object.name, ObjectState::ReadyForCode)?;
            object.state = ObjectState::ReadyForCode;
        }

        let pool = match pool {
            Some(pool) if batch.len() > 1 => pool,
            _ => {
                for object in &batch {
                    self.progress.on_object(self.host, &object.name, Phase::Code);
                    let outcome = settle(self.runner.run_code(object))?;
                    self.finish_code(&object.name, outcome, summary)?;
                    if summary.is_aborted() {
                        return Ok(());
                    }
                }
                return Ok(());
            }
        };

        log::debug!("{}: running code for {} objects in parallel", self.host, batch.len());
        let outcomes: Vec<(ObjectName, Result<PhaseOutcome>)> = pool.install(|| {
            batch
                .par_iter()
                .map(|object| {
                    self.progress.on_object(self.host, &object.name, Phase::Code);
                    (object.name.clone(), settle(self.runner.run_code(object)))
                })
                .collect()
        });
        for (name, outcome) in outcomes {
            self.finish_code(&name, outcome?, summary)?;
        }
        Ok(())
    }

    fn finish_code(
        &self,
        name: &ObjectName,
        outcome: PhaseOutcome,
        summary: &mut RunSummary,
    ) -> Result<()> {
        match outcome {
            PhaseOutcome::Failed { detail } => self.fail(name, detail, summary),
            PhaseOutcome::Success | PhaseOutcome::Skipped { .. } => {
                self.store.set_state(name, ObjectState::Executed)
            }
        }
    }

    fn fail(&self, name: &ObjectName, detail: String, summary: &mut RunSummary) -> Result<()> {
        log::warn!("{}: {} failed: {}", self.host, name, detail.trim_end());
        self.store.set_state(name, ObjectState::Error)?;
        summary.failures.push((name.clone(), detail));
        self.skip_dependents(name)?;

        if self.policy == FailurePolicy::AbortOnFirstError {
            summary.status = RunStatus::Aborted {
                object: name.clone(),
            };
        }
        Ok(())
    }

    fn skip_with_dependents(&self, name: &ObjectName) -> Result<()> {
        self.store.set_state(name, ObjectState::Skipped)?;
        self.skip_dependents(name)
    }

    fn skip_dependents(&self, name: &ObjectName) -> Result<()> {
        let graph = RequirementGraph::new(&self.store.list_all()?);
        for dependent in graph.dependents_of(name) {
            let terminal = self
                .store
                .get(&dependent)?
                .is_none_or(|o| o.state.is_terminal());
            if !terminal {
                log::debug!("{}: skipping {}, requires {}", self.host, dependent, name);
                self.store.set_state(&dependent, ObjectState::Skipped)?;
            }
        }
        Ok(())
    }
}

/// Why no object can make progress: the graph names the missing
/// requirements or a cycle
fn unresolvable(snapshot: &[ConfigObject], pending: &[ObjectName]) -> Error {
    match RequirementGraph::new(snapshot).topological_order() {
        Err(e) => e,
        Ok(_) => Error::UnresolvableRequirements {
            objects: pending.iter().map(ToString::to_string).collect(),
            missing: Vec::new(),
        },
    }
}

/// Turn object-scoped errors into failed outcomes
fn settle(result: Result<PhaseOutcome>) -> Result<PhaseOutcome> {
    match result {
        Err(e) if e.is_object_scoped() => Ok(PhaseOutcome::failed(e.to_string())),
        other => other,
    }
}
