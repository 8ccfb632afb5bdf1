//! Converging one host, and many hosts at once
//!
//! A host run owns everything it touches: a temporary local workspace, a
//! leased remote session directory, its object store and its transport.
//! The session allocator is the only value shared between host runs.

use crate::allocator::{RemoteSession, SessionLease, SharedAllocator};
use crate::context::ProgressCallback;
use crate::error::{Error, Result};
use crate::object::{ConfigObject, OBJECT_MARKER, ObjectName};
use crate::registry::TypeRegistry;
use crate::report::{HostReport, ObjectReport};
use crate::scheduler::{PhaseRunner, RunSummary, Scheduler};
use crate::store::{DirectoryStore, ObjectRepository};
use crate::transport::{Transport, TransportFactory};
use crate::types::{PhaseOutcome, RunOptions};
use crate::workspace::{Workspace, cache_dir_name};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;

/// State of one host's convergence
pub struct HostRun<'a> {
    pub(crate) host: String,
    pub(crate) options: &'a RunOptions,
    pub(crate) workspace: Workspace,
    pub(crate) registry: TypeRegistry,
    pub(crate) store: DirectoryStore,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) session: RemoteSession,
    pub(crate) progress: &'a dyn ProgressCallback,
    /// Types whose explorers are already on the target
    pub(crate) transferred_types: Mutex<BTreeSet<String>>,
    /// Numbering for per-manifest order files
    pub(crate) manifest_runs: AtomicUsize,
}

impl<'a> HostRun<'a> {
    /// Build the local workspace and connect to the host
    pub fn open(
        host: &str,
        out_path: &std::path::Path,
        options: &'a RunOptions,
        session: RemoteSession,
        factory: &dyn TransportFactory,
        progress: &'a dyn ProgressCallback,
    ) -> Result<Self> {
        let workspace = Workspace::new(out_path, options.conf_dirs.clone(), &options.exec_path);
        let registry = workspace.create_files_dirs()?;
        let store = DirectoryStore::open(&workspace.object_path)?;
        let transport = factory.connect(host, &session)?;

        Ok(Self {
            host: host.to_string(),
            options,
            workspace,
            registry,
            store,
            transport,
            session,
            progress,
            transferred_types: Mutex::new(BTreeSet::new()),
            manifest_runs: AtomicUsize::new(0),
        })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn store(&self) -> &DirectoryStore {
        &self.store
    }

    /// Run every phase for the host
    ///
    /// # Errors
    ///
    /// Any error returned here is fatal to the host run.
    pub fn converge(&self) -> Result<RunSummary> {
        log::info!("{}: converging in {}", self.host, self.session.path);
        self.transport.rmdir(&self.session.path)?;
        self.transport.mkdir(&self.remote_path("conf"))?;
        self.transport.mkdir(&self.remote_path("object"))?;

        self.run_global_explorers()?;
        let rejected = self.run_initial_manifest()?;

        let mut summary = Scheduler::new(
            &self.host,
            &self.store,
            self,
            self.progress,
            self.options.policy,
        )
        .with_jobs(self.options.jobs)
        .run()?;
        summary.rejected = rejected;
        Ok(summary)
    }

    /// Remote path below the session directory
    pub(crate) fn remote_path(&self, relative: &str) -> String {
        format!("{}/{}", self.session.path, relative)
    }

    pub(crate) fn remote_object_dir(&self, name: &ObjectName) -> String {
        format!(
            "{}/object/{}/{}",
            self.session.path,
            name.relative_path().display(),
            OBJECT_MARKER
        )
    }

    /// Environment shared by every script of this run
    pub(crate) fn base_env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            crate::emulator::ENV_TARGET_HOST.to_string(),
            self.host.clone(),
        )])
    }

    /// Build the report from the store
    pub fn report(
        &self,
        outcome: &Result<RunSummary>,
        started_at: DateTime<Utc>,
    ) -> HostReport {
        let failures: BTreeMap<String, String> = match outcome {
            Ok(summary) => summary
                .failures
                .iter()
                .map(|(name, detail)| (name.to_string(), detail.clone()))
                .collect(),
            Err(_) => BTreeMap::new(),
        };

        let mut objects = Vec::new();
        match self.store.list_all() {
            Ok(all) => {
                for object in &all {
                    match self.object_report(object, failures.get(&object.name.to_string())) {
                        Ok(report) => objects.push(report),
                        Err(e) => log::warn!("{}: cannot report {}: {}", self.host, object.name, e),
                    }
                }
            }
            Err(e) => log::warn!("{}: cannot read object store: {}", self.host, e),
        }

        let error = outcome.as_ref().err().map(ToString::to_string);
        let (success, rejected) = match outcome {
            Ok(summary) => (summary.is_success(), summary.rejected.clone()),
            Err(_) => (false, Vec::new()),
        };
        HostReport {
            host: self.host.clone(),
            success,
            objects,
            rejected,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn object_report(&self, object: &ConfigObject, failure: Option<&String>) -> Result<ObjectReport> {
        let mut report = ObjectReport::from_store(&self.store, object, failure.cloned())?;
        report.path = Some(self.store.object_dir(&object.name).display().to_string());
        report.type_path = self
            .registry
            .get(object.name.type_name())
            .map(|t| t.path.display().to_string());
        Ok(report)
    }

    /// Copy the workspace to the cache directory, when caching is enabled
    pub fn save_cache(&self) -> Result<()> {
        let Some(cache_dir) = &self.options.cache_dir else {
            return Ok(());
        };
        let name = cache_dir_name(
            &self.options.cache_path_pattern,
            &self.host,
            self.session.index,
            std::process::id(),
        );
        self.workspace.save_cache(&cache_dir.join(name))
    }

    /// Remove the remote session directory and close the transport
    pub fn cleanup(&self) {
        if let Err(e) = self.transport.cleanup(&self.session.path) {
            log::warn!("{}: cleanup of {} failed: {}", self.host, self.session.path, e);
        }
    }
}

impl PhaseRunner for HostRun<'_> {
    fn explore(&self, object: &ConfigObject) -> Result<PhaseOutcome> {
        self.explore_object(object)
    }

    fn run_manifest(&self, object: &ConfigObject) -> Result<PhaseOutcome> {
        self.run_type_manifest(object)
    }

    fn run_code(&self, object: &ConfigObject) -> Result<PhaseOutcome> {
        self.generate_and_run_code(object)
    }
}

/// Converge one host and report the result
///
/// Never fails: run-scoped errors end up in the report. The local workspace
/// and the remote session are released whatever happens.
pub fn run_host(
    host: &str,
    options: &RunOptions,
    allocator: &SharedAllocator,
    factory: &dyn TransportFactory,
    progress: &dyn ProgressCallback,
) -> HostReport {
    let started_at = Utc::now();
    progress.on_host_start(host);

    let report = match converge_host(host, options, allocator, factory, progress, started_at) {
        Ok(report) => report,
        Err(e) => {
            log::error!("{}: {}", host, e);
            HostReport::aborted(host, e.to_string(), started_at)
        }
    };

    progress.on_host_complete(&report);
    report
}

fn converge_host(
    host: &str,
    options: &RunOptions,
    allocator: &SharedAllocator,
    factory: &dyn TransportFactory,
    progress: &dyn ProgressCallback,
    started_at: DateTime<Utc>,
) -> Result<HostReport> {
    options.check_beta()?;
    let lease = SessionLease::acquire(allocator);
    let tmp = tempfile::Builder::new()
        .prefix("converge.")
        .tempdir()
        .map_err(|e| Error::io(std::env::temp_dir(), e))?;

    let run = HostRun::open(
        host,
        &tmp.path().join("out"),
        options,
        lease.session().clone(),
        factory,
        progress,
    )?;

    let outcome = run.converge();
    if let Err(e) = &outcome {
        log::error!("{}: {}", host, e);
    }
    let report = run.report(&outcome, started_at);

    if let Err(e) = run.save_cache() {
        log::warn!("{}: saving cache failed: {}", host, e);
    }
    run.cleanup();
    Ok(report)
}

/// Converge hosts, up to `parallel` at a time, reports in input order
pub fn run_hosts(
    hosts: &[String],
    options: &RunOptions,
    parallel: usize,
    allocator: &SharedAllocator,
    factory: &dyn TransportFactory,
    progress: &dyn ProgressCallback,
) -> Vec<HostReport> {
    let sequential = || -> Vec<HostReport> {
        hosts
            .iter()
            .map(|h| run_host(h, options, allocator, factory, progress))
            .collect()
    };
    if parallel <= 1 || hosts.len() <= 1 {
        return sequential();
    }

    match rayon::ThreadPoolBuilder::new().num_threads(parallel).build() {
        Ok(pool) => pool.install(|| {
            hosts
                .par_iter()
                .map(|h| run_host(h, options, allocator, factory, progress))
                .collect()
        }),
        Err(e) => {
            log::warn!("Failed to build host thread pool ({}), running hosts one by one", e);
            sequential()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::allocator::{RemoteSessionAllocator, shared};
    use crate::context::NoProgress;
    use crate::transport::LocalTransportFactory;
    use crate::types::{FailurePolicy, ObjectState, Stage};
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    /// Options whose initial manifest stores objects directly, no emulator needed
    fn options(tmp: &Path, conf: PathBuf) -> RunOptions {
        let mut options = RunOptions::new(FailurePolicy::Continue, "/bin/false");
        options.conf_dirs = vec![conf];
        options.cache_dir = Some(tmp.join("cache"));
        options
    }

    /// Declare an object the way the emulator would leave it on disk
    fn declare_script(rel: &str, sequence: usize) -> String {
        format!(
            "d=\"$__global/object/{rel}/.object\"\nmkdir -p \"$d\"\n: > \"$d/parameters\"\nprintf discovered > \"$d/state\"\nprintf {sequence} > \"$d/sequence\"\n"
        )
    }

    #[test]
    fn test_run_host_executes_remote_code() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        write(&conf.join("manifest/init"), &declare_script("__t/x", 0));
        write(&conf.join("type/__t/gencode-remote"), "echo 'echo hello'\n");
        write(&conf.join("explorer/hostname"), "echo \"$__target_host\"\n");

        let options = options(tmp.path(), conf);
        let allocator = shared(RemoteSessionAllocator::new(
            tmp.path().join("remote").display().to_string(),
        ));

        let report = run_host(
            "localhost",
            &options,
            &allocator,
            &LocalTransportFactory::default(),
            &NoProgress,
        );
        assert!(report.success, "{:?}", report.error);
        assert_eq!(report.objects.len(), 1);
        assert_eq!(report.objects[0].state, ObjectState::Executed);

        let cache = tmp.path().join("cache/localhost");
        assert_eq!(
            fs::read_to_string(cache.join("object/__t/x/.object/stdout/code-remote")).unwrap(),
            "hello\n"
        );
        assert_eq!(
            fs::read_to_string(cache.join("explorer/hostname")).unwrap(),
            "localhost\n"
        );
        assert!(!tmp.path().join("remote1").exists());
        assert_eq!(allocator.lock().unwrap().allocate().index, 1);
    }

    #[test]
    fn test_dependent_explorer_sees_requirement_changes() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        let marker = tmp.path().join("marker");
        let manifest = format!(
            "{}{}printf '__b/x\\n' > \"$__global/object/__a/y/.object/require\"\n",
            declare_script("__a/y", 0),
            declare_script("__b/x", 1),
        );
        write(&conf.join("manifest/init"), &manifest);
        write(
            &conf.join("type/__a/explorer/state"),
            &format!("cat '{}' 2>/dev/null || echo absent\n", marker.display()),
        );
        write(
            &conf.join("type/__b/gencode-remote"),
            &format!("echo \"echo created > '{}'\"\n", marker.display()),
        );

        let options = options(tmp.path(), conf);
        let allocator = shared(RemoteSessionAllocator::new(
            tmp.path().join("remote").display().to_string(),
        ));
        let report = run_host(
            "localhost",
            &options,
            &allocator,
            &LocalTransportFactory::default(),
            &NoProgress,
        );
        assert!(report.success, "{:?}", report.error);

        let state = tmp
            .path()
            .join("cache/localhost/object/__a/y/.object/explorer/state");
        assert_eq!(fs::read_to_string(state).unwrap(), "created\n");
    }

    #[test]
    fn test_failing_initial_manifest_aborts_host() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        write(&conf.join("manifest/init"), "echo broken >&2\nexit 1\n");

        let options = options(tmp.path(), conf);
        let allocator = shared(RemoteSessionAllocator::new(
            tmp.path().join("remote").display().to_string(),
        ));
        let report = run_host(
            "localhost",
            &options,
            &allocator,
            &LocalTransportFactory::default(),
            &NoProgress,
        );
        assert!(!report.success);
        assert!(report.error.unwrap().contains("broken"));
    }

    #[test]
    fn test_failed_local_code_skips_remote_code() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        write(&conf.join("manifest/init"), &declare_script("__t/x", 0));
        write(&conf.join("type/__t/gencode-local"), "echo 'echo nope >&2; exit 1'\n");
        write(&conf.join("type/__t/gencode-remote"), "echo 'echo remote'\n");

        let options = options(tmp.path(), conf);
        let allocator = shared(RemoteSessionAllocator::new(
            tmp.path().join("remote").display().to_string(),
        ));
        let report = run_host(
            "localhost",
            &options,
            &allocator,
            &LocalTransportFactory::default(),
            &NoProgress,
        );

        assert!(!report.success);
        let object = &report.objects[0];
        assert_eq!(object.state, ObjectState::Error);
        assert_eq!(object.stderr[0].stage, Stage::CodeLocal);
        assert_eq!(object.stderr[0].text, "nope\n");
        let cache = tmp.path().join("cache/localhost/object/__t/x/.object");
        assert!(!cache.join("stdout/code-remote").exists());
    }

    #[test]
    fn test_run_hosts_keeps_input_order() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        write(&conf.join("manifest/init"), &declare_script("__t/x", 0));
        write(&conf.join("type/__t/gencode-remote"), "echo 'echo \"$__target_host\"'\n");

        let options = options(tmp.path(), conf);
        let allocator = shared(RemoteSessionAllocator::new(
            tmp.path().join("remote").display().to_string(),
        ));
        let hosts: Vec<String> = ["a", "b", "c"].iter().map(|h| h.to_string()).collect();
        let reports = run_hosts(
            &hosts,
            &options,
            3,
            &allocator,
            &LocalTransportFactory::default(),
            &NoProgress,
        );

        let names: Vec<&str> = reports.iter().map(|r| r.host.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(reports.iter().all(|r| r.success));
        for host in ["a", "b", "c"] {
            let out = tmp
                .path()
                .join("cache")
                .join(host)
                .join("object/__t/x/.object/stdout/code-remote");
            assert_eq!(fs::read_to_string(out).unwrap(), format!("{host}\n"));
        }
    }
}
