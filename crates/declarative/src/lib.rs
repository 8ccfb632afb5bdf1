//! # Declarative
//!
//! An agentless configuration-management engine.
//!
//! A host is converged by running shell "types" against it. Manifests
//! declare objects (instances of types); objects declare requirements on
//! each other; the engine discovers every object and prepares and runs each
//! one only after everything it requires has executed.
//!
//! ## Core Concepts
//!
//! - **Type**: a directory of explorers, a manifest and code generators
//! - **Object**: a `(type, object-id)` instance, the unit of convergence
//! - **Workspace**: the local staging tree of one host run
//! - **Emulator**: turns type invocations in manifests into stored objects
//! - **Scheduler**: drives objects from `discovered` to a terminal state
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{
//!     FailurePolicy, LocalTransportFactory, NoProgress, RemoteSessionAllocator,
//!     RunOptions, run_host, shared,
//! };
//!
//! let mut options = RunOptions::new(FailurePolicy::Continue, "/usr/bin/converge");
//! options.conf_dirs = vec!["/etc/converge/conf".into()];
//!
//! let allocator = shared(RemoteSessionAllocator::default());
//! let report = run_host(
//!     "localhost",
//!     &options,
//!     &allocator,
//!     &LocalTransportFactory::default(),
//!     &NoProgress,
//! );
//! assert!(report.success);
//! ```
//!
//! ## Collaborator Traits
//!
//! - [`Transport`] / [`TransportFactory`]: copy and exec on a target
//! - [`ObjectRepository`]: where objects live during a run
//! - [`PhaseRunner`]: runs one object's phases for the [`Scheduler`]
//! - [`TypeHandler`]: validates and registers one type's invocations
//! - [`ProgressCallback`]: receives progress updates

pub mod allocator;
pub mod code;
pub mod context;
pub mod emulator;
pub mod error;
pub mod explorer;
pub mod host;
pub mod manifest;
pub mod object;
pub mod process;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod types;
pub mod workspace;

// Re-export main types at crate root
pub use allocator::{
    DEFAULT_REMOTE_BASE, RemoteSession, RemoteSessionAllocator, SessionLease, SharedAllocator,
    shared,
};
pub use context::{NoProgress, ProgressCallback};
pub use emulator::{
    Declared, Emulator, EmulatorEnv, Invocation, Rejection, SchemaHandler, TypeHandler,
    run_from_process, type_name_from_argv0,
};
pub use error::{Error, ErrorScope, Result};
pub use host::{HostRun, run_host, run_hosts};
pub use object::{ConfigObject, MergeOutcome, ObjectDraft, ObjectName, ParamValue, Parameters};
pub use registry::{ParamKind, ParameterSchema, TypeDef, TypeRegistry};
pub use report::{HostReport, ObjectFailure, ObjectReport, StageOutput};
pub use resolver::RequirementGraph;
pub use scheduler::{Phase, PhaseRunner, RunStatus, RunSummary, Scheduler};
pub use store::{CapturedOutput, DirectoryStore, MemoryStore, ObjectRepository};
pub use transport::{
    LocalTransport, LocalTransportFactory, SshTransport, SshTransportFactory, Transport,
    TransportFactory,
};
pub use types::{
    CommandOutput, FailurePolicy, ObjectState, PhaseOutcome, RunOptions, Stage,
};
pub use workspace::{Workspace, cache_dir_name, search_path, split_search_path};
