//! Progress reporting
//!
//! Lets the engine report what it is doing without depending on any UI.

use crate::object::ObjectName;
use crate::report::HostReport;
use crate::scheduler::Phase;

/// Progress callback for host runs
///
/// Hosts run concurrently, so implementations are shared between threads.
pub trait ProgressCallback: Send + Sync {
    /// Called when a host run starts
    fn on_host_start(&self, host: &str);

    /// Called when an object enters a phase
    fn on_object(&self, host: &str, object: &ObjectName, phase: Phase);

    /// Called when a host run finishes, successfully or not
    fn on_host_complete(&self, report: &HostReport);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_host_start(&self, _host: &str) {}
    fn on_object(&self, _host: &str, _object: &ObjectName, _phase: Phase) {}
    fn on_host_complete(&self, _report: &HostReport) {}
}
