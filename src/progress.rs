//! Progress indicators for converge runs.
//!
//! One spinner per host, showing the object and phase the host is working on.

use colored::Colorize;
use declarative::{HostReport, ObjectName, Phase, ProgressCallback};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Create a spinner with a message
pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style());
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {prefix:.bold} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Spinners for concurrently converging hosts
pub struct HostProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl HostProgress {
    pub fn new(visible: bool) -> Self {
        let multi = if visible {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self {
            multi,
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bars(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProgressBar>> {
        match self.bars.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ProgressCallback for HostProgress {
    fn on_host_start(&self, host: &str) {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(spinner_style());
        pb.set_prefix(host.to_string());
        pb.set_message("preparing workspace");
        pb.enable_steady_tick(Duration::from_millis(100));
        self.bars().insert(host.to_string(), pb);
    }

    fn on_object(&self, host: &str, object: &ObjectName, phase: Phase) {
        if let Some(pb) = self.bars().get(host) {
            pb.set_message(format!("{} {}", phase, object));
        }
    }

    fn on_host_complete(&self, report: &HostReport) {
        let Some(pb) = self.bars().remove(&report.host) else {
            return;
        };
        let mark = if report.success {
            "✓".green()
        } else {
            "✗".red()
        };
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.finish_with_message(format!("{} {}", mark, report.host));
    }
}
