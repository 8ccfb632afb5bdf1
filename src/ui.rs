use colored::Colorize;
use declarative::{HostReport, ObjectState};

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.len()).dimmed());
}

// ============================================================================
// Reports
// ============================================================================

/// Object counts per final state, e.g. "3 executed, 1 error"
pub fn state_summary(report: &HostReport) -> String {
    let parts: Vec<String> = report
        .by_state()
        .iter()
        .map(|(state, objects)| format!("{} {}", objects.len(), state))
        .collect();
    if parts.is_empty() {
        "no objects".to_string()
    } else {
        parts.join(", ")
    }
}

/// Format a duration in seconds with one decimal
pub fn format_duration(duration: chrono::Duration) -> String {
    format!("{:.1}s", duration.num_milliseconds() as f64 / 1000.0)
}

/// Print one host's report
pub fn render_report(report: &HostReport) {
    let line = format!(
        "{} ({}, {})",
        report.host,
        state_summary(report),
        format_duration(report.duration())
    );
    if report.success {
        success(&line);
        return;
    }
    error(&line);

    if let Some(message) = &report.error {
        eprintln!("{}", message.trim_end().red());
    }
    for rejection in &report.rejected {
        eprintln!("{} {}", "rejected:".red(), rejection.message);
    }
    for object in report.failed_objects() {
        eprintln!();
        eprint!("{}", object.failure());
    }
    let skipped: Vec<&str> = report
        .objects
        .iter()
        .filter(|o| o.state == ObjectState::Skipped)
        .map(|o| o.name.as_str())
        .collect();
    if !skipped.is_empty() {
        eprintln!();
        eprintln!("{} {}", "skipped:".yellow(), skipped.join(" "));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use declarative::ObjectReport;

    fn object(name: &str, state: ObjectState) -> ObjectReport {
        ObjectReport {
            name: name.to_string(),
            state,
            source: Vec::new(),
            path: None,
            type_path: None,
            stderr: Vec::new(),
            failure: None,
        }
    }

    #[test]
    fn test_state_summary() {
        let now = Utc::now();
        let mut report = HostReport::aborted("web1", "boom".into(), now);
        assert_eq!(state_summary(&report), "no objects");

        report.objects = vec![
            object("__a/1", ObjectState::Executed),
            object("__a/2", ObjectState::Executed),
            object("__b/1", ObjectState::Error),
        ];
        assert_eq!(state_summary(&report), "2 executed, 1 error");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::milliseconds(1300)), "1.3s");
        assert_eq!(format_duration(chrono::Duration::zero()), "0.0s");
    }
}
