//! Type invocations from manifests
//!
//! Manifests run with the workspace `bin/` first in `PATH`; every type name
//! there links to this executable.

use anyhow::{Context as _, Result};

pub fn run(type_name: &str, args: Vec<String>) -> Result<()> {
    let declared = declarative::run_from_process(type_name, args)
        .with_context(|| format!("{} failed", type_name))?;
    log::debug!("{}: {:?}", declared.name, declared.outcome);
    Ok(())
}
