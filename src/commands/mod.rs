//! Command implementations

pub mod config;
pub mod emulate;
pub mod inventory;
pub mod types;

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

/// Read a host or tag list from a file, `-` meaning stdin
pub(crate) fn read_list_file(path: &Path) -> Result<Vec<String>> {
    if path == Path::new("-") {
        return ::inventory::parse_list(io::stdin().lock()).context("Could not read stdin");
    }
    let file = File::open(path).with_context(|| format!("Could not open {}", path.display()))?;
    ::inventory::parse_list(BufReader::new(file))
        .with_context(|| format!("Could not read {}", path.display()))
}

/// Names from the command line followed by names from a list file, without duplicates
pub(crate) fn collect_names(names: &[String], file: Option<&Path>) -> Result<Vec<String>> {
    let mut all: Vec<String> = names.to_vec();
    if let Some(path) = file {
        all.extend(read_list_file(path)?);
    }
    let mut seen = std::collections::HashSet::new();
    all.retain(|name| seen.insert(name.clone()));
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_names_merges_and_dedupes() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("hosts");
        std::fs::write(&file, "web2\n# comment\nweb1\ndb1\n").unwrap();

        let names = collect_names(&["web1".to_string()], Some(&file)).unwrap();
        assert_eq!(names, vec!["web1", "web2", "db1"]);
    }
}
