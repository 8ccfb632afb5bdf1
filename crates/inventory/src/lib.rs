//! # inventory
//!
//! A flat-file host inventory.
//!
//! Every host is one file in the inventory directory, named after the host
//! and holding one tag per line:
//!
//! ```text
//! inventory/
//!   web1.example.com     "web\nprod\n"
//!   db1.example.com      "db\nprod\n"
//! ```
//!
//! Hosts are selected by name or by tag, where tag selection matches hosts
//! carrying all of the given tags or any of them.
//!
//! ## Example
//!
//! ```no_run
//! use inventory::{Inventory, Selection, TagMatch};
//!
//! let inventory = Inventory::open("/home/me/.converge/inventory")?;
//! inventory.add_hosts(&["web1".to_string()])?;
//! inventory.add_tags(&["web1".to_string()], &["prod".to_string()])?;
//!
//! let hosts = inventory.select(&Selection::Tags {
//!     tags: vec!["prod".to_string()],
//!     mode: TagMatch::Any,
//! })?;
//! assert_eq!(hosts, vec!["web1".to_string()]);
//! # Ok::<(), inventory::Error>(())
//! ```

mod error;
pub mod list;

pub use error::{Error, Result};
pub use list::{parse_list, split_list};

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// How tags select hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagMatch {
    /// Host carries every given tag
    All,
    /// Host carries at least one given tag
    #[default]
    Any,
}

impl TagMatch {
    fn matches(self, host_tags: &BTreeSet<String>, wanted: &BTreeSet<String>) -> bool {
        match self {
            Self::All => wanted.is_subset(host_tags),
            Self::Any => wanted.iter().any(|t| host_tags.contains(t)),
        }
    }
}

/// Which hosts to pick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every host in the inventory
    All,
    /// These hosts, in this order; unknown hosts are left out
    Hosts(Vec<String>),
    /// Hosts whose tags match
    Tags { tags: Vec<String>, mode: TagMatch },
}

/// One host with its tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub host: String,
    pub tags: BTreeSet<String>,
}

/// Inventory rooted at one directory
#[derive(Debug, Clone)]
pub struct Inventory {
    dir: PathBuf,
}

impl Inventory {
    /// Open the inventory, creating its directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        log::debug!("Init inventory: {}", dir.display());
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        } else if !dir.is_dir() {
            return Err(Error::NotADirectory(dir));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn host_path(&self, host: &str) -> Result<PathBuf> {
        if host.is_empty() || host == "." || host == ".." || host.contains('/') {
            return Err(Error::InvalidHost(host.to_string()));
        }
        Ok(self.dir.join(host))
    }

    /// Whether the host has an entry; errors if its path is not a file
    fn check_host(&self, path: &Path) -> Result<bool> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(true),
            Ok(_) => Err(Error::NotAFile(path.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    /// All hosts, sorted
    pub fn hosts(&self) -> Result<Vec<String>> {
        let mut hosts = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| Error::io(&self.dir, e))? {
            let entry = entry.map_err(|e| Error::io(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                hosts.push(name);
            }
        }
        hosts.sort();
        Ok(hosts)
    }

    /// Tags of a host, `None` if the host is unknown
    pub fn tags(&self, host: &str) -> Result<Option<BTreeSet<String>>> {
        let path = self.host_path(host)?;
        if !self.check_host(&path)? {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        Ok(Some(
            content
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }

    fn write_tags(&self, host: &str, tags: &BTreeSet<String>) -> Result<()> {
        let path = self.host_path(host)?;
        let content: String = tags.iter().map(|t| format!("{}\n", t)).collect();
        fs::write(&path, content).map_err(|e| Error::io(&path, e))
    }

    /// Add hosts; existing hosts keep their tags
    pub fn add_hosts(&self, hosts: &[String]) -> Result<()> {
        for host in hosts {
            let path = self.host_path(host)?;
            if self.check_host(&path)? {
                continue;
            }
            log::info!("Adding host '{}'", host);
            fs::write(&path, "").map_err(|e| Error::io(&path, e))?;
        }
        Ok(())
    }

    /// Delete hosts; unknown hosts are ignored
    pub fn del_hosts(&self, hosts: &[String]) -> Result<()> {
        for host in hosts {
            let path = self.host_path(host)?;
            if !self.check_host(&path)? {
                log::info!("Host '{}' not found, skipped", host);
                continue;
            }
            log::info!("Deleting host '{}'", host);
            fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
        }
        Ok(())
    }

    /// Resolve an empty host list to every host
    fn targets(&self, hosts: &[String]) -> Result<Vec<String>> {
        if hosts.is_empty() {
            self.hosts()
        } else {
            Ok(hosts.to_vec())
        }
    }

    /// Add tags to hosts (every host when `hosts` is empty)
    pub fn add_tags(&self, hosts: &[String], tags: &[String]) -> Result<()> {
        for host in self.targets(hosts)? {
            let Some(mut current) = self.tags(&host)? else {
                log::info!("Host '{}' not found, skipped", host);
                continue;
            };
            current.extend(tags.iter().filter(|t| !t.is_empty()).cloned());
            log::debug!("Tags of '{}': {:?}", host, current);
            self.write_tags(&host, &current)?;
        }
        Ok(())
    }

    /// Remove tags from hosts (every host when `hosts` is empty)
    ///
    /// With `all`, every tag is removed and `tags` is ignored.
    pub fn del_tags(&self, hosts: &[String], tags: &[String], all: bool) -> Result<()> {
        for host in self.targets(hosts)? {
            let Some(mut current) = self.tags(&host)? else {
                log::info!("Host '{}' not found, skipped", host);
                continue;
            };
            if all {
                current.clear();
            } else {
                for tag in tags {
                    current.remove(tag);
                }
            }
            self.write_tags(&host, &current)?;
        }
        Ok(())
    }

    /// Hosts with their tags, in selection order
    pub fn list(&self, selection: &Selection) -> Result<Vec<Entry>> {
        let (candidates, filter) = match selection {
            Selection::All => (self.hosts()?, None),
            Selection::Hosts(hosts) => (hosts.clone(), None),
            Selection::Tags { tags, mode } => (
                self.hosts()?,
                Some((tags.iter().cloned().collect::<BTreeSet<String>>(), *mode)),
            ),
        };

        let mut entries = Vec::new();
        for host in candidates {
            let Some(tags) = self.tags(&host)? else {
                log::info!("Host '{}' not found, skipped", host);
                continue;
            };
            if let Some((wanted, mode)) = &filter
                && !mode.matches(&tags, wanted)
            {
                continue;
            }
            entries.push(Entry { host, tags });
        }
        Ok(entries)
    }

    /// Host names for a selection
    pub fn select(&self, selection: &Selection) -> Result<Vec<String>> {
        Ok(self
            .list(selection)?
            .into_iter()
            .map(|entry| entry.host)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn populated() -> (TempDir, Inventory) {
        let tmp = TempDir::new().unwrap();
        let inventory = Inventory::open(tmp.path().join("inventory")).unwrap();
        inventory.add_hosts(&strings(&["web1", "web2", "db1"])).unwrap();
        inventory
            .add_tags(&strings(&["web1", "web2"]), &strings(&["web", "prod"]))
            .unwrap();
        inventory.add_tags(&strings(&["db1"]), &strings(&["db", "prod"])).unwrap();
        inventory.del_tags(&strings(&["web2"]), &strings(&["prod"]), false).unwrap();
        (tmp, inventory)
    }

    #[test]
    fn test_host_file_holds_one_tag_per_line() {
        let (_tmp, inventory) = populated();
        let content = fs::read_to_string(inventory.dir().join("web1")).unwrap();
        assert_eq!(content, "prod\nweb\n");
        assert_eq!(inventory.hosts().unwrap(), strings(&["db1", "web1", "web2"]));
    }

    #[test]
    fn test_select_by_tags() {
        let (_tmp, inventory) = populated();
        let any = inventory
            .select(&Selection::Tags {
                tags: strings(&["db", "web"]),
                mode: TagMatch::Any,
            })
            .unwrap();
        assert_eq!(any, strings(&["db1", "web1", "web2"]));

        let all = inventory
            .select(&Selection::Tags {
                tags: strings(&["web", "prod"]),
                mode: TagMatch::All,
            })
            .unwrap();
        assert_eq!(all, strings(&["web1"]));
    }

    #[test]
    fn test_select_hosts_keeps_order_and_skips_unknown() {
        let (_tmp, inventory) = populated();
        let hosts = inventory
            .select(&Selection::Hosts(strings(&["web2", "ghost", "db1"])))
            .unwrap();
        assert_eq!(hosts, strings(&["web2", "db1"]));
    }

    #[test]
    fn test_add_host_keeps_tags_and_del_host_removes() {
        let (_tmp, inventory) = populated();
        inventory.add_hosts(&strings(&["web1"])).unwrap();
        assert!(inventory.tags("web1").unwrap().unwrap().contains("web"));

        inventory.del_hosts(&strings(&["web1", "ghost"])).unwrap();
        assert!(inventory.tags("web1").unwrap().is_none());
    }

    #[test]
    fn test_tag_ops_default_to_every_host() {
        let (_tmp, inventory) = populated();
        inventory.add_tags(&[], &strings(&["managed"])).unwrap();
        let tagged = inventory
            .select(&Selection::Tags {
                tags: strings(&["managed"]),
                mode: TagMatch::All,
            })
            .unwrap();
        assert_eq!(tagged.len(), 3);

        inventory.del_tags(&[], &[], true).unwrap();
        for entry in inventory.list(&Selection::All).unwrap() {
            assert!(entry.tags.is_empty(), "{} still tagged", entry.host);
        }
    }

    #[test]
    fn test_invalid_host_and_directory() {
        let (tmp, inventory) = populated();
        assert!(matches!(
            inventory.add_hosts(&strings(&["../escape"])),
            Err(Error::InvalidHost(_))
        ));

        let file = tmp.path().join("file");
        fs::write(&file, "").unwrap();
        assert!(matches!(Inventory::open(&file), Err(Error::NotADirectory(_))));

        fs::create_dir(inventory.dir().join("weird")).unwrap();
        assert!(matches!(inventory.tags("weird"), Err(Error::NotAFile(_))));
    }
}
