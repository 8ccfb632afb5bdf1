//! Local workspace: the per-host staging tree
//!
//! ```text
//! out/
//!   bin/                   one emulator link per type name
//!   conf/explorer/         merged global explorers
//!   conf/manifest/         merged manifests
//!   conf/type/             merged types
//!   explorer/              global explorer output
//!   object/                object store
//! ```
//!
//! Every entry under `conf/<sub>/` is a link to exactly one configuration
//! directory's entry. Later directories shadow earlier ones entry by entry.

use crate::error::{Error, Result};
use crate::registry::TypeRegistry;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Subdirectories merged from every configuration directory
pub const CONF_SUBDIRS: [&str; 3] = ["explorer", "manifest", "type"];

/// The staging tree for one host run
#[derive(Debug, Clone)]
pub struct Workspace {
    pub out_path: PathBuf,
    pub bin_path: PathBuf,
    pub conf_path: PathBuf,
    pub global_explorer_out_path: PathBuf,
    pub object_path: PathBuf,
    pub global_explorer_path: PathBuf,
    pub manifest_path: PathBuf,
    pub type_path: PathBuf,
    conf_dirs: Vec<PathBuf>,
    exec_path: PathBuf,
}

impl Workspace {
    /// Describe a workspace rooted at `out_path`
    ///
    /// `conf_dirs` are ordered lowest priority first. `exec_path` is the
    /// executable every type name in `bin/` resolves to.
    pub fn new(
        out_path: impl Into<PathBuf>,
        conf_dirs: Vec<PathBuf>,
        exec_path: impl Into<PathBuf>,
    ) -> Self {
        let out_path = out_path.into();
        let conf_path = out_path.join("conf");
        Self {
            bin_path: out_path.join("bin"),
            global_explorer_out_path: out_path.join("explorer"),
            object_path: out_path.join("object"),
            global_explorer_path: conf_path.join("explorer"),
            manifest_path: conf_path.join("manifest"),
            type_path: conf_path.join("type"),
            conf_path,
            out_path,
            conf_dirs,
            exec_path: exec_path.into(),
        }
    }

    pub fn conf_dirs(&self) -> &[PathBuf] {
        &self.conf_dirs
    }

    /// Default initial manifest
    pub fn initial_manifest(&self) -> PathBuf {
        self.manifest_path.join("init")
    }

    /// Build the tree, merge configuration and link the emulator
    ///
    /// Returns the registry of the merged types.
    pub fn create_files_dirs(&self) -> Result<TypeRegistry> {
        self.create_context_dirs()?;
        self.link_conf_dirs()?;
        let registry = TypeRegistry::load(&self.type_path)?;
        self.link_types_for_emulator(&registry)?;
        Ok(registry)
    }

    fn create_context_dirs(&self) -> Result<()> {
        for dir in [
            &self.out_path,
            &self.bin_path,
            &self.global_explorer_out_path,
            &self.object_path,
        ] {
            mkdir(dir)?;
        }
        for sub_dir in CONF_SUBDIRS {
            mkdir(&self.conf_path.join(sub_dir))?;
        }
        Ok(())
    }

    fn link_conf_dirs(&self) -> Result<()> {
        for conf_dir in &self.conf_dirs {
            log::debug!("Checking conf dir {}", conf_dir.display());
            for sub_dir in CONF_SUBDIRS {
                let current = conf_dir.join(sub_dir);
                // Conf dirs may carry only part of the tree
                if !current.is_dir() {
                    continue;
                }

                for entry in fs::read_dir(&current).map_err(|e| Error::io(&current, e))? {
                    let entry = entry.map_err(|e| Error::io(&current, e))?;
                    let src = entry.path();
                    let dst = self.conf_path.join(sub_dir).join(entry.file_name());
                    log::trace!("Linking {} to {}", src.display(), dst.display());
                    relink(&src, &dst).map_err(|e| {
                        Error::Configuration(format!(
                            "linking {} {} to {} failed: {}",
                            sub_dir,
                            src.display(),
                            dst.display(),
                            e
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }

    fn link_types_for_emulator(&self, registry: &TypeRegistry) -> Result<()> {
        let src = std::path::absolute(&self.exec_path).map_err(|e| Error::io(&self.exec_path, e))?;
        for name in registry.names() {
            let dst = self.bin_path.join(name);
            log::trace!("Linking emulator {} to {}", src.display(), dst.display());
            relink(&src, &dst).map_err(|e| {
                Error::Configuration(format!(
                    "linking emulator from {} to {} failed: {}",
                    src.display(),
                    dst.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Copy the finished tree to `dest`, replacing an earlier copy
    ///
    /// Links are copied as links so the cache records which configuration
    /// directory each entry came from.
    pub fn save_cache(&self, dest: &Path) -> Result<()> {
        log::debug!("Saving workspace cache to {}", dest.display());
        if fs::symlink_metadata(dest).is_ok() {
            fs::remove_dir_all(dest).map_err(|e| Error::io(dest, e))?;
        }
        if let Some(parent) = dest.parent() {
            mkdir(parent)?;
        }
        copy_tree(&self.out_path, dest)
    }
}

/// Build the cache directory name from a pattern
///
/// `%h` is the host, `%N` the remote session index and `%P` the process id.
/// Path separators in the host are replaced so every host gets one directory.
pub fn cache_dir_name(pattern: &str, host: &str, session_index: usize, pid: u32) -> String {
    let host = host.replace(['/', '\\'], "_");
    pattern
        .replace("%h", &host)
        .replace("%N", &session_index.to_string())
        .replace("%P", &pid.to_string())
}

/// Split a `:`-separated search path; `\:` is a literal colon
pub fn split_search_path(value: &str) -> Vec<PathBuf> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&':') => {
                current.push(':');
                chars.next();
            }
            ':' => entries.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    entries.push(current);
    entries
        .into_iter()
        .filter(|e| !e.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Assemble configuration directories, lowest priority first
///
/// Order: distribution, home, the search-path variable (reversed so its first
/// entry wins), then directories given by the caller.
pub fn search_path(
    dist: Option<&Path>,
    home: Option<&Path>,
    env_value: Option<&str>,
    extra: &[PathBuf],
) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    dirs.extend(dist.map(Path::to_path_buf));
    dirs.extend(home.map(Path::to_path_buf));
    if let Some(value) = env_value {
        let mut env_dirs = split_search_path(value);
        env_dirs.reverse();
        dirs.extend(env_dirs);
    }
    dirs.extend(extra.iter().cloned());
    dirs
}

fn mkdir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::io(path, e))
}

/// Replace whatever is at `dst` with a link to `src`
fn relink(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::symlink_metadata(dst) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(dst)?,
        Ok(_) => fs::remove_file(dst)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    symlink(src, dst)
}

#[cfg(unix)]
fn symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(not(unix))]
fn symlink(_src: &Path, _dst: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks are required for the workspace",
    ))
}

/// Copy a tree, keeping links as links
fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            Error::io(path, io::Error::other(e.to_string()))
        })?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|e| Error::io(entry.path(), e))?;
            symlink(&link, &target).map_err(|e| Error::io(&target, e))?;
        } else if file_type.is_dir() {
            mkdir(&target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| Error::io(&target, e))?;
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_layout_is_created() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path().join("out"), Vec::new(), "/bin/true");
        ws.create_files_dirs().unwrap();

        for sub in ["bin", "conf/explorer", "conf/manifest", "conf/type", "explorer", "object"] {
            assert!(tmp.path().join("out").join(sub).is_dir(), "missing {sub}");
        }
    }

    #[test]
    fn test_later_conf_dir_overrides_entry() {
        let tmp = TempDir::new().unwrap();
        let d1 = tmp.path().join("d1");
        let d2 = tmp.path().join("d2");
        write(&d1.join("manifest/foo"), "from d1\n");
        write(&d1.join("manifest/only-d1"), "d1\n");
        write(&d2.join("manifest/foo"), "from d2\n");

        let ws = Workspace::new(tmp.path().join("out"), vec![d1.clone(), d2.clone()], "/bin/true");
        ws.create_files_dirs().unwrap();

        let foo = ws.manifest_path.join("foo");
        assert_eq!(fs::read_to_string(&foo).unwrap(), "from d2\n");
        assert_eq!(fs::read_link(&foo).unwrap(), d2.join("manifest/foo"));
        assert_eq!(
            fs::read_link(ws.manifest_path.join("only-d1")).unwrap(),
            d1.join("manifest/only-d1")
        );
    }

    #[test]
    fn test_types_get_emulator_links() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        fs::create_dir_all(conf.join("type/__file")).unwrap();
        fs::create_dir_all(conf.join("type/__package")).unwrap();
        let exec = tmp.path().join("converge");
        write(&exec, "");

        let ws = Workspace::new(tmp.path().join("out"), vec![conf], &exec);
        let registry = ws.create_files_dirs().unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(fs::read_link(ws.bin_path.join("__file")).unwrap(), exec);
        assert_eq!(fs::read_link(ws.bin_path.join("__package")).unwrap(), exec);
    }

    #[test]
    fn test_create_twice_relinks() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        write(&conf.join("explorer/os"), "uname\n");
        let ws = Workspace::new(tmp.path().join("out"), vec![conf], "/bin/true");
        ws.create_files_dirs().unwrap();
        ws.create_files_dirs().unwrap();
        assert!(ws.global_explorer_path.join("os").is_file());
    }

    #[test]
    fn test_split_search_path() {
        assert_eq!(
            split_search_path("/a:/b\\:c::/d"),
            vec![PathBuf::from("/a"), PathBuf::from("/b:c"), PathBuf::from("/d")]
        );
        assert!(split_search_path("").is_empty());
    }

    #[test]
    fn test_search_path_order() {
        let dirs = search_path(
            Some(Path::new("/dist")),
            Some(Path::new("/home/u/.converge")),
            Some("/first:/second"),
            &[PathBuf::from("/extra")],
        );
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/dist"),
                PathBuf::from("/home/u/.converge"),
                PathBuf::from("/second"),
                PathBuf::from("/first"),
                PathBuf::from("/extra"),
            ]
        );
    }

    #[test]
    fn test_cache_dir_name() {
        assert_eq!(cache_dir_name("%h", "web1", 3, 42), "web1");
        assert_eq!(cache_dir_name("%h-%N-%P", "db/1", 3, 42), "db_1-3-42");
    }

    #[test]
    fn test_save_cache_keeps_links() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        write(&conf.join("manifest/init"), "true\n");
        let ws = Workspace::new(tmp.path().join("out"), vec![conf.clone()], "/bin/true");
        ws.create_files_dirs().unwrap();
        write(&ws.object_path.join("__t/x/.object/parameters"), "a=b\n");

        let cache = tmp.path().join("cache/host");
        ws.save_cache(&cache).unwrap();
        ws.save_cache(&cache).unwrap();

        assert_eq!(
            fs::read_link(cache.join("conf/manifest/init")).unwrap(),
            conf.join("manifest/init")
        );
        assert_eq!(
            fs::read_to_string(cache.join("object/__t/x/.object/parameters")).unwrap(),
            "a=b\n"
        );
    }
}
