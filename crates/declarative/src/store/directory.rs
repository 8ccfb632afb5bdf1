//! Directory-backed object store
//!
//! Layout for object `__file/etc/motd` under root `out/object`:
//!
//! ```text
//! __file/etc/motd/.object/
//!   parameters        name=value lines, bare name for flags
//!   require           one object name per line
//!   state             state marker
//!   sequence          discovery ordinal
//!   source            declaring manifests
//!   stdin             optional
//!   explorer/<name>   object explorer output
//!   code-local        generated code
//!   code-remote
//!   stdout/<stage>    captured output
//!   stderr/<stage>
//! ```

use super::{CapturedOutput, ObjectRepository, check_transition, lock, merge_into};
use crate::error::{Error, Result};
use crate::object::{ConfigObject, MergeOutcome, OBJECT_MARKER, ObjectDraft, ObjectName, Parameters};
use crate::types::{ObjectState, Stage};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

const PARAMETERS_FILE: &str = "parameters";
const REQUIRE_FILE: &str = "require";
const STATE_FILE: &str = "state";
const SEQUENCE_FILE: &str = "sequence";
const SOURCE_FILE: &str = "source";
const STDIN_FILE: &str = "stdin";

/// Object store rooted at a workspace's `object/` directory
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl DirectoryStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the object's own files
    pub fn object_dir(&self, name: &ObjectName) -> PathBuf {
        self.root.join(name.relative_path()).join(OBJECT_MARKER)
    }

    pub fn parameters_path(&self, name: &ObjectName) -> PathBuf {
        self.object_dir(name).join(PARAMETERS_FILE)
    }

    pub fn explorer_dir(&self, name: &ObjectName) -> PathBuf {
        self.object_dir(name).join("explorer")
    }

    /// Store the output of one object explorer
    pub fn record_explorer(&self, name: &ObjectName, explorer: &str, output: &[u8]) -> Result<()> {
        let dir = self.explorer_dir(name);
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        write(&dir.join(explorer), output)
    }

    /// Write generated code for a code stage and return its path
    pub fn write_code(&self, name: &ObjectName, stage: Stage, code: &[u8]) -> Result<PathBuf> {
        let path = self.object_dir(name).join(stage.as_str());
        write(&path, code)?;
        Ok(path)
    }

    fn count_objects(&self) -> usize {
        WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| e.file_type().is_dir())
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_name() == OBJECT_MARKER)
            .count()
    }

    fn read_object(&self, name: ObjectName) -> Result<ConfigObject> {
        let dir = self.object_dir(&name);

        let parameters = Parameters::from_file_format(&read_optional(&dir.join(PARAMETERS_FILE))?);

        let mut requirements = Vec::new();
        for line in read_optional(&dir.join(REQUIRE_FILE))?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let requirement = ObjectName::parse(line)?;
            if !requirements.contains(&requirement) {
                requirements.push(requirement);
            }
        }

        let state_text = read_optional(&dir.join(STATE_FILE))?;
        let state = if state_text.trim().is_empty() {
            ObjectState::Discovered
        } else {
            state_text.parse().map_err(|e: String| {
                Error::Configuration(format!("{}: {}", dir.join(STATE_FILE).display(), e))
            })?
        };

        let sequence = read_optional(&dir.join(SEQUENCE_FILE))?
            .trim()
            .parse()
            .unwrap_or(u64::MAX);

        let source = read_optional(&dir.join(SOURCE_FILE))?
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        Ok(ConfigObject {
            name,
            parameters,
            requirements,
            state,
            sequence,
            source,
        })
    }

    fn write_links(&self, object: &ConfigObject) -> Result<()> {
        let dir = self.object_dir(&object.name);
        write(&dir.join(REQUIRE_FILE), lines(&object.requirements).as_bytes())?;
        write(&dir.join(SOURCE_FILE), lines(&object.source).as_bytes())
    }
}

impl ObjectRepository for DirectoryStore {
    fn create_or_merge(&self, draft: ObjectDraft) -> Result<MergeOutcome> {
        let _guard = lock(&self.lock);
        let dir = self.object_dir(&draft.name);

        if dir.is_dir() {
            let mut existing = self.read_object(draft.name.clone())?;
            merge_into(&mut existing, &draft)?;
            self.write_links(&existing)?;
            return Ok(MergeOutcome::Merged);
        }

        let sequence = self.count_objects() as u64;
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

        let object = ConfigObject {
            name: draft.name.clone(),
            parameters: draft.parameters,
            requirements: draft.requirements,
            state: ObjectState::Discovered,
            sequence,
            source: draft.source.into_iter().collect(),
        };
        write(
            &dir.join(PARAMETERS_FILE),
            object.parameters.to_file_format().as_bytes(),
        )?;
        write(&dir.join(STATE_FILE), object.state.as_str().as_bytes())?;
        write(&dir.join(SEQUENCE_FILE), sequence.to_string().as_bytes())?;
        self.write_links(&object)?;
        if let Some(stdin) = draft.stdin {
            write(&dir.join(STDIN_FILE), &stdin)?;
        }

        log::debug!("Created object {} (#{})", object.name, sequence);
        Ok(MergeOutcome::Created)
    }

    fn get(&self, name: &ObjectName) -> Result<Option<ConfigObject>> {
        if !self.object_dir(name).is_dir() {
            return Ok(None);
        }
        self.read_object(name.clone()).map(Some)
    }

    fn list_all(&self) -> Result<Vec<ConfigObject>> {
        let mut objects = Vec::new();
        let mut walker = WalkDir::new(&self.root).min_depth(1).into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                Error::io(path, io::Error::other(e.to_string()))
            })?;
            if !entry.file_type().is_dir() || entry.file_name() != OBJECT_MARKER {
                continue;
            }
            walker.skip_current_dir();

            let Some(object_path) = entry.path().parent() else {
                continue;
            };
            let Ok(relative) = object_path.strip_prefix(&self.root) else {
                continue;
            };
            let name = ObjectName::parse(&relative.to_string_lossy())?;
            objects.push(self.read_object(name)?);
        }

        objects.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(objects)
    }

    fn set_state(&self, name: &ObjectName, state: ObjectState) -> Result<()> {
        let _guard = lock(&self.lock);
        let current = self
            .get(name)?
            .ok_or_else(|| Error::Configuration(format!("no such object: {}", name)))?
            .state;
        check_transition(name, current, state)?;
        write(
            &self.object_dir(name).join(STATE_FILE),
            state.as_str().as_bytes(),
        )
    }

    fn add_requirement(&self, name: &ObjectName, requirement: &ObjectName) -> Result<()> {
        let _guard = lock(&self.lock);
        let mut object = self
            .get(name)?
            .ok_or_else(|| Error::Configuration(format!("no such object: {}", name)))?;
        if object.requires(requirement) || requirement == name {
            return Ok(());
        }
        object.requirements.push(requirement.clone());
        self.write_links(&object)
    }

    fn record_output(
        &self,
        name: &ObjectName,
        stage: Stage,
        stdout: &[u8],
        stderr: &[u8],
    ) -> Result<()> {
        let _guard = lock(&self.lock);
        let dir = self.object_dir(name);
        for (kind, data) in [("stdout", stdout), ("stderr", stderr)] {
            let stream_dir = dir.join(kind);
            fs::create_dir_all(&stream_dir).map_err(|e| Error::io(&stream_dir, e))?;
            write(&stream_dir.join(stage.as_str()), data)?;
        }
        Ok(())
    }

    fn captured_output(&self, name: &ObjectName, stage: Stage) -> Result<Option<CapturedOutput>> {
        let dir = self.object_dir(name);
        let stdout_path = dir.join("stdout").join(stage.as_str());
        let stderr_path = dir.join("stderr").join(stage.as_str());
        if !stdout_path.exists() && !stderr_path.exists() {
            return Ok(None);
        }
        Ok(Some(CapturedOutput {
            stdout: read_bytes_optional(&stdout_path)?,
            stderr: read_bytes_optional(&stderr_path)?,
        }))
    }
}

fn lines<T: ToString>(items: &[T]) -> String {
    items.iter().map(|i| format!("{}\n", i.to_string())).collect()
}

fn write(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).map_err(|e| Error::io(path, e))
}

fn read_optional(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(Error::io(path, e)),
    }
}

fn read_bytes_optional(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::io(path, e)),
    }
}
