//! Type registry - the set of types available in a workspace
//!
//! A type is a directory under `conf/type/` named like `__file`:
//!
//! ```text
//! __file/
//!   manifest              optional, may declare more objects
//!   gencode-local         optional, prints code run on the controller
//!   gencode-remote        optional, prints code run on the target
//!   explorer/             optional object explorers
//!   parameter/required    one name per line (also optional, boolean,
//!                         required_multiple, optional_multiple)
//!   parameter/default/    default values for optional parameters
//!   singleton             marker: the type takes no object id
//! ```

use crate::error::{Error, Result};
use crate::types::Stage;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Check whether a token names a type: `__` followed by `[A-Za-z0-9_]+`
pub fn is_valid_type_name(name: &str) -> bool {
    name.strip_prefix("__").is_some_and(|rest| {
        !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// How a parameter may be given
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Required,
    Optional,
    Boolean,
    RequiredMultiple,
    OptionalMultiple,
}

impl ParamKind {
    const FILES: [(&'static str, ParamKind); 5] = [
        ("required", ParamKind::Required),
        ("optional", ParamKind::Optional),
        ("boolean", ParamKind::Boolean),
        ("required_multiple", ParamKind::RequiredMultiple),
        ("optional_multiple", ParamKind::OptionalMultiple),
    ];

    /// Name of the `parameter/` file declaring this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::Optional => "optional",
            Self::Boolean => "boolean",
            Self::RequiredMultiple => "required_multiple",
            Self::OptionalMultiple => "optional_multiple",
        }
    }

    pub fn is_required(&self) -> bool {
        matches!(self, Self::Required | Self::RequiredMultiple)
    }

    pub fn is_multiple(&self) -> bool {
        matches!(self, Self::RequiredMultiple | Self::OptionalMultiple)
    }
}

/// Declared parameters of a type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSchema {
    params: BTreeMap<String, ParamKind>,
    defaults: BTreeMap<String, String>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a parameter
    pub fn with(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.insert(name.into(), kind);
        self
    }

    /// Declare a default value
    pub fn with_default(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defaults.insert(name.into(), value.into());
        self
    }

    pub fn kind(&self, name: &str) -> Option<ParamKind> {
        self.params.get(name).copied()
    }

    /// Every declared parameter, sorted by name
    pub fn params(&self) -> impl Iterator<Item = (&str, ParamKind)> {
        self.params.iter().map(|(n, k)| (n.as_str(), *k))
    }

    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.params
            .iter()
            .filter(|(_, k)| k.is_required())
            .map(|(n, _)| n.as_str())
    }

    pub fn defaults(&self) -> &BTreeMap<String, String> {
        &self.defaults
    }

    fn load(type_name: &str, dir: &Path) -> Result<Self> {
        let mut schema = Self::new();
        if !dir.is_dir() {
            return Ok(schema);
        }

        for (file, kind) in ParamKind::FILES {
            let path = dir.join(file);
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::io(&path, e)),
            };
            for name in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
                if let Some(previous) = schema.params.insert(name.to_string(), kind)
                    && previous != kind
                {
                    return Err(Error::Configuration(format!(
                        "type {}: parameter '{}' declared as both {:?} and {:?}",
                        type_name, name, previous, kind
                    )));
                }
            }
        }

        let default_dir = dir.join("default");
        if default_dir.is_dir() {
            for name in list_entries(&default_dir)? {
                let path = default_dir.join(&name);
                let value = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
                schema
                    .defaults
                    .insert(name, value.trim_end_matches('\n').to_string());
            }
        }

        Ok(schema)
    }
}

/// An immutable type definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    pub name: String,
    pub path: PathBuf,
    pub singleton: bool,
    pub schema: ParameterSchema,
    pub explorers: Vec<String>,
    pub has_manifest: bool,
    pub has_gencode_local: bool,
    pub has_gencode_remote: bool,
}

impl TypeDef {
    /// Load a type from its directory
    pub fn load(name: &str, path: &Path) -> Result<Self> {
        if !is_valid_type_name(name) {
            return Err(Error::Configuration(format!(
                "invalid type name '{}' at {}",
                name,
                path.display()
            )));
        }
        if !path.is_dir() {
            return Err(Error::Configuration(format!(
                "type {} is not a directory: {}",
                name,
                path.display()
            )));
        }

        let has_manifest = script_present(name, &path.join("manifest"))?;
        let has_gencode_local = script_present(name, &path.join("gencode-local"))?;
        let has_gencode_remote = script_present(name, &path.join("gencode-remote"))?;

        let explorer_dir = path.join("explorer");
        let explorers = if explorer_dir.is_dir() {
            list_entries(&explorer_dir)?
        } else {
            Vec::new()
        };

        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            singleton: path.join("singleton").exists(),
            schema: ParameterSchema::load(name, &path.join("parameter"))?,
            explorers,
            has_manifest,
            has_gencode_local,
            has_gencode_remote,
        })
    }

    pub fn manifest_path(&self) -> Option<PathBuf> {
        self.has_manifest.then(|| self.path.join("manifest"))
    }

    /// Code generator for `GencodeLocal` or `GencodeRemote`
    pub fn gencode_path(&self, stage: Stage) -> Option<PathBuf> {
        let present = match stage {
            Stage::GencodeLocal => self.has_gencode_local,
            Stage::GencodeRemote => self.has_gencode_remote,
            _ => false,
        };
        present.then(|| self.path.join(stage.as_str()))
    }

    pub fn explorer_dir(&self) -> PathBuf {
        self.path.join("explorer")
    }
}

/// All types known to a workspace
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, TypeDef>,
}

impl TypeRegistry {
    /// Scan a merged `conf/type` directory
    pub fn load(type_path: &Path) -> Result<Self> {
        let mut registry = Self::default();
        if !type_path.is_dir() {
            log::debug!("No type directory at {}", type_path.display());
            return Ok(registry);
        }

        for name in list_entries(type_path)? {
            let type_def = TypeDef::load(&name, &type_path.join(&name))?;
            registry.insert(type_def);
        }
        log::debug!(
            "Loaded {} types from {}",
            registry.len(),
            type_path.display()
        );
        Ok(registry)
    }

    /// Add or replace a type
    pub fn insert(&mut self, type_def: TypeDef) {
        self.types.insert(type_def.name.clone(), type_def);
    }

    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    /// Look up a type that must exist
    pub fn require(&self, name: &str) -> Result<&TypeDef> {
        self.get(name)
            .ok_or_else(|| Error::Configuration(format!("unknown type: {}", name)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Non-hidden entries of a directory, sorted
pub(crate) fn list_entries(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn script_present(type_name: &str, path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(true),
        Ok(_) => Err(Error::Configuration(format!(
            "type {}: {} is not a regular file",
            type_name,
            path.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_type_name_rules() {
        assert!(is_valid_type_name("__file"));
        assert!(is_valid_type_name("__package_apt"));
        assert!(!is_valid_type_name("file"));
        assert!(!is_valid_type_name("__"));
        assert!(!is_valid_type_name("__a/b"));
    }

    #[test]
    fn test_load_type_with_schema() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("__file");
        write(&dir.join("parameter/required"), "source\n");
        write(&dir.join("parameter/optional"), "mode\nowner\n");
        write(&dir.join("parameter/boolean"), "force\n");
        write(&dir.join("parameter/default/mode"), "0644\n");
        write(&dir.join("gencode-remote"), "echo true\n");
        write(&dir.join("explorer/stat"), "stat \"/$__object_id\"\n");

        let def = TypeDef::load("__file", &dir).unwrap();
        assert_eq!(def.schema.kind("source"), Some(ParamKind::Required));
        assert_eq!(def.schema.kind("force"), Some(ParamKind::Boolean));
        assert_eq!(def.schema.defaults().get("mode").map(String::as_str), Some("0644"));
        assert_eq!(def.explorers, vec!["stat".to_string()]);
        assert!(def.gencode_path(Stage::GencodeRemote).is_some());
        assert!(def.gencode_path(Stage::GencodeLocal).is_none());
        assert!(def.manifest_path().is_none());
        assert!(!def.singleton);
    }

    #[test]
    fn test_manifest_directory_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("__broken");
        fs::create_dir_all(dir.join("manifest")).unwrap();
        assert!(matches!(
            TypeDef::load("__broken", &dir),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_registry_rejects_bad_names() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("__good")).unwrap();
        fs::create_dir_all(tmp.path().join("bad-name")).unwrap();
        assert!(matches!(
            TypeRegistry::load(tmp.path()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_registry_lists_types() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("__b")).unwrap();
        fs::create_dir_all(tmp.path().join("__a")).unwrap();
        write(&tmp.path().join("__a/singleton"), "");

        let registry = TypeRegistry::load(tmp.path()).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["__a", "__b"]);
        assert!(registry.require("__a").unwrap().singleton);
        assert!(registry.require("__c").is_err());
    }
}
