//! Configuration objects: names, parameters and stored records

use crate::error::{Error, Result};
use crate::types::ObjectState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Reserved directory name holding an object's own files
pub const OBJECT_MARKER: &str = ".object";

/// Identity of an object: `(type name, object id)`
///
/// Rendered as `type/object-id`, or just `type` for singletons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectName {
    type_name: String,
    object_id: String,
}

impl ObjectName {
    /// Build a name, validating the object id
    ///
    /// One leading `/` is stripped so absolute paths can serve as ids.
    pub fn new(type_name: impl Into<String>, object_id: &str) -> Result<Self> {
        let type_name = type_name.into();
        let object_id = object_id.strip_prefix('/').unwrap_or(object_id);

        if !object_id.is_empty() {
            for segment in object_id.split('/') {
                let bad = match segment {
                    "" => Some("empty path segment"),
                    "." | ".." => Some("relative path segment"),
                    OBJECT_MARKER => Some("reserved segment '.object'"),
                    _ => None,
                };
                if let Some(reason) = bad {
                    return Err(Error::validation(
                        format!("{}/{}", type_name, object_id),
                        format!("illegal object id: {}", reason),
                    ));
                }
            }
            if object_id.contains('\n') {
                return Err(Error::validation(
                    type_name,
                    "illegal object id: contains a newline",
                ));
            }
        }

        Ok(Self {
            type_name,
            object_id: object_id.to_string(),
        })
    }

    /// Parse `type/object-id` (or a bare singleton `type`)
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        let (type_name, object_id) = name.split_once('/').unwrap_or((name, ""));
        if type_name.is_empty() {
            return Err(Error::validation(name, "object name has no type"));
        }
        Self::new(type_name, object_id)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn is_singleton(&self) -> bool {
        self.object_id.is_empty()
    }

    /// Path of the object relative to an object root
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::from(&self.type_name);
        if !self.object_id.is_empty() {
            path.push(&self.object_id);
        }
        path
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.object_id.is_empty() {
            f.write_str(&self.type_name)
        } else {
            write!(f, "{}/{}", self.type_name, self.object_id)
        }
    }
}

/// A single parameter value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamValue {
    /// Boolean parameter, present
    Flag,
    /// One or more string values
    Values(Vec<String>),
}

/// Ordered parameters of an object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters(BTreeMap<String, ParamValue>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value (repeated calls build a multiple parameter)
    pub fn insert_value(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let entry = self
            .0
            .entry(name.into())
            .or_insert_with(|| ParamValue::Values(Vec::new()));
        match entry {
            ParamValue::Values(values) => values.push(value.into()),
            ParamValue::Flag => *entry = ParamValue::Values(vec![value.into()]),
        }
    }

    /// Mark a boolean parameter present
    pub fn set_flag(&mut self, name: impl Into<String>) {
        self.0.insert(name.into(), ParamValue::Flag);
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// First value of a parameter
    pub fn value(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(ParamValue::Values(values)) => values.first().map(String::as_str),
            _ => None,
        }
    }

    pub fn has_flag(&self, name: &str) -> bool {
        matches!(self.0.get(name), Some(ParamValue::Flag))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Serialize to the `parameters` file: `name=value` per value, bare `name` for flags
    pub fn to_file_format(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.0 {
            match value {
                ParamValue::Flag => {
                    out.push_str(name);
                    out.push('\n');
                }
                ParamValue::Values(values) => {
                    for v in values {
                        out.push_str(name);
                        out.push('=');
                        out.push_str(v);
                        out.push('\n');
                    }
                }
            }
        }
        out
    }

    /// Parse the `parameters` file format
    pub fn from_file_format(content: &str) -> Self {
        let mut params = Self::new();
        // Values may end in '\r'; only '\n' separates entries
        for line in content.split('\n').filter(|l| !l.is_empty()) {
            match line.split_once('=') {
                Some((name, value)) => params.insert_value(name, value),
                None => params.set_flag(line),
            }
        }
        params
    }

    /// Describe the parameters that differ between two sets
    pub fn describe_difference(&self, other: &Parameters) -> String {
        let mut names: Vec<&String> = self.0.keys().chain(other.0.keys()).collect();
        names.sort();
        names.dedup();

        let render = |v: Option<&ParamValue>| match v {
            None => "<unset>".to_string(),
            Some(ParamValue::Flag) => "<set>".to_string(),
            Some(ParamValue::Values(values)) => values.join(","),
        };

        names
            .into_iter()
            .filter(|n| self.0.get(*n) != other.0.get(*n))
            .map(|n| {
                format!(
                    "--{}: {} != {}",
                    n,
                    render(self.0.get(n)),
                    render(other.0.get(n))
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// An object as recorded in the object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigObject {
    pub name: ObjectName,
    pub parameters: Parameters,
    /// Objects that must complete first (set semantics, declaration order)
    pub requirements: Vec<ObjectName>,
    pub state: ObjectState,
    /// Discovery ordinal, the declaration-order tie-break
    pub sequence: u64,
    /// Manifests that declared this object
    pub source: Vec<String>,
}

impl ConfigObject {
    pub fn requires(&self, other: &ObjectName) -> bool {
        self.requirements.contains(other)
    }
}

/// A declaration on its way into the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDraft {
    pub name: ObjectName,
    pub parameters: Parameters,
    pub requirements: Vec<ObjectName>,
    pub source: Option<String>,
    pub stdin: Option<Vec<u8>>,
}

impl ObjectDraft {
    pub fn new(name: ObjectName, parameters: Parameters) -> Self {
        Self {
            name,
            parameters,
            requirements: Vec::new(),
            source: None,
            stdin: None,
        }
    }

    /// Add a requirement unless already present or self-referential
    pub fn require(&mut self, requirement: ObjectName) {
        if requirement != self.name && !self.requirements.contains(&requirement) {
            self.requirements.push(requirement);
        }
    }
}

/// What `create_or_merge` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New object stored in state `Discovered`
    Created,
    /// Identical re-declaration; requirements and sources merged
    Merged,
}
