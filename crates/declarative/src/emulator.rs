//! Emulator: turns type invocations into stored objects
//!
//! Manifests are plain shell scripts. While one runs, `bin/` is first in
//! `PATH` and holds a link named after every type, all pointing at the
//! converge executable. The executable notices it was started under a type
//! name and hands the arguments to [`run_from_process`], which routes them
//! through the [`Emulator`] dispatch table:
//!
//! ```text
//! __file /etc/motd --mode 0644 --source -
//!   -> SchemaHandler("__file").validate()  -> ObjectDraft
//!   -> SchemaHandler("__file").register()  -> object store
//! ```

use crate::error::{Error, Result};
use crate::object::{MergeOutcome, ObjectDraft, ObjectName, Parameters};
use crate::registry::{ParamKind, TypeDef, TypeRegistry, is_valid_type_name};
use crate::store::{DirectoryStore, ObjectRepository};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};

pub const ENV_TARGET_HOST: &str = "__target_host";
pub const ENV_GLOBAL: &str = "__global";
pub const ENV_MANIFEST: &str = "__manifest";
pub const ENV_OBJECT_NAME: &str = "__object_name";
pub const ENV_REQUIRE: &str = "require";
pub const ENV_ORDER_FILE: &str = "__converge_order_file";
pub const ENV_ORDER_DEPENDENCY: &str = "CONVERGE_ORDER_DEPENDENCY";
pub const ENV_REJECT_FILE: &str = "__converge_reject_file";

/// Environment a manifest hands to the types it invokes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmulatorEnv {
    pub target_host: String,
    /// Local workspace `out/` directory
    pub global: PathBuf,
    /// Manifest being run, recorded as the object's source
    pub manifest: Option<String>,
    /// Object whose type manifest is running, if any
    pub parent: Option<ObjectName>,
    /// Objects named in `require`
    pub require: Vec<String>,
    /// File holding the previous object declared by this manifest
    pub order_file: Option<PathBuf>,
    pub order_dependency: bool,
    /// File collecting the declarations this manifest had rejected
    pub reject_file: Option<PathBuf>,
}

impl EmulatorEnv {
    /// Read the environment through a lookup function
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let global = non_empty(ENV_GLOBAL).ok_or_else(|| {
            Error::Configuration(format!(
                "{} is not set; types can only be invoked from a manifest",
                ENV_GLOBAL
            ))
        })?;
        let parent = non_empty(ENV_OBJECT_NAME)
            .map(|name| ObjectName::parse(&name))
            .transpose()?;

        Ok(Self {
            target_host: lookup(ENV_TARGET_HOST).unwrap_or_default(),
            global: PathBuf::from(global),
            manifest: non_empty(ENV_MANIFEST),
            parent,
            require: lookup(ENV_REQUIRE)
                .unwrap_or_default()
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            order_file: non_empty(ENV_ORDER_FILE).map(PathBuf::from),
            order_dependency: non_empty(ENV_ORDER_DEPENDENCY).is_some(),
            reject_file: non_empty(ENV_REJECT_FILE).map(PathBuf::from),
        })
    }

    /// Read the environment of this process
    pub fn from_process() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// One intercepted call of a type
#[derive(Debug, Clone)]
pub struct Invocation {
    pub type_name: String,
    pub args: Vec<String>,
    pub env: EmulatorEnv,
    pub stdin: Option<Vec<u8>>,
}

/// What a dispatched invocation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declared {
    pub name: ObjectName,
    pub outcome: MergeOutcome,
}

/// Handler for one type name in the dispatch table
pub trait TypeHandler: Send + Sync {
    /// Check the arguments and build the object they declare
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for unknown or missing parameters and for
    /// a bad object id.
    fn validate(&self, invocation: &Invocation) -> Result<ObjectDraft>;

    /// Store the object
    fn register(&self, draft: ObjectDraft, repo: &dyn ObjectRepository) -> Result<MergeOutcome> {
        repo.create_or_merge(draft)
    }
}

/// Handler driven by a type's parameter schema
#[derive(Debug, Clone)]
pub struct SchemaHandler {
    type_def: TypeDef,
}

impl SchemaHandler {
    pub fn new(type_def: TypeDef) -> Self {
        Self { type_def }
    }

    fn invalid(&self, object_id: Option<&str>, message: impl Into<String>) -> Error {
        let object = match object_id {
            Some(id) => format!("{}/{}", self.type_def.name, id.trim_start_matches('/')),
            None => self.type_def.name.clone(),
        };
        Error::validation(object, message)
    }

    fn parse_args(&self, args: &[String]) -> Result<(Parameters, Option<String>)> {
        let schema = &self.type_def.schema;
        let mut params = Parameters::new();
        let mut object_id: Option<String> = None;
        let mut args = args.iter();

        while let Some(arg) = args.next() {
            let Some(name) = arg.strip_prefix("--") else {
                if object_id.is_some() {
                    return Err(self.invalid(object_id.as_deref(), format!("unexpected argument '{}'", arg)));
                }
                object_id = Some(arg.clone());
                continue;
            };

            match schema.kind(name) {
                None => {
                    return Err(self.invalid(
                        object_id.as_deref(),
                        format!("unknown parameter --{}", name),
                    ));
                }
                Some(ParamKind::Boolean) => params.set_flag(name),
                Some(kind) => {
                    let value = args.next().ok_or_else(|| {
                        self.invalid(object_id.as_deref(), format!("--{} needs a value", name))
                    })?;
                    if value.contains('\n') {
                        return Err(self.invalid(
                            object_id.as_deref(),
                            format!("value of --{} contains a newline", name),
                        ));
                    }
                    if !kind.is_multiple() && params.contains(name) {
                        return Err(self.invalid(
                            object_id.as_deref(),
                            format!("--{} given more than once", name),
                        ));
                    }
                    params.insert_value(name, value.as_str());
                }
            }
        }
        Ok((params, object_id))
    }
}

impl TypeHandler for SchemaHandler {
    fn validate(&self, invocation: &Invocation) -> Result<ObjectDraft> {
        let (mut params, object_id) = self.parse_args(&invocation.args)?;

        let object_id = match (self.type_def.singleton, object_id) {
            (true, Some(id)) => {
                return Err(self.invalid(
                    None,
                    format!("singleton type takes no object id (got '{}')", id),
                ));
            }
            (true, None) => String::new(),
            (false, Some(id)) if !id.trim_start_matches('/').is_empty() => id,
            (false, _) => return Err(self.invalid(None, "missing object id")),
        };

        for (name, value) in self.type_def.schema.defaults() {
            if !params.contains(name) {
                params.insert_value(name.as_str(), value.as_str());
            }
        }
        for name in self.type_def.schema.required() {
            if !params.contains(name) {
                return Err(self.invalid(
                    Some(&object_id),
                    format!("missing required parameter --{}", name),
                ));
            }
        }

        let name = ObjectName::new(self.type_def.name.as_str(), &object_id)?;
        let mut draft = ObjectDraft::new(name, params);
        draft.source = invocation.env.manifest.clone();
        draft.stdin = invocation.stdin.clone();
        Ok(draft)
    }
}

/// Dispatch table from type name to handler
#[derive(Default)]
pub struct Emulator {
    handlers: HashMap<String, Box<dyn TypeHandler>>,
}

impl Emulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`SchemaHandler`] per registered type
    pub fn from_registry(registry: &TypeRegistry) -> Self {
        let mut emulator = Self::new();
        for type_def in registry.iter() {
            emulator.register_handler(&type_def.name, Box::new(SchemaHandler::new(type_def.clone())));
        }
        emulator
    }

    pub fn register_handler(&mut self, type_name: &str, handler: Box<dyn TypeHandler>) {
        self.handlers.insert(type_name.to_string(), handler);
    }

    pub fn knows(&self, type_name: &str) -> bool {
        self.handlers.contains_key(type_name)
    }

    /// Validate and store one invocation, then record its requirements
    pub fn dispatch(&self, invocation: &Invocation, repo: &dyn ObjectRepository) -> Result<Declared> {
        let handler = self.handlers.get(&invocation.type_name).ok_or_else(|| {
            Error::Configuration(format!("unknown type: {}", invocation.type_name))
        })?;

        let mut draft = handler.validate(invocation)?;
        let env = &invocation.env;

        for entry in &env.require {
            let requirement = ObjectName::parse(entry.trim_end_matches('/'))?;
            if !self.knows(requirement.type_name()) {
                return Err(Error::validation(
                    draft.name.to_string(),
                    format!("requirement {} names an unknown type", requirement),
                ));
            }
            draft.require(requirement);
        }

        if env.order_dependency
            && let Some(order_file) = &env.order_file
            && let Some(previous) = read_previous(order_file)?
        {
            draft.require(previous);
        }

        let name = draft.name.clone();
        let outcome = handler.register(draft, repo)?;

        if let Some(parent) = &env.parent {
            repo.add_requirement(parent, &name)?;
        }
        if env.order_dependency
            && let Some(order_file) = &env.order_file
        {
            fs::write(order_file, format!("{}\n", name)).map_err(|e| Error::io(order_file, e))?;
        }

        log::debug!("{} {}", if outcome == MergeOutcome::Created { "Created" } else { "Merged" }, name);
        Ok(Declared { name, outcome })
    }
}

fn read_previous(order_file: &Path) -> Result<Option<ObjectName>> {
    match fs::read_to_string(order_file) {
        Ok(content) if content.trim().is_empty() => Ok(None),
        Ok(content) => ObjectName::parse(content.trim()).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(order_file, e)),
    }
}

/// A declaration the emulator refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Object (or type) being declared
    pub object: String,
    pub message: String,
}

impl Rejection {
    /// Rejection for a validation or conflict error, `None` for anything else
    pub fn from_error(error: &Error) -> Option<Self> {
        match error {
            Error::Validation { object, .. } | Error::Conflict { object, .. } => Some(Self {
                object: object.clone(),
                message: error.to_string(),
            }),
            _ => None,
        }
    }

    fn to_line(&self) -> String {
        format!("{}\t{}\n", self.object, self.message.replace('\n', " "))
    }

    fn from_line(line: &str) -> Option<Self> {
        let (object, message) = line.split_once('\t')?;
        Some(Self {
            object: object.to_string(),
            message: message.to_string(),
        })
    }
}

/// Append a rejection to a manifest's reject file
pub fn record_rejection(path: &Path, rejection: &Rejection) -> Result<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(rejection.to_line().as_bytes()))
        .map_err(|e| Error::io(path, e))
}

/// Rejections recorded in a reject file, oldest first
pub fn read_rejections(path: &Path) -> Result<Vec<Rejection>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().filter_map(Rejection::from_line).collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Type name the executable was started as, if any
pub fn type_name_from_argv0(argv0: &str) -> Option<&str> {
    Path::new(argv0)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| is_valid_type_name(n))
}

/// Handle an invocation of this process under a type name
///
/// Reads the workspace from `__global`, loads its types and stores the
/// object in the workspace's object directory. Piped stdin is kept as the
/// object's `stdin` file. A rejected declaration is also appended to the
/// manifest's reject file, when it names one.
pub fn run_from_process(type_name: &str, args: Vec<String>) -> Result<Declared> {
    let env = EmulatorEnv::from_process()?;
    let registry = TypeRegistry::load(&env.global.join("conf").join("type"))?;
    let store = DirectoryStore::open(env.global.join("object"))?;

    let stdin = if io::stdin().is_terminal() {
        None
    } else {
        let mut buf = Vec::new();
        io::stdin()
            .read_to_end(&mut buf)
            .map_err(|e| Error::io("<stdin>", e))?;
        (!buf.is_empty()).then_some(buf)
    };

    let invocation = Invocation {
        type_name: type_name.to_string(),
        args,
        env,
        stdin,
    };
    let result = Emulator::from_registry(&registry).dispatch(&invocation, &store);
    if let Err(e) = &result
        && let Some(path) = &invocation.env.reject_file
        && let Some(rejection) = Rejection::from_error(e)
        && let Err(write_err) = record_rejection(path, &rejection)
    {
        log::warn!("Could not record rejected declaration: {}", write_err);
    }
    result
}
