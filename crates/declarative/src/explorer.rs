//! Explorers: scripts run on the target host that report its state
//!
//! Global explorers run once per host run, before the initial manifest.
//! Their output lands in `out/explorer/<name>`. Type explorers run once per
//! object; their output lands in the object's `explorer/<name>`.

use crate::emulator::ENV_OBJECT_NAME;
use crate::error::{Error, Result};
use crate::host::HostRun;
use crate::object::ConfigObject;
use crate::process::SHELL;
use crate::registry::list_entries;
use crate::store::ObjectRepository;
use crate::transport::shell_quote;
use crate::types::{CommandOutput, PhaseOutcome, Stage};
use std::collections::BTreeMap;
use std::fs;

pub const ENV_EXPLORER: &str = "__explorer";
pub const ENV_TYPE_EXPLORER: &str = "__type_explorer";
pub const ENV_OBJECT: &str = "__object";
pub const ENV_OBJECT_ID: &str = "__object_id";

impl HostRun<'_> {
    fn remote_global_explorer_dir(&self) -> String {
        self.remote_path("conf/explorer")
    }

    fn remote_type_explorer_dir(&self, type_name: &str) -> String {
        self.remote_path(&format!("conf/type/{}/explorer", type_name))
    }

    fn run_explorer(&self, dir: &str, name: &str, env: &BTreeMap<String, String>) -> Result<CommandOutput> {
        let script = format!("{}/{}", dir, name);
        log::debug!("{}: running explorer {}", self.host, script);
        self.transport
            .exec(&format!("{} -e {}", SHELL, shell_quote(&script)), env)
    }

    /// Copy the global explorers to the target and run each of them
    ///
    /// Directory copies create their target, so only parents are made here.
    ///
    /// # Errors
    ///
    /// A failing explorer aborts the host run with `Error::Explorer`.
    pub(crate) fn run_global_explorers(&self) -> Result<()> {
        let explorers = list_entries(&self.workspace.global_explorer_path)?;
        if explorers.is_empty() {
            return Ok(());
        }

        let remote_dir = self.remote_global_explorer_dir();
        self.transport
            .copy(&self.workspace.global_explorer_path, &remote_dir)?;

        let mut env = self.base_env();
        env.insert(ENV_EXPLORER.to_string(), remote_dir.clone());

        for name in explorers {
            let output = self.run_explorer(&remote_dir, &name, &env)?;
            if !output.success {
                return Err(Error::Explorer {
                    name,
                    stderr: output.stderr_str(),
                });
            }
            let path = self.workspace.global_explorer_out_path.join(&name);
            fs::write(&path, &output.stdout).map_err(|e| Error::io(&path, e))?;
        }
        Ok(())
    }

    /// Put a type's explorers on the target, once per host run
    fn transfer_type_explorers(&self, type_name: &str) -> Result<String> {
        let remote_dir = self.remote_type_explorer_dir(type_name);
        let mut transferred = crate::store::lock(&self.transferred_types);
        if transferred.contains(type_name) {
            return Ok(remote_dir);
        }

        let type_def = self.registry.require(type_name)?;
        log::debug!("{}: transferring explorers of {}", self.host, type_name);
        self.transport
            .mkdir(&self.remote_path(&format!("conf/type/{}", type_name)))?;
        self.transport.copy(&type_def.explorer_dir(), &remote_dir)?;
        transferred.insert(type_name.to_string());
        Ok(remote_dir)
    }

    /// Run the type explorers of one object
    pub(crate) fn explore_object(&self, object: &ConfigObject) -> Result<PhaseOutcome> {
        let type_def = self.registry.require(object.name.type_name())?;
        if type_def.explorers.is_empty() {
            return Ok(PhaseOutcome::Success);
        }

        let type_explorer_dir = self.transfer_type_explorers(object.name.type_name())?;
        let remote_object_dir = self.remote_object_dir(&object.name);
        self.transport.mkdir(&remote_object_dir)?;
        self.transport.copy(
            &self.store.parameters_path(&object.name),
            &format!("{}/parameters", remote_object_dir),
        )?;

        let mut env = self.base_env();
        env.insert(ENV_EXPLORER.to_string(), self.remote_global_explorer_dir());
        env.insert(ENV_TYPE_EXPLORER.to_string(), type_explorer_dir.clone());
        env.insert(ENV_OBJECT.to_string(), remote_object_dir);
        env.insert(ENV_OBJECT_ID.to_string(), object.name.object_id().to_string());
        env.insert(ENV_OBJECT_NAME.to_string(), object.name.to_string());

        for explorer in &type_def.explorers {
            let output = self.run_explorer(&type_explorer_dir, explorer, &env)?;
            if !output.success {
                self.store
                    .record_output(&object.name, Stage::Explorer, &output.stdout, &output.stderr)?;
                return Ok(PhaseOutcome::failed(format!(
                    "explorer {} exited with {}",
                    explorer,
                    exit_description(&output)
                )));
            }
            self.store
                .record_explorer(&object.name, explorer, &output.stdout)?;
        }
        Ok(PhaseOutcome::Success)
    }
}

/// "status N", "a signal" or "a timeout"
pub(crate) fn exit_description(output: &CommandOutput) -> String {
    if output.timed_out {
        return "a timeout".to_string();
    }
    match output.code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}
