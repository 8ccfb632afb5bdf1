//! Manifests: shell scripts that declare objects
//!
//! Manifests run on the controller with `out/bin` first in `PATH`, so every
//! type name they invoke reaches the emulator. The initial manifest runs
//! once per host run; a type manifest runs once per object of that type.

use crate::emulator::{
    ENV_GLOBAL, ENV_MANIFEST, ENV_OBJECT_NAME, ENV_ORDER_DEPENDENCY, ENV_ORDER_FILE,
    ENV_REJECT_FILE, ENV_REQUIRE, Rejection, read_rejections,
};
use crate::error::{Error, Result};
use crate::explorer::{ENV_OBJECT, ENV_OBJECT_ID, exit_description};
use crate::host::HostRun;
use crate::object::ConfigObject;
use crate::process::{SHELL, run_command};
use crate::store::ObjectRepository;
use crate::types::{CommandOutput, PhaseOutcome, Stage};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::Ordering;

/// Log filter handed to emulator child processes
pub const ENV_LOG: &str = "CONVERGE_LOG";
pub const ENV_TYPE: &str = "__type";

impl HostRun<'_> {
    /// Environment for any manifest
    fn manifest_env(&self, manifest: &Path) -> Result<BTreeMap<String, String>> {
        let bin = self.workspace.bin_path.display().to_string();
        let path = match std::env::var("PATH") {
            Ok(inherited) if !inherited.is_empty() => format!("{}:{}", bin, inherited),
            _ => bin,
        };

        let order_dir = self.workspace.out_path.join("order");
        fs::create_dir_all(&order_dir).map_err(|e| Error::io(&order_dir, e))?;
        let run = self.manifest_runs.fetch_add(1, Ordering::Relaxed);

        let mut env = self.base_env();
        env.insert("PATH".to_string(), path);
        env.insert(
            ENV_GLOBAL.to_string(),
            self.workspace.out_path.display().to_string(),
        );
        env.insert(ENV_MANIFEST.to_string(), manifest.display().to_string());
        env.insert(
            ENV_ORDER_FILE.to_string(),
            order_dir.join(run.to_string()).display().to_string(),
        );
        env.insert(ENV_LOG.to_string(), log::max_level().to_string());
        if self.options.order_dependency {
            env.insert(ENV_ORDER_DEPENDENCY.to_string(), "1".to_string());
        }
        Ok(env)
    }

    fn run_manifest_script(
        &self,
        manifest: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<CommandOutput> {
        log::debug!("{}: running manifest {}", self.host, manifest.display());
        let mut cmd = Command::new(SHELL);
        cmd.arg("-e").arg(manifest).envs(env).env_remove(ENV_REQUIRE);
        for key in [ENV_OBJECT_NAME, ENV_ORDER_DEPENDENCY, ENV_REJECT_FILE] {
            if !env.contains_key(key) {
                cmd.env_remove(key);
            }
        }
        run_command(cmd, None, self.options.exec_timeout)
    }

    /// Run the initial manifest
    ///
    /// A manifest stopped by a rejected declaration keeps what it declared
    /// up to that point; the rejections are returned for the report.
    ///
    /// # Errors
    ///
    /// `Error::Manifest` if it exits non-zero for any other reason,
    /// `Error::Configuration` if it does not exist.
    pub(crate) fn run_initial_manifest(&self) -> Result<Vec<Rejection>> {
        let manifest = self
            .options
            .initial_manifest
            .clone()
            .unwrap_or_else(|| self.workspace.initial_manifest());
        if !manifest.is_file() {
            return Err(Error::Configuration(format!(
                "initial manifest not found: {}",
                manifest.display()
            )));
        }

        let reject_file = self.workspace.out_path.join("rejected");
        let mut env = self.manifest_env(&manifest)?;
        env.insert(ENV_REJECT_FILE.to_string(), reject_file.display().to_string());
        let output = self.run_manifest_script(&manifest, &env)?;
        if !output.success {
            let rejected = read_rejections(&reject_file)?;
            if rejected.is_empty() {
                return Err(Error::Manifest {
                    path: manifest,
                    stderr: output.stderr_str(),
                });
            }
            for rejection in &rejected {
                log::warn!("{}: {}", self.host, rejection.message);
            }
            log::warn!(
                "{}: {} stopped at a rejected declaration; later declarations were not made",
                self.host,
                manifest.display()
            );
            return Ok(rejected);
        }
        if !output.stderr.is_empty() {
            log::warn!(
                "{}: {}: {}",
                self.host,
                manifest.display(),
                output.stderr_str().trim_end()
            );
        }
        Ok(Vec::new())
    }

    /// Run the type manifest of one object, if its type has one
    pub(crate) fn run_type_manifest(&self, object: &ConfigObject) -> Result<PhaseOutcome> {
        let type_def = self.registry.require(object.name.type_name())?;
        let Some(manifest) = type_def.manifest_path() else {
            return Ok(PhaseOutcome::Success);
        };

        let mut env = self.manifest_env(&manifest)?;
        env.insert(ENV_OBJECT_NAME.to_string(), object.name.to_string());
        env.insert(
            ENV_OBJECT.to_string(),
            self.store.object_dir(&object.name).display().to_string(),
        );
        env.insert(ENV_OBJECT_ID.to_string(), object.name.object_id().to_string());
        env.insert(ENV_TYPE.to_string(), type_def.path.display().to_string());

        let output = self.run_manifest_script(&manifest, &env)?;
        self.store
            .record_output(&object.name, Stage::Manifest, &output.stdout, &output.stderr)?;
        if output.success {
            Ok(PhaseOutcome::Success)
        } else {
            Ok(PhaseOutcome::failed(format!(
                "manifest {} exited with {}",
                manifest.display(),
                exit_description(&output)
            )))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::allocator::RemoteSessionAllocator;
    use crate::context::NoProgress;
    use crate::object::{ObjectDraft, ObjectName, Parameters};
    use crate::transport::LocalTransportFactory;
    use crate::types::{FailurePolicy, RunOptions};
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn open<'a>(tmp: &Path, options: &'a RunOptions) -> HostRun<'a> {
        let session = RemoteSessionAllocator::new(tmp.join("r").display().to_string()).allocate();
        HostRun::open(
            "web1",
            &tmp.join("out"),
            options,
            session,
            &LocalTransportFactory::default(),
            &NoProgress,
        )
        .unwrap()
    }

    #[test]
    fn test_initial_manifest_sees_workspace_env() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        write(
            &conf.join("manifest/init"),
            "echo \"$__target_host $__manifest\" > \"$__global/seen\"\n",
        );
        write(&conf.join("type/__t/gencode-remote"), "");
        let mut options = RunOptions::new(FailurePolicy::Continue, "/bin/false");
        options.conf_dirs = vec![conf];
        let run = open(tmp.path(), &options);

        run.run_initial_manifest().unwrap();
        let seen = fs::read_to_string(run.workspace().out_path.join("seen")).unwrap();
        assert_eq!(
            seen,
            format!("web1 {}\n", run.workspace().initial_manifest().display())
        );
        let path = run.manifest_env(Path::new("/m")).unwrap()["PATH"].clone();
        assert!(path.starts_with(&run.workspace().bin_path.display().to_string()));
    }

    #[test]
    fn test_rejected_declaration_stops_manifest_without_failing_run() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        write(
            &conf.join("manifest/init"),
            "printf '__t/x\\tinvalid invocation of __t/x: unknown parameter --bogus\\n' >> \"$__converge_reject_file\"\nexit 1\necho never > \"$__global/after\"\n",
        );
        let mut options = RunOptions::new(FailurePolicy::Continue, "/bin/false");
        options.conf_dirs = vec![conf];
        let run = open(tmp.path(), &options);

        let rejected = run.run_initial_manifest().unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].object, "__t/x");
        assert!(rejected[0].message.ends_with("unknown parameter --bogus"));
        assert!(!run.workspace().out_path.join("after").exists());
    }

    #[test]
    fn test_missing_initial_manifest_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let mut options = RunOptions::new(FailurePolicy::Continue, "/bin/false");
        options.conf_dirs = vec![tmp.path().join("empty")];
        let run = open(tmp.path(), &options);
        assert!(matches!(
            run.run_initial_manifest(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_type_manifest_failure_is_captured() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        write(
            &conf.join("type/__t/manifest"),
            "echo \"$__object_name $__object_id\" >&2\nexit 4\n",
        );
        let mut options = RunOptions::new(FailurePolicy::Continue, "/bin/false");
        options.conf_dirs = vec![conf];
        let run = open(tmp.path(), &options);

        let name = ObjectName::parse("__t/x").unwrap();
        run.store()
            .create_or_merge(ObjectDraft::new(name.clone(), Parameters::new()))
            .unwrap();
        let object = run.store().get(&name).unwrap().unwrap();

        match run.run_type_manifest(&object).unwrap() {
            PhaseOutcome::Failed { detail } => assert!(detail.ends_with("status 4")),
            other => panic!("expected failure, got {other:?}"),
        }
        let captured = run
            .store()
            .captured_output(&name, Stage::Manifest)
            .unwrap()
            .unwrap();
        assert_eq!(captured.stderr, b"__t/x x\n");
    }
}
