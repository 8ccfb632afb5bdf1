//! Code stage: generate and run the code that applies an object
//!
//! `gencode-local` and `gencode-remote` run on the controller; their stdout
//! is the object's `code-local` and `code-remote`. Local code runs first on
//! the controller. Remote code is copied into the object's remote directory
//! and run there, unless local code failed.

use crate::emulator::{ENV_GLOBAL, ENV_OBJECT_NAME};
use crate::error::Result;
use crate::explorer::{ENV_OBJECT, ENV_OBJECT_ID, exit_description};
use crate::host::HostRun;
use crate::manifest::ENV_TYPE;
use crate::object::ConfigObject;
use crate::process::{SHELL, run_script};
use crate::registry::TypeDef;
use crate::store::ObjectRepository;
use crate::transport::shell_quote;
use crate::types::{CommandOutput, PhaseOutcome, Stage};
use std::collections::BTreeMap;

impl HostRun<'_> {
    fn code_env(&self, object: &ConfigObject, type_def: &TypeDef) -> BTreeMap<String, String> {
        let mut env = self.base_env();
        env.insert(
            ENV_GLOBAL.to_string(),
            self.workspace.out_path.display().to_string(),
        );
        env.insert(
            ENV_OBJECT.to_string(),
            self.store.object_dir(&object.name).display().to_string(),
        );
        env.insert(ENV_OBJECT_ID.to_string(), object.name.object_id().to_string());
        env.insert(ENV_OBJECT_NAME.to_string(), object.name.to_string());
        env.insert(ENV_TYPE.to_string(), type_def.path.display().to_string());
        env
    }

    /// Record a stage's output and turn a non-zero exit into a failure
    fn settle_stage(
        &self,
        object: &ConfigObject,
        stage: Stage,
        output: &CommandOutput,
    ) -> Result<Option<PhaseOutcome>> {
        self.store
            .record_output(&object.name, stage, &output.stdout, &output.stderr)?;
        if output.success {
            return Ok(None);
        }
        Ok(Some(PhaseOutcome::failed(format!(
            "{} exited with {}",
            stage,
            exit_description(output)
        ))))
    }

    /// Run the code generators and store what they print
    ///
    /// Returns the failure of the first generator that fails.
    fn generate_code(
        &self,
        object: &ConfigObject,
        type_def: &TypeDef,
        env: &BTreeMap<String, String>,
    ) -> Result<std::result::Result<[Vec<u8>; 2], PhaseOutcome>> {
        let mut code = [Vec::new(), Vec::new()];
        for (slot, (generator, target)) in [
            (Stage::GencodeLocal, Stage::CodeLocal),
            (Stage::GencodeRemote, Stage::CodeRemote),
        ]
        .into_iter()
        .enumerate()
        {
            let Some(script) = type_def.gencode_path(generator) else {
                continue;
            };
            log::debug!("{}: {} {}", self.host, generator, object.name);
            let output = run_script(&script, env, self.options.exec_timeout)?;
            if let Some(failure) = self.settle_stage(object, generator, &output)? {
                return Ok(Err(failure));
            }
            self.store.write_code(&object.name, target, &output.stdout)?;
            code[slot] = output.stdout;
        }
        Ok(Ok(code))
    }

    /// Generate, then run local and remote code for one object
    pub(crate) fn generate_and_run_code(&self, object: &ConfigObject) -> Result<PhaseOutcome> {
        let type_def = self.registry.require(object.name.type_name())?;
        let env = self.code_env(object, type_def);

        let [local, remote] = match self.generate_code(object, type_def, &env)? {
            Ok(code) => code,
            Err(failure) => return Ok(failure),
        };

        let mut ran = false;
        if !is_blank(&local) {
            ran = true;
            let script = self.store.object_dir(&object.name).join(Stage::CodeLocal.as_str());
            log::info!("{}: running local code of {}", self.host, object.name);
            let output = run_script(&script, &env, self.options.exec_timeout)?;
            if let Some(failure) = self.settle_stage(object, Stage::CodeLocal, &output)? {
                return Ok(failure);
            }
        }

        if !is_blank(&remote) {
            ran = true;
            let remote_dir = self.remote_object_dir(&object.name);
            let remote_script = format!("{}/{}", remote_dir, Stage::CodeRemote.as_str());
            self.transport.mkdir(&remote_dir)?;
            self.transport.copy(
                &self.store.object_dir(&object.name).join(Stage::CodeRemote.as_str()),
                &remote_script,
            )?;

            log::info!("{}: running remote code of {}", self.host, object.name);
            let output = match self.transport.exec(
                &format!("{} -e {}", SHELL, shell_quote(&remote_script)),
                &self.base_env(),
            ) {
                Ok(output) => output,
                Err(e) => {
                    self.store.record_output(
                        &object.name,
                        Stage::CodeRemote,
                        b"",
                        format!("{}\n", e).as_bytes(),
                    )?;
                    return Err(e);
                }
            };
            if let Some(failure) = self.settle_stage(object, Stage::CodeRemote, &output)? {
                return Ok(failure);
            }
        }

        if ran {
            Ok(PhaseOutcome::Success)
        } else {
            Ok(PhaseOutcome::Skipped {
                reason: "no code generated".to_string(),
            })
        }
    }
}

fn is_blank(code: &[u8]) -> bool {
    code.iter().all(u8::is_ascii_whitespace)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::allocator::RemoteSessionAllocator;
    use crate::context::NoProgress;
    use crate::object::{ObjectDraft, ObjectName, Parameters};
    use crate::transport::LocalTransportFactory;
    use crate::types::{FailurePolicy, RunOptions};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn run_code_for(conf: &Path, tmp: &Path) -> (PhaseOutcome, std::path::PathBuf) {
        let mut options = RunOptions::new(FailurePolicy::Continue, "/bin/false");
        options.conf_dirs = vec![conf.to_path_buf()];
        let session = RemoteSessionAllocator::new(tmp.join("r").display().to_string()).allocate();
        let run = HostRun::open(
            "web1",
            &tmp.join("out"),
            &options,
            session,
            &LocalTransportFactory::default(),
            &NoProgress,
        )
        .unwrap();

        let name = ObjectName::parse("__t/x").unwrap();
        let mut params = Parameters::new();
        params.insert_value("greeting", "hi");
        run.store()
            .create_or_merge(ObjectDraft::new(name.clone(), params))
            .unwrap();
        let object = run.store().get(&name).unwrap().unwrap();
        let outcome = run.generate_and_run_code(&object).unwrap();
        (outcome, run.store().object_dir(&name))
    }

    #[test]
    fn test_generated_code_runs_in_order() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        write(&conf.join("type/__t/parameter/optional"), "greeting\n");
        write(
            &conf.join("type/__t/gencode-local"),
            "echo \"echo local \\$__object_id\"\n",
        );
        write(
            &conf.join("type/__t/gencode-remote"),
            "printf 'echo %s\\n' \"$(grep greeting \"$__object/parameters\" | cut -d= -f2)\"\n",
        );

        let (outcome, dir) = run_code_for(&conf, tmp.path());
        assert_eq!(outcome, PhaseOutcome::Success);
        assert_eq!(fs::read_to_string(dir.join("code-remote")).unwrap(), "echo hi\n");
        assert_eq!(fs::read_to_string(dir.join("stdout/code-local")).unwrap(), "local x\n");
        assert_eq!(fs::read_to_string(dir.join("stdout/code-remote")).unwrap(), "hi\n");
    }

    #[test]
    fn test_blank_code_is_not_run() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        write(&conf.join("type/__t/parameter/optional"), "greeting\n");
        write(&conf.join("type/__t/gencode-remote"), "echo\necho '  '\n");

        let (outcome, dir) = run_code_for(&conf, tmp.path());
        assert!(matches!(outcome, PhaseOutcome::Skipped { .. }));
        assert!(dir.join("code-remote").exists());
        assert!(!dir.join("stdout/code-remote").exists());
    }

    #[test]
    fn test_failing_generator_stops_object() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        write(&conf.join("type/__t/parameter/optional"), "greeting\n");
        write(&conf.join("type/__t/gencode-local"), "echo boom >&2\nexit 2\n");
        write(&conf.join("type/__t/gencode-remote"), "echo 'echo never'\n");

        let (outcome, dir) = run_code_for(&conf, tmp.path());
        match outcome {
            PhaseOutcome::Failed { detail } => assert_eq!(detail, "gencode-local exited with status 2"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(fs::read_to_string(dir.join("stderr/gencode-local")).unwrap(), "boom\n");
        assert!(!dir.join("code-remote").exists());
    }

    #[test]
    fn test_remote_exit_255_is_recorded_as_code_failure() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("conf");
        write(&conf.join("type/__t/parameter/optional"), "greeting\n");
        write(
            &conf.join("type/__t/gencode-remote"),
            "echo 'echo half done; echo dpkg locked >&2; exit 255'\n",
        );

        let (outcome, dir) = run_code_for(&conf, tmp.path());
        match outcome {
            PhaseOutcome::Failed { detail } => assert_eq!(detail, "code-remote exited with status 255"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(fs::read_to_string(dir.join("stdout/code-remote")).unwrap(), "half done\n");
        assert_eq!(fs::read_to_string(dir.join("stderr/code-remote")).unwrap(), "dpkg locked\n");
    }
}
