//! `converge config`: converge hosts to their configuration

use anyhow::{Context as _, Result, bail};
use declarative::{
    DEFAULT_REMOTE_BASE, FailurePolicy, HostReport, LocalTransportFactory,
    RemoteSessionAllocator, RunOptions, SshTransportFactory, TransportFactory, run_hosts, shared,
};
use inventory::{Inventory, Selection, TagMatch};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

use crate::Context;
use crate::cli::ConfigArgs;
use crate::config::ConvergeConfig;
use crate::paths;
use crate::progress::HostProgress;
use crate::ui;

/// Settings of one `config` invocation, flags merged over the config file
#[derive(Debug)]
pub struct Settings {
    pub options: RunOptions,
    pub parallel: usize,
    pub remote_out_dir: String,
    pub remote_user: String,
}

/// Environment switches that take part in the merge
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSwitches {
    pub beta: bool,
    pub order_dependency: bool,
}

impl EnvSwitches {
    pub fn from_env() -> Self {
        Self {
            beta: paths::beta_from_env(),
            order_dependency: std::env::var(declarative::emulator::ENV_ORDER_DEPENDENCY)
                .is_ok_and(|v| paths::is_truthy(&v)),
        }
    }
}

impl Settings {
    /// Merge flags, environment and config file; flags win
    pub fn resolve(
        args: &ConfigArgs,
        config: &ConvergeConfig,
        env: EnvSwitches,
        exec_path: PathBuf,
        conf_dirs: Vec<PathBuf>,
        default_cache_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let policy = if args.abort_on_error {
            FailurePolicy::AbortOnFirstError
        } else {
            config.failure_policy()?.unwrap_or(FailurePolicy::Continue)
        };

        let mut options = RunOptions::new(policy, exec_path);
        options.conf_dirs = conf_dirs;
        options.initial_manifest = args.manifest.as_deref().map(paths::expand_path);
        options.jobs = args.jobs.or(config.jobs).unwrap_or(1).max(1);
        options.beta = args.beta || env.beta || config.beta.unwrap_or(false);
        options.order_dependency =
            args.order_dependency || env.order_dependency || config.order_dependency.unwrap_or(false);
        options.exec_timeout = args
            .timeout
            .or(config.exec_timeout_secs)
            .map(Duration::from_secs);
        options.cache_dir = if args.no_cache {
            None
        } else {
            args.cache_dir
                .as_deref()
                .map(paths::expand_path)
                .or(default_cache_dir)
        };
        if let Some(pattern) = args
            .cache_path_pattern
            .clone()
            .or_else(|| config.cache_path_pattern.clone())
        {
            options.cache_path_pattern = pattern;
        }
        options.check_beta()?;

        Ok(Self {
            options,
            parallel: args.parallel.or(config.parallel).unwrap_or(1).max(1),
            remote_out_dir: args
                .remote_out_dir
                .clone()
                .or_else(|| config.remote_out_dir.clone())
                .unwrap_or_else(|| DEFAULT_REMOTE_BASE.to_string()),
            remote_user: args
                .remote_user
                .clone()
                .or_else(|| config.remote_user.clone())
                .unwrap_or_else(|| "root".to_string()),
        })
    }
}

/// Hosts named on the command line, in the host file and selected by tag
fn resolve_hosts(args: &ConfigArgs) -> Result<Vec<String>> {
    let mut hosts = super::collect_names(&args.hosts, args.hostfile.as_deref())?;

    if let Some(tags) = &args.tag {
        let dir = match &args.inventory.inventory_dir {
            Some(dir) => paths::expand_path(dir),
            None => paths::inventory_dir()?,
        };
        let inv = Inventory::open(&dir)?;
        let mode = if args.all_tags {
            TagMatch::All
        } else {
            TagMatch::Any
        };
        let selection = Selection::Tags {
            tags: inventory::split_list(tags),
            mode,
        };
        for host in inv.select(&selection)? {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
    }

    Ok(hosts)
}

/// Copy a manifest piped on stdin to a file the engine can run
fn manifest_from_stdin() -> Result<NamedTempFile> {
    let mut content = Vec::new();
    io::stdin()
        .read_to_end(&mut content)
        .context("Could not read the manifest from stdin")?;
    let mut file = tempfile::Builder::new()
        .prefix("converge.manifest.")
        .tempfile()?;
    file.write_all(&content)?;
    file.flush()?;
    Ok(file)
}

pub fn run(ctx: &Context, args: ConfigArgs) -> Result<()> {
    let config = ConvergeConfig::load()?;

    let stdin_manifest = args.manifest.as_deref() == Some(std::path::Path::new("-"));
    if stdin_manifest && args.hostfile.as_deref() == Some(std::path::Path::new("-")) {
        bail!("The manifest and the host file cannot both be read from stdin");
    }

    let hosts = resolve_hosts(&args)?;
    if hosts.is_empty() {
        bail!("No hosts given. Name them, use --hostfile or select them with --tag");
    }

    let mut extra_dirs = config.conf_dirs();
    extra_dirs.extend(args.conf.conf_dirs.iter().map(|d| paths::expand_path(d)));
    let conf_dirs = paths::conf_search_path(&extra_dirs)?;
    if conf_dirs.is_empty() {
        bail!("No configuration directories. Use --conf-dir or create ~/.converge");
    }

    let exec_path = std::env::current_exe().context("Could not locate the converge executable")?;
    let default_cache_dir = if args.cache_dir.is_some() || args.no_cache {
        None
    } else {
        Some(paths::cache_dir()?)
    };
    let mut settings = Settings::resolve(
        &args,
        &config,
        EnvSwitches::from_env(),
        exec_path,
        conf_dirs,
        default_cache_dir,
    )?;

    // Kept alive until every host has run
    let manifest_file = if stdin_manifest {
        let file = manifest_from_stdin()?;
        settings.options.initial_manifest = Some(file.path().to_path_buf());
        Some(file)
    } else {
        None
    };

    let control_dir = tempfile::Builder::new().prefix("converge.ssh.").tempdir()?;
    let factory: Box<dyn TransportFactory> = if args.local {
        Box::new(LocalTransportFactory {
            timeout: settings.options.exec_timeout,
        })
    } else {
        let mut ssh = SshTransportFactory::new(control_dir.path());
        ssh.user = settings.remote_user.clone();
        ssh.timeout = settings.options.exec_timeout;
        Box::new(ssh)
    };

    log::info!(
        "Converging {} host(s), {} at a time",
        hosts.len(),
        settings.parallel
    );
    let allocator = shared(RemoteSessionAllocator::new(settings.remote_out_dir.clone()));
    let progress = HostProgress::new(!ctx.quiet && !args.json);
    let reports = run_hosts(
        &hosts,
        &settings.options,
        settings.parallel,
        &allocator,
        factory.as_ref(),
        &progress,
    );
    drop(manifest_file);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else if !ctx.quiet || reports.iter().any(|r| !r.success) {
        render(&reports);
    }

    let failed = reports.iter().filter(|r| !r.success).count();
    if failed > 0 {
        bail!("{} of {} host(s) failed", failed, reports.len());
    }
    Ok(())
}

fn render(reports: &[HostReport]) {
    ui::header("Converge");
    for report in reports {
        ui::render_report(report);
    }
}
