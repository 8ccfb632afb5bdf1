//! `converge types`: list the types of the configuration directories

use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use declarative::{TypeDef, TypeRegistry, Workspace};

use crate::Context;
use crate::cli::TypesArgs;
use crate::config::ConvergeConfig;
use crate::paths;
use crate::progress;
use crate::ui;

/// Load the merged type registry of the configuration directories
fn load_registry(args: &TypesArgs) -> Result<(TypeRegistry, tempfile::TempDir)> {
    let config = ConvergeConfig::load()?;
    let mut extra_dirs = config.conf_dirs();
    extra_dirs.extend(args.conf.conf_dirs.iter().map(|d| paths::expand_path(d)));
    let conf_dirs = paths::conf_search_path(&extra_dirs)?;
    if conf_dirs.is_empty() {
        bail!("No configuration directories. Use --conf-dir or create ~/.converge");
    }

    let exec_path = std::env::current_exe().context("Could not locate the converge executable")?;
    let tmp = tempfile::Builder::new().prefix("converge.").tempdir()?;
    let workspace = Workspace::new(tmp.path().join("out"), conf_dirs, exec_path);
    let registry = workspace.create_files_dirs()?;
    Ok((registry, tmp))
}

/// Details shown by `--long`
pub fn describe(type_def: &TypeDef) -> Vec<String> {
    let mut lines = Vec::new();
    if type_def.singleton {
        lines.push("singleton".to_string());
    }
    for (name, kind) in type_def.schema.params() {
        match type_def.schema.defaults().get(name) {
            Some(default) => lines.push(format!("--{} ({}, default {})", name, kind.as_str(), default)),
            None => lines.push(format!("--{} ({})", name, kind.as_str())),
        }
    }
    if !type_def.explorers.is_empty() {
        lines.push(format!("explorers: {}", type_def.explorers.join(" ")));
    }
    lines
}

pub fn run(ctx: &Context, args: TypesArgs) -> Result<()> {
    let pb = (!ctx.quiet).then(|| progress::spinner("Loading types..."));
    let loaded = load_registry(&args);
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    let (registry, _tmp) = loaded?;

    if registry.is_empty() {
        ui::warn("No types found");
        return Ok(());
    }

    for type_def in registry.iter() {
        if !args.long {
            println!("{}", type_def.name);
            continue;
        }
        println!("{}", type_def.name.bold());
        for line in describe(type_def) {
            ui::dim(&line);
        }
    }
    Ok(())
}
