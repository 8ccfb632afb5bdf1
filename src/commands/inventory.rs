//! `converge inventory`: manage hosts and their tags

use anyhow::{Result, bail};
use inventory::{Entry, Inventory, Selection, TagMatch, split_list};
use std::path::Path;

use crate::Context;
use crate::cli::{InventoryCommand, InventoryDirArg};
use crate::paths;
use crate::ui;

fn open(arg: &InventoryDirArg) -> Result<Inventory> {
    let dir = match &arg.inventory_dir {
        Some(dir) => paths::expand_path(dir),
        None => paths::inventory_dir()?,
    };
    Ok(Inventory::open(dir)?)
}

/// One output line: `host` or `host tag1,tag2`
pub fn format_entry(entry: &Entry, host_only: bool) -> String {
    if host_only || entry.tags.is_empty() {
        return entry.host.clone();
    }
    let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
    format!("{} {}", entry.host, tags.join(","))
}

pub fn run(ctx: &Context, cmd: InventoryCommand) -> Result<()> {
    match cmd {
        InventoryCommand::List {
            names,
            tag,
            all_tags,
            host_only,
            inventory,
        } => {
            let selection = if names.is_empty() {
                Selection::All
            } else if tag {
                Selection::Tags {
                    tags: names.iter().flat_map(|n| split_list(n)).collect(),
                    mode: if all_tags { TagMatch::All } else { TagMatch::Any },
                }
            } else {
                Selection::Hosts(names)
            };
            for entry in open(&inventory)?.list(&selection)? {
                println!("{}", format_entry(&entry, host_only));
            }
        }
        InventoryCommand::AddHost {
            hosts,
            hostfile,
            inventory,
        } => {
            let hosts = names_or_bail(&hosts, hostfile.as_deref())?;
            open(&inventory)?.add_hosts(&hosts)?;
            if !ctx.quiet {
                ui::success(&format!("Added {} host(s)", hosts.len()));
            }
        }
        InventoryCommand::DelHost {
            hosts,
            hostfile,
            all,
            inventory,
        } => {
            let inv = open(&inventory)?;
            let hosts = if all {
                inv.hosts()?
            } else {
                names_or_bail(&hosts, hostfile.as_deref())?
            };
            inv.del_hosts(&hosts)?;
            if !ctx.quiet {
                ui::success(&format!("Deleted {} host(s)", hosts.len()));
            }
        }
        InventoryCommand::AddTag {
            hosts,
            taglist,
            inventory,
        } => {
            let tags = split_list(&taglist);
            if tags.is_empty() {
                bail!("No tags given");
            }
            open(&inventory)?.add_tags(&hosts, &tags)?;
        }
        InventoryCommand::DelTag {
            hosts,
            taglist,
            all,
            inventory,
        } => {
            let tags = taglist.as_deref().map(split_list).unwrap_or_default();
            open(&inventory)?.del_tags(&hosts, &tags, all)?;
        }
    }
    Ok(())
}

fn names_or_bail(names: &[String], file: Option<&Path>) -> Result<Vec<String>> {
    let names = super::collect_names(names, file)?;
    if names.is_empty() {
        bail!("No hosts given");
    }
    Ok(names)
}
