use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "converge")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Agentless configuration management", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Converge hosts to their configuration
    Config(ConfigArgs),

    /// List the types found in the configuration directories
    Types(TypesArgs),

    /// Manage the host inventory
    #[command(subcommand)]
    Inventory(InventoryCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Config
// ============================================================================

#[derive(Args)]
pub struct ConfigArgs {
    /// Hosts to converge
    pub hosts: Vec<String>,

    /// Read hosts from a file, one per line ('-' for stdin)
    #[arg(short = 'f', long)]
    pub hostfile: Option<PathBuf>,

    /// Converge inventory hosts carrying these tags (comma separated)
    #[arg(short, long)]
    pub tag: Option<String>,

    /// With --tag, select hosts carrying every tag instead of any
    #[arg(short = 'a', long, requires = "tag")]
    pub all_tags: bool,

    #[command(flatten)]
    pub inventory: InventoryDirArg,

    #[command(flatten)]
    pub conf: ConfDirArgs,

    /// Initial manifest ('-' reads it from stdin)
    #[arg(short = 'i', long)]
    pub manifest: Option<PathBuf>,

    /// Run code of independent objects in parallel (beta)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Number of hosts converged at once
    #[arg(short, long)]
    pub parallel: Option<usize>,

    /// Enable beta features
    #[arg(short, long)]
    pub beta: bool,

    /// Stop a host run at its first failed object
    #[arg(long)]
    pub abort_on_error: bool,

    /// Make every object require the one declared before it
    #[arg(long)]
    pub order_dependency: bool,

    /// Converge through the local shell instead of ssh
    #[arg(long)]
    pub local: bool,

    /// User for ssh connections
    #[arg(long)]
    pub remote_user: Option<String>,

    /// Base of the remote session directories
    #[arg(long)]
    pub remote_out_dir: Option<String>,

    /// Directory finished workspaces are cached in
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Cache directory name pattern (%h host, %N session index, %P pid)
    #[arg(long)]
    pub cache_path_pattern: Option<String>,

    /// Do not keep finished workspaces
    #[arg(long, conflicts_with = "cache_dir")]
    pub no_cache: bool,

    /// Timeout in seconds for a single command
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Print reports as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct ConfDirArgs {
    /// Add a configuration directory (later ones win)
    #[arg(short = 'c', long = "conf-dir")]
    pub conf_dirs: Vec<PathBuf>,
}

#[derive(Args)]
pub struct InventoryDirArg {
    /// Inventory directory
    #[arg(long, env = "CONVERGE_INVENTORY_DIR")]
    pub inventory_dir: Option<PathBuf>,
}

// ============================================================================
// Types
// ============================================================================

#[derive(Args)]
pub struct TypesArgs {
    #[command(flatten)]
    pub conf: ConfDirArgs,

    /// Show parameters and explorers of each type
    #[arg(short, long)]
    pub long: bool,
}

// ============================================================================
// Inventory Commands
// ============================================================================

#[derive(Subcommand)]
pub enum InventoryCommand {
    /// List hosts and their tags
    List {
        /// Hosts (or tags with --tag) to list; all hosts when empty
        names: Vec<String>,

        /// Treat the names as tags
        #[arg(short, long)]
        tag: bool,

        /// With --tag, list hosts carrying every tag instead of any
        #[arg(short = 'a', long, requires = "tag")]
        all_tags: bool,

        /// Print host names only
        #[arg(short = 'H', long)]
        host_only: bool,

        #[command(flatten)]
        inventory: InventoryDirArg,
    },

    /// Add hosts
    AddHost {
        hosts: Vec<String>,

        /// Read hosts from a file ('-' for stdin)
        #[arg(short = 'f', long)]
        hostfile: Option<PathBuf>,

        #[command(flatten)]
        inventory: InventoryDirArg,
    },

    /// Delete hosts
    DelHost {
        hosts: Vec<String>,

        /// Read hosts from a file ('-' for stdin)
        #[arg(short = 'f', long)]
        hostfile: Option<PathBuf>,

        /// Delete every host
        #[arg(long, conflicts_with_all = ["hosts", "hostfile"])]
        all: bool,

        #[command(flatten)]
        inventory: InventoryDirArg,
    },

    /// Add tags to hosts (every host when none is given)
    AddTag {
        hosts: Vec<String>,

        /// Tags to add (comma separated)
        #[arg(short = 'T', long, required = true)]
        taglist: String,

        #[command(flatten)]
        inventory: InventoryDirArg,
    },

    /// Delete tags from hosts (every host when none is given)
    DelTag {
        hosts: Vec<String>,

        /// Tags to delete (comma separated)
        #[arg(short = 'T', long, required_unless_present = "all")]
        taglist: Option<String>,

        /// Delete every tag
        #[arg(long)]
        all: bool,

        #[command(flatten)]
        inventory: InventoryDirArg,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_config_flags() {
        let cli = Cli::parse_from([
            "converge", "-vv", "config", "web1", "web2", "-c", "/a", "-c", "/b", "-j", "4",
            "--beta", "--abort-on-error", "--local",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Config(args) => {
                assert_eq!(args.hosts, vec!["web1", "web2"]);
                assert_eq!(
                    args.conf.conf_dirs,
                    vec![PathBuf::from("/a"), PathBuf::from("/b")]
                );
                assert_eq!(args.jobs, Some(4));
                assert!(args.beta && args.abort_on_error && args.local);
            }
            _ => panic!("expected config command"),
        }
    }

    #[test]
    fn test_all_tags_requires_tag() {
        assert!(Cli::try_parse_from(["converge", "config", "-a", "web1"]).is_err());
    }
}
