mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "rotabak",
    about = "Project backups to a remote store with bounded retention",
    version,
    propagate_version = true,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    /// Project root (default: auto-detect from .rotabak/ or .git/)
    #[arg(long, global = true, env = "ROTABAK_ROOT")]
    root: Option<PathBuf>,

    /// Config file (default: <root>/.rotabak/config.yaml)
    #[arg(long, global = true, env = "ROTABAK_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(flatten)]
    backup: cmd::backup::BackupArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an archive and unpack it into a destination directory
    Restore {
        /// Archive file name as shown by `rotabak list`
        name: String,
        /// Directory to restore into (created if missing)
        dest: PathBuf,
    },

    /// List archives on the remote, newest first
    List {
        /// Only database archives
        #[arg(long, conflicts_with = "full")]
        db_only: bool,
        /// Only full-project archives
        #[arg(long)]
        full: bool,
    },

    /// Show recent runs
    History {
        #[arg(long, short = 'n', default_value = "10")]
        limit: usize,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        None | Some(Commands::Restore { .. }) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let config = cli.config.as_deref();

    let result = match cli.command {
        None => cmd::backup::run(&root, config, cli.backup, cli.json),
        Some(Commands::Restore { name, dest }) => {
            cmd::restore::run(&root, config, &name, &dest, cli.json)
        }
        Some(Commands::List { db_only, full }) => {
            cmd::list::run(&root, config, cmd::list::scope_filter(db_only, full), cli.json)
        }
        Some(Commands::History { limit }) => cmd::history::run(&root, limit, cli.json),
        Some(Commands::Config { subcommand }) => {
            cmd::config::run(&root, config, subcommand, cli.json)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
