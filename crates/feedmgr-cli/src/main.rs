mod cmd;
mod output;
mod root;
mod workspace;

use clap::{Parser, Subcommand};
use cmd::{access::AccessSubcommand, feed::FeedSubcommand, template::TemplateSubcommand};
use feedmgr_core::authz::CallerContext;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "feedmgr",
    about = "Provision data feeds onto a flow engine and manage who can see them",
    version,
    propagate_version = true
)]
struct Cli {
    /// Workspace root (default: nearest ancestor containing .feedmgr/)
    #[arg(long, global = true, env = "FEEDMGR_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Principal the command runs as
    #[arg(long, global = true, env = "FEEDMGR_USER", default_value = "anonymous")]
    user: String,

    /// Group the caller belongs to (repeatable)
    #[arg(long = "group", global = true)]
    groups: Vec<String>,

    /// Log more (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .feedmgr/ with a default config and an empty metadata store
    Init {
        /// Principal granted every permission in the generated policy
        #[arg(long)]
        admin: Option<String>,
    },

    /// Register and inspect feed templates
    Template {
        #[command(subcommand)]
        subcommand: TemplateSubcommand,
    },

    /// Provision and operate feeds
    Feed {
        #[command(subcommand)]
        subcommand: FeedSubcommand,
    },

    /// Manage which principals can view feed operations
    Access {
        #[command(subcommand)]
        subcommand: AccessSubcommand,
    },

    /// Validate .feedmgr/config.yaml
    Check,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let caller = cli
        .groups
        .iter()
        .fold(CallerContext::new(cli.user.as_str()), |c, g| c.with_group(g.as_str()));

    let result = match cli.command {
        Commands::Init { admin } => cmd::init::run(&root, admin.as_deref(), cli.json),
        Commands::Template { subcommand } => cmd::template::run(&root, &caller, subcommand, cli.json),
        Commands::Feed { subcommand } => cmd::feed::run(&root, &caller, subcommand, cli.json),
        Commands::Access { subcommand } => cmd::access::run(&root, &caller, subcommand, cli.json),
        Commands::Check => cmd::init::check(&root, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
