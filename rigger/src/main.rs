use clap::Parser;
use rigger_core::config::{self, RiggerConfig};
use rigger_core::observability::init_tracing;
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "rigger")]
#[command(about = "Cluster infrastructure checks and registry mode management", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults plus RIGGER_* variables when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Compare the cloud infrastructure with the cluster configuration
    Check {
        /// Cluster, provider and static configuration documents
        #[arg(long)]
        meta_config: PathBuf,

        /// Read node states from the local cache instead of the cluster
        #[arg(long)]
        commander: bool,

        /// Output format: json or yaml
        #[arg(long, default_value = "json")]
        format: String,
    },
    /// Destroy every node and the base infrastructure
    Destroy {
        #[arg(long)]
        meta_config: PathBuf,

        /// Approve every plan without asking
        #[arg(long)]
        yes: bool,
    },
    /// Registry mode orchestration
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },
    /// Hold the documentation sync lease until interrupted
    Lease,
}

#[derive(clap::Subcommand)]
enum RegistryCommands {
    /// Run the orchestrator together with the image checker
    Reconcile {
        /// Reconcile a single time and print the resulting state
        #[arg(long)]
        once: bool,
    },
    /// Run one image checker round with the last persisted params
    CheckImages,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loaded = RiggerConfig::load(cli.config.as_deref())?;
    init_tracing(&loaded.logging.filter);
    let config = config::init(loaded);

    match cli.command {
        Commands::Check {
            meta_config,
            commander,
            format,
        } => commands::infra::check(&config, &meta_config, commander, &format).await,
        Commands::Destroy { meta_config, yes } => {
            commands::infra::destroy(&config, &meta_config, yes).await
        }
        Commands::Registry { command } => match command {
            RegistryCommands::Reconcile { once: true } => {
                commands::registry::reconcile_once(&config).await
            }
            RegistryCommands::Reconcile { once: false } => commands::registry::run(&config).await,
            RegistryCommands::CheckImages => commands::registry::check_images(&config).await,
        },
        Commands::Lease => commands::lease::run(&config).await,
    }
}
