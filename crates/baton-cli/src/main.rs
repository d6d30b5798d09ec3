//! Baton CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "baton")]
#[command(about = "Distributed job scheduling", long_about = None)]
struct Cli {
    /// PostgreSQL connection URL; overrides the config file
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Redis connection URL; overrides the config file
    #[arg(long, env = "REDIS_URL", global = true)]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,
    /// Manage job definitions
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Validate a worker configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "baton.kdl")]
        path: String,
    },
    /// Run a worker: the job scheduler plus any singleton jobs
    Worker {
        /// Path to the configuration file
        #[arg(long, default_value = "baton.kdl")]
        config: String,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// Create or update the jobs defined in a configuration file
    Apply {
        /// Path to the configuration file
        #[arg(default_value = "baton.kdl")]
        path: String,
    },
    /// List all jobs
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stop scheduling a job
    Pause {
        /// Job name
        name: String,
    },
    /// Resume scheduling a paused job
    Resume {
        /// Job name
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let urls = commands::Urls {
        database: cli.database_url,
        redis: cli.redis_url,
    };

    match cli.command {
        Commands::Migrate => {
            commands::migrate(&urls).await?;
        }
        Commands::Jobs { command } => match command {
            JobCommands::Apply { path } => {
                commands::jobs::apply(&urls, &path).await?;
            }
            JobCommands::List { json } => {
                commands::jobs::list(&urls, json).await?;
            }
            JobCommands::Pause { name } => {
                commands::jobs::set_paused(&urls, &name, true).await?;
            }
            JobCommands::Resume { name } => {
                commands::jobs::set_paused(&urls, &name, false).await?;
            }
        },
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Worker { config } => {
            commands::worker::run(&urls, &config).await?;
        }
    }

    Ok(())
}
