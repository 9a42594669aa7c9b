use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use plansmith::config::AppConfig;
use plansmith::pipeline::db::{DbHandle, PlannerDb};
use plansmith::pipeline::reaper;
use plansmith::pipeline::server;

#[derive(Parser)]
#[command(name = "plansmith")]
#[command(version, about = "Agent-backed feature planning service")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = "plansmith.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        db_path: Option<PathBuf>,
        /// Bind all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,
    },
    /// Fail stuck sessions once and exit
    Reap {
        #[arg(long)]
        db_path: Option<PathBuf>,
        #[arg(long)]
        stuck_threshold_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("plansmith=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(db_path) = db_path {
                config.server.db_path = db_path;
            }
            if dev {
                config.server.dev_mode = true;
            }
            server::start_server(config).await
        }
        Commands::Reap {
            db_path,
            stuck_threshold_secs,
        } => {
            if let Some(db_path) = db_path {
                config.server.db_path = db_path;
            }
            if let Some(secs) = stuck_threshold_secs {
                config.reaper.stuck_threshold_secs = secs;
            }
            let db = DbHandle::new(PlannerDb::new(&config.server.db_path)?);
            let summary =
                reaper::sweep(&db, config.reaper.stuck_threshold(), Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}
