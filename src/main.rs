use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use docreview::Settings;
use docreview::issues::{db::IssueDb, server};

#[derive(Parser)]
#[command(name = "docreview")]
#[command(version, about = "AI document review service")]
pub struct Cli {
    /// Path to the configuration file. Defaults to ./docreview.toml when present.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the issue database path
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the review HTTP service
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind on all interfaces, allow any CORS origin and log at debug level
        #[arg(long)]
        dev: bool,
    },
    /// Create the issue database and apply migrations, then exit
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is not an error
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(db_path) = &cli.db_path {
        settings.database.path = db_path.clone();
    }

    match cli.command {
        Commands::Serve { port, dev } => {
            if let Some(port) = port {
                settings.server.port = port;
            }
            if dev {
                settings.server.host = "0.0.0.0".to_string();
                settings.server.cors_permissive = true;
                settings.logging.level = "docreview=debug,tower_http=debug,info".to_string();
            }
            let _guard = docreview::telemetry::init(&settings.logging)?;
            server::start_server(settings).await?;
        }
        Commands::InitDb => {
            let _guard = docreview::telemetry::init(&settings.logging)?;
            let path = &settings.database.path;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create database directory")?;
            }
            IssueDb::new(path).context("Failed to initialize issue database")?;
            tracing::info!(path = %path.display(), "Issue database ready");
            println!("Issue database initialized at {}", path.display());
        }
    }

    Ok(())
}
