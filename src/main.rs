use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use embedding_pool::config::Config;
use embedding_pool::executor::check_prerequisite;
use embedding_pool::logging::{self, LogConfig, LogFormat};
use embedding_pool::{EmbeddingRequest, EmbeddingsService, ServiceError};

#[derive(Parser)]
#[command(name = "embedding-pool", version, about)]
struct Cli {
    /// Base configuration file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Optional file overlaid on top of the base configuration
    #[arg(long)]
    user_config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format: pretty, compact, json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read one JSON request per line and print one result per line
    Embed {
        /// Request file (defaults to stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Validate the configuration and check the worker runtime
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_verbosity(cli.verbose);
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format);
    }
    logging::init(log_config.with_env_overrides());

    let config = match &cli.user_config {
        Some(user) => Config::load_layered(Path::new(&cli.config), Some(user.as_path()))?,
        None => Config::load(&cli.config)?,
    };

    match cli.command {
        Command::Check => check(&config).await,
        Command::Embed { input } => embed(&config, input.as_deref()).await,
    }
}

async fn check(config: &Config) -> Result<()> {
    config.validate()?;
    config.log_settings();
    if config.prerequisite.enabled {
        let version = check_prerequisite(&config.prerequisite).await?;
        println!("{version}");
    } else {
        println!("prerequisite check disabled");
    }
    Ok(())
}

async fn embed(config: &Config, input: Option<&Path>) -> Result<()> {
    config.validate()?;
    config.log_settings();
    let service = EmbeddingsService::start(config).await?;

    let outcome = match input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            serve_lines(&service, BufReader::new(file)).await
        }
        None => serve_lines(&service, BufReader::new(tokio::io::stdin())).await,
    };

    let stats = service.pool().stats();
    info!(
        processed = stats.total_processed,
        restarts = stats.total_restarts,
        failures = stats.total_failures,
        "Done"
    );
    service.shutdown().await;
    outcome
}

async fn serve_lines<R>(service: &EmbeddingsService, reader: R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read request")?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, shutting down");
                break;
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let output = match serde_json::from_str::<EmbeddingRequest>(&line) {
            Ok(request) => match service.generate_embeddings(&request).await {
                Ok(response) => serde_json::to_string(&response)?,
                Err(e) => failure_line(&e),
            },
            Err(e) => {
                debug!("Rejected malformed request: {e}");
                json!({"status": "error", "code": 400, "message": format!("Malformed request: {e}")})
                    .to_string()
            }
        };

        stdout.write_all(output.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn failure_line(err: &ServiceError) -> String {
    json!({
        "status": "error",
        "code": err.status_code(),
        "message": err.to_string(),
    })
    .to_string()
}
