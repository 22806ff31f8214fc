//! Stand-in embedding worker for tests and local runs.
//!
//! Speaks the same line protocol as the real worker: one request line per
//! connection, one answer line back, `TERMINATE` to shut down. Embeddings
//! are deterministic vectors derived from a hash of each record.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{Level, debug, info, warn};

use embedding_pool::executor::TERMINATE_FRAME;
use embedding_pool::logging::{self, LogConfig};
use embedding_pool::model::{EmbeddingRequest, EmbeddingResponse, RecordEmbedding};

/// How long to keep retrying when the port is still held by a previous worker.
const BIND_ATTEMPTS: u32 = 50;
const BIND_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Answer with one embedding per record
    Success,
    /// Answer with an error status
    Error,
    /// Answer with an empty line
    Empty,
    /// Answer with something that is not JSON
    Garbage,
}

#[derive(Parser, Debug)]
#[command(name = "mock-worker", version, about)]
struct Args {
    /// Port to listen on (127.0.0.1 only)
    #[arg(short, long)]
    port: u16,

    #[arg(long)]
    verbose: bool,

    /// Length of every generated vector
    #[arg(long, default_value_t = 8)]
    dimensions: usize,

    /// Pause before each answer
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    #[arg(long, value_enum, default_value_t = Mode::Success)]
    mode: Mode,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(
        LogConfig {
            level: if args.verbose { Level::DEBUG } else { Level::WARN },
            ..LogConfig::default()
        }
        .with_env_overrides(),
    );

    let listener = bind(args.port).await?;
    info!(port = args.port, pid = std::process::id(), "Mock worker listening");

    loop {
        let (stream, _) = listener.accept().await.context("accept failed")?;
        match handle(stream, &args).await {
            Ok(true) => {
                info!(port = args.port, "Terminating");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => warn!(port = args.port, "Connection failed: {e:#}"),
        }
    }
}

async fn bind(port: u16) -> Result<TcpListener> {
    let mut attempt = 0;
    loop {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                attempt += 1;
                debug!(port, attempt, "Port in use, retrying");
                tokio::time::sleep(BIND_RETRY).await;
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to bind port {port}")),
        }
    }
}

/// Serve one connection. Returns `true` when asked to terminate.
async fn handle(stream: TcpStream, args: &Args) -> Result<bool> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let line = line.trim_end();

    if line == TERMINATE_FRAME {
        // The sender may already have closed its side
        let _ = write_half.write_all(b"OK").await;
        return Ok(true);
    }
    if line.is_empty() {
        return Ok(false);
    }

    if args.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
    }

    let answer = match args.mode {
        Mode::Success => match serde_json::from_str::<EmbeddingRequest>(line) {
            Ok(request) => {
                debug!(records = request.len(), "Embedding request");
                let data = request
                    .records
                    .iter()
                    .map(|record| RecordEmbedding {
                        id: record.id.clone(),
                        embedding: hash_embedding(
                            &serde_json::to_string(record).unwrap_or_default(),
                            args.dimensions,
                        ),
                    })
                    .collect();
                serde_json::to_string(&EmbeddingResponse::success(data))?
            }
            Err(e) => serde_json::to_string(&EmbeddingResponse::error(format!(
                "Invalid request: {e}"
            )))?,
        },
        Mode::Error => serde_json::to_string(&EmbeddingResponse::error("mock worker failure"))?,
        Mode::Empty => String::new(),
        Mode::Garbage => "Traceback (most recent call last): mock".to_string(),
    };

    write_half.write_all(answer.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    write_half.flush().await?;
    Ok(false)
}

/// Deterministic, L2-normalized vector derived from `text`.
fn hash_embedding(text: &str, dimensions: usize) -> Vec<f32> {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    let bytes = hasher.finish().to_le_bytes();

    let mut embedding: Vec<f32> = (0..dimensions)
        .map(|i| f32::from(bytes[i % 8]) / 255.0)
        .collect();

    let norm_sq: f32 = embedding.iter().map(|v| v * v).sum();
    if norm_sq > 0.0 {
        let inv = 1.0 / norm_sq.sqrt();
        for v in &mut embedding {
            *v *= inv;
        }
    }
    embedding
}
