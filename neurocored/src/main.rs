//! NeuroCore daemon - simulation service
//!
//! Serves newline-delimited JSON requests over TCP:
//! - reconstructs a full-resolution connectome from an uploaded `.npy` array
//! - simulates the coupled neural-mass network
//! - returns summary statistics, the regime label and time series
//!
//! Storage locations (model checkpoint, config.json):
//! - Linux: ~/.local/share/neurocore/
//! - Windows: %APPDATA%\neurocore\
//! - MacOS: ~/Library/Application Support/neurocore/

use neurocore::crosscoder::{CrossCoder, Reconstructor};
use neurocore::pipeline::{SimulationPipeline, SimulationReport};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, Semaphore};
use tokio::time;
use tracing::{error, info, warn};

mod config;
mod paths;

use config::DaemonConfig;
use paths::AppPaths;

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Messages
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    Health,
    Simulate {
        parcellation_type: String,
        /// Raw `.npy` file bytes.
        payload: Vec<u8>,
    },
    ReloadModel,
    Shutdown,
}

/// Simulation reports keep their own `status` tag; the other variants are
/// told apart by their fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Response {
    Report(SimulationReport),
    Health { status: String, model_loaded: bool },
    Ack { status: String, message: String },
}

impl Response {
    fn ack(message: impl Into<String>) -> Self {
        Response::Ack {
            status: "ok".to_string(),
            message: message.into(),
        }
    }

    fn error(kind: &str, message: impl Into<String>) -> Self {
        Response::Report(SimulationReport::Error {
            kind: kind.to_string(),
            message: message.into(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Daemon State
// ═══════════════════════════════════════════════════════════════════════════

struct DaemonState {
    pipeline: Arc<SimulationPipeline>,
    config: DaemonConfig,
    paths: AppPaths,
}

impl DaemonState {
    async fn new(config: DaemonConfig, paths: AppPaths) -> Self {
        let reconstructor = load_reconstructor(config.model_path(&paths)).await;
        let pipeline = SimulationPipeline::new(config.pipeline, reconstructor, None);
        Self {
            pipeline: Arc::new(pipeline),
            config,
            paths,
        }
    }

    async fn reload_model(&mut self) -> bool {
        let reconstructor = load_reconstructor(self.config.model_path(&self.paths)).await;
        let loaded = reconstructor.is_some();
        self.pipeline = Arc::new(SimulationPipeline::new(
            self.config.pipeline,
            reconstructor,
            None,
        ));
        loaded
    }
}

/// Missing or unreadable checkpoints leave the model unloaded.
async fn load_reconstructor(path: std::path::PathBuf) -> Option<Arc<dyn Reconstructor>> {
    let shown = path.clone();
    let loaded = tokio::task::spawn_blocking(move || CrossCoder::load_from_path(&path)).await;
    match loaded {
        Ok(Ok(coder)) => {
            info!(
                "Reconstruction model loaded from {:?} (latent={}, target={}, params={})",
                shown,
                coder.latent_dim(),
                coder.target(),
                coder.param_count()
            );
            Some(Arc::new(coder))
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("No reconstruction model at {:?}; simulations will report model_not_loaded", shown);
            None
        }
        Ok(Err(e)) => {
            error!("Failed to load reconstruction model {:?}: {}", shown, e);
            None
        }
        Err(e) => {
            error!("Model loader task failed: {}", e);
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Client Handler
// ═══════════════════════════════════════════════════════════════════════════

/// Upper bound on one request line. A 463-region upload is a few MB of JSON.
const MAX_REQUEST_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, PartialEq)]
enum RequestLine {
    Line,
    TooLong,
    Eof,
}

/// Read one newline-terminated request into `buf` without buffering more
/// than `max` bytes. The trailing newline is stripped.
async fn read_request_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max: usize,
    buf: &mut Vec<u8>,
) -> std::io::Result<RequestLine> {
    buf.clear();
    let limit = (max as u64).saturating_add(1);
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(RequestLine::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        return Ok(RequestLine::Line);
    }
    if buf.len() > max {
        return Ok(RequestLine::TooLong);
    }
    // Final line without a terminator.
    Ok(RequestLine::Line)
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> Result<(), Box<dyn std::error::Error>> {
    writer
        .write_all(serde_json::to_string(response)?.as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

async fn run_simulation(
    pipeline: Arc<SimulationPipeline>,
    jobs: Arc<Semaphore>,
    parcellation_type: String,
    payload: Vec<u8>,
) -> Response {
    let permit = match jobs.acquire_owned().await {
        Ok(p) => p,
        Err(_) => return Response::error("unavailable", "Daemon is shutting down"),
    };
    let joined = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        pipeline.run(&payload, &parcellation_type)
    })
    .await;

    match joined {
        Ok(report) => Response::Report(report),
        Err(e) => {
            error!("Simulation task failed: {}", e);
            Response::error("internal", format!("Simulation task failed: {}", e))
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<RwLock<DaemonState>>,
    jobs: Arc<Semaphore>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        match read_request_line(&mut reader, MAX_REQUEST_BYTES, &mut line).await? {
            RequestLine::Eof => break,
            RequestLine::TooLong => {
                // The rest of the line is never read, so the stream cannot resync.
                warn!("Request exceeds {} bytes; closing connection", MAX_REQUEST_BYTES);
                let resp = Response::error(
                    "invalid_request",
                    format!("Request exceeds {} bytes", MAX_REQUEST_BYTES),
                );
                write_response(&mut writer, &resp).await?;
                break;
            }
            RequestLine::Line => {}
        }

        let request: Request = match serde_json::from_slice(&line) {
            Ok(req) => req,
            Err(e) => {
                warn!("Invalid request: {}", e);
                let resp = Response::error("invalid_request", format!("Invalid request: {}", e));
                write_response(&mut writer, &resp).await?;
                continue;
            }
        };

        let response = match request {
            Request::Health => {
                let s = state.read().await;
                Response::Health {
                    status: "ok".to_string(),
                    model_loaded: s.pipeline.is_model_loaded(),
                }
            }
            Request::Simulate {
                parcellation_type,
                payload,
            } => {
                info!(
                    "Simulate request: parcellation={} payload={}B",
                    parcellation_type,
                    payload.len()
                );
                let pipeline = Arc::clone(&state.read().await.pipeline);
                let response =
                    run_simulation(pipeline, Arc::clone(&jobs), parcellation_type, payload).await;
                if let Response::Report(SimulationReport::Success(ref s)) = response {
                    info!("Simulation done: state={} mean_r={:.3}", s.state, s.mean_firing_rate);
                }
                response
            }
            Request::ReloadModel => {
                let mut s = state.write().await;
                if s.reload_model().await {
                    Response::ack("Model reloaded")
                } else {
                    Response::error("model_not_loaded", "Model could not be loaded")
                }
            }
            Request::Shutdown => {
                info!("Shutdown requested");
                jobs.close();
                tokio::spawn(async {
                    // Give the response a moment to flush before exiting.
                    time::sleep(Duration::from_millis(50)).await;
                    std::process::exit(0);
                });
                Response::ack("Shutting down")
            }
        };

        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

fn describe_model(path: &Path) -> String {
    if path.exists() {
        format!("{:?}", path)
    } else {
        format!("{:?} (missing)", path)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Setup application paths
    let paths = AppPaths::new()?;
    info!("Data directory: {:?}", paths.data_dir());

    let config = DaemonConfig::load(&paths)?;
    info!("Model file: {}", describe_model(&config.model_path(&paths)));
    info!(
        "Pipeline: t_max={} dt={} seed={:?} max_jobs={}",
        config.pipeline.t_max, config.pipeline.dt, config.pipeline.seed, config.max_jobs
    );

    let addr = config.addr.clone();
    let jobs = Arc::new(Semaphore::new(config.max_jobs.max(1)));
    let state = Arc::new(RwLock::new(DaemonState::new(config, paths).await));

    {
        let jobs = Arc::clone(&jobs);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C: stopping");
                jobs.close();
                std::process::exit(0);
            }
        });
    }

    // Start IPC server
    let listener = TcpListener::bind(&addr).await?;
    info!("NeuroCore daemon listening on {}", addr);

    // Accept client connections
    loop {
        let (stream, peer) = listener.accept().await?;
        info!("Client connected: {}", peer);
        let state_clone = Arc::clone(&state);
        let jobs_clone = Arc::clone(&jobs);

        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, state_clone, jobs_clone).await {
                error!("Client handler error: {}", e);
            }
        });
    }
}
