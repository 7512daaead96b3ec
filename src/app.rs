// ===============================
// src/app.rs
// ===============================
//
// Controller: config -> login -> buka CSV -> jalankan worker -> tulis batch
// berurutan -> stop (Ctrl-C / error output) -> tutup CSV -> tutup session.
//
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::select;
use tracing::{error, info, warn};

use crate::config::{Args, ConfigError, RunConfig};
use crate::metrics;
use crate::session::{AuthError, AuthSession, FillSource};
use crate::sink::{CsvSink, SinkError};
use crate::worker::{DownloadWorker, WorkerConfig, WorkerError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Rest API was not able to log in with provided App Key and Secret: {0}")]
    Auth(#[from] AuthError),
    #[error("output error: {0}")]
    Sink(#[from] SinkError),
    #[error("download stopped: {0}")]
    Worker(#[from] WorkerError),
    #[error("cannot serve metrics: {0}")]
    Metrics(#[source] std::io::Error),
}

impl AppError {
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) | AppError::Metrics(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
    pub batches: usize,
    pub rows: usize,
    pub extraction_failures: usize,
}

/// Resolves on Ctrl-C. If the handler cannot be installed, never resolves.
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

pub async fn run(args: &Args) -> Result<Summary, AppError> {
    // 1) config
    let cfg = RunConfig::from_args(args)?;
    let worker_cfg = WorkerConfig::new(cfg.window.clone(), cfg.interval)?;

    metrics::init();
    if let Some(port) = cfg.metrics_port {
        metrics::serve_metrics(port).map_err(AppError::Metrics)?;
    }

    info!(
        app_key = %cfg.credentials.fingerprint(),
        environment = %cfg.credentials.environment,
        api_url = %cfg.api_url,
        start = %cfg.window.start(),
        end = %cfg.window.end(),
        start_date = ?cfg.window.start_date(),
        interval = ?cfg.interval,
        output = %cfg.output.display(),
        columns = cfg.columns.len(),
        "startup config"
    );

    // 2) login
    let session = AuthSession::new(cfg.api_url.clone(), cfg.credentials.clone(), cfg.request_timeout)?;
    session.authenticate().await?;

    // 3) output
    let mut sink = match open_sink(&cfg).await {
        Ok(sink) => sink,
        Err(e) => {
            session.close();
            return Err(e.into());
        }
    };

    // 4) + 5)
    let result = download(Arc::clone(&session), worker_cfg, &mut sink, ctrl_c()).await;
    let closed = sink.close().await;
    session.close();

    let summary = result?;
    closed?;
    Ok(summary)
}

async fn open_sink(cfg: &RunConfig) -> Result<CsvSink, SinkError> {
    let mut sink = CsvSink::create(&cfg.output, cfg.columns.clone()).await?;
    sink.write_header().await?;
    Ok(sink)
}

/// Run one worker session, writing every batch to `sink` in arrival order,
/// until the worker ends on its own or `shutdown` resolves. The sink stays
/// open; closing it is the caller's job.
pub async fn download<S, F>(
    source: Arc<S>,
    config: WorkerConfig,
    sink: &mut CsvSink,
    shutdown: F,
) -> Result<Summary, AppError>
where
    S: FillSource + 'static,
    F: Future<Output = ()>,
{
    let worker = DownloadWorker::new(source);
    let mut events = worker.start(config).await?;
    tokio::pin!(shutdown);

    let mut summary = Summary::default();
    let mut stopping = false;
    let mut sink_error = None;

    loop {
        select! {
            batch = events.batches.recv() => {
                let Some(batch) = batch else { break };
                match sink.write_batch(&batch).await {
                    Ok(report) => {
                        summary.batches += 1;
                        summary.rows += report.rows;
                        summary.extraction_failures += report.failures.len();
                        info!(rows = report.rows, failures = report.failures.len(), "batch written");
                    }
                    Err(e) => {
                        error!(error = %e, "output write failed, stopping download");
                        sink_error = Some(e);
                        worker.stop().await;
                        break;
                    }
                }
            }
            _ = &mut shutdown, if !stopping => {
                info!("stop requested");
                stopping = true;
                // already-fetched batches are still drained and written
                worker.stop().await;
            }
        }
    }

    if let Some(e) = sink_error {
        return Err(e.into());
    }
    if let Ok(fatal) = events.fatal.await {
        return Err(fatal.into());
    }
    info!(batches = summary.batches, rows = summary.rows, "download finished");
    Ok(summary)
}
