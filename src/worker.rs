// ===============================
// src/worker.rs
// ===============================
//
// DownloadWorker: satu task background yang polling fill sesuai jadwal.
//
// - Idle -> Running -> Stopping -> Stopped. A fatal error goes Running ->
//   Stopped directly.
// - Every suspension point (closed gate, interval sleep, in-flight fetch)
//   races the stop token and the auth-loss signal.
// - Batches go out on an unbounded channel in fetch order; the channel
//   closes when the task ends. A fatal error is sent after Stopped is set.
//
use ahash::AHashSet;
use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::{
    select,
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::FillBatch;
use crate::metrics::{FILLS_DOWNLOADED, FILLS_DUPLICATE, GATE_OPEN, POLLS, WORKER_STATE};
use crate::schedule::{ScheduleGate, ScheduleWindow};
use crate::session::{AuthStatus, FetchError, FillSource};

// Closed-gate sleeps are re-evaluated at least this often (DST, clock jumps).
const MAX_GATE_SLEEP: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl WorkerState {
    fn code(self) -> i64 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Running => 1,
            WorkerState::Stopping => 2,
            WorkerState::Stopped => 3,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker was already started")]
    AlreadyStarted,
    #[error("session is not authorized")]
    NotAuthorized,
    #[error("authorization lost: {0}")]
    AuthLost(String),
    #[error("polling interval must be greater than zero")]
    InvalidInterval,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    window: ScheduleWindow,
    interval: Duration,
}

impl WorkerConfig {
    pub fn new(window: ScheduleWindow, interval: Duration) -> Result<Self, WorkerError> {
        if interval.is_zero() {
            return Err(WorkerError::InvalidInterval);
        }
        Ok(Self { window, interval })
    }

    pub fn window(&self) -> &ScheduleWindow {
        &self.window
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Resume point for the next fetch.
///
/// The venue filter is inclusive (`>= since`), so records sitting exactly on
/// the boundary come back on the next poll. Their ids are remembered and
/// filtered; everything else newer is admitted in the order received.
#[derive(Debug, Clone)]
pub struct Cursor {
    since: DateTime<Utc>,
    boundary_ids: AHashSet<String>,
}

impl Cursor {
    pub fn new(since: DateTime<Utc>) -> Self {
        Self { since, boundary_ids: AHashSet::new() }
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    pub fn admit(&mut self, batch: FillBatch) -> FillBatch {
        let mut fresh = Vec::with_capacity(batch.len());
        let mut newest = self.since;
        for fill in batch {
            let ts = fill.utc_timestamp();
            if ts < self.since || (ts == self.since && self.boundary_ids.contains(&fill.record_id)) {
                FILLS_DUPLICATE.inc();
                debug!(record_id = %fill.record_id, "already delivered, skipped");
                continue;
            }
            newest = newest.max(ts);
            fresh.push(fill);
        }
        if newest > self.since {
            self.since = newest;
            self.boundary_ids.clear();
        }
        for fill in &fresh {
            if fill.utc_timestamp() == self.since {
                self.boundary_ids.insert(fill.record_id.clone());
            }
        }
        fresh
    }
}

/// Local midnight of the configured start date, else of `today`.
pub fn initial_cursor(window: &ScheduleWindow, today: NaiveDate) -> Cursor {
    let day = window.earliest().map(|naive| naive.date()).unwrap_or(today);
    Cursor::new(local_midnight(day))
}

fn local_midnight(day: NaiveDate) -> DateTime<Utc> {
    let midnight = day.and_time(NaiveTime::MIN);
    Local
        .from_local_datetime(&midnight)
        .earliest()
        // midnight skipped by a DST jump: the day starts an hour later
        .or_else(|| Local.from_local_datetime(&(midnight + chrono::Duration::hours(1))).earliest())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

/// What the controller consumes from a running worker.
pub struct WorkerEvents {
    pub batches: mpsc::UnboundedReceiver<FillBatch>,
    pub fatal: oneshot::Receiver<WorkerError>,
}

pub struct DownloadWorker<S: FillSource + 'static> {
    source: Arc<S>,
    state: Arc<watch::Sender<WorkerState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: FillSource + 'static> DownloadWorker<S> {
    pub fn new(source: Arc<S>) -> Self {
        let (state, _rx) = watch::channel(WorkerState::Idle);
        Self {
            source,
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Idle -> Running. One worker runs one download session.
    pub async fn start(&self, config: WorkerConfig) -> Result<WorkerEvents, WorkerError> {
        let mut task = self.task.lock().await;
        if self.state() != WorkerState::Idle {
            return Err(WorkerError::AlreadyStarted);
        }
        if !self.source.is_authorized() {
            return Err(WorkerError::NotAuthorized);
        }
        // a concurrent stop() may have moved Idle -> Stopped meanwhile
        let started = self.state.send_if_modified(|s| {
            if *s == WorkerState::Idle {
                *s = WorkerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(WorkerError::AlreadyStarted);
        }
        WORKER_STATE.set(WorkerState::Running.code());

        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = oneshot::channel();
        let cursor = initial_cursor(config.window(), Local::now().date_naive());
        info!(
            since = %cursor.since(),
            interval = ?config.interval(),
            start = %config.window().start(),
            end = %config.window().end(),
            "download worker started"
        );

        let source = Arc::clone(&self.source);
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        *task = Some(tokio::spawn(async move {
            let result = poll_loop(source.as_ref(), config, cursor, &batch_tx, &cancel).await;
            drop(batch_tx);
            set_state(&state, WorkerState::Stopped);
            GATE_OPEN.set(0);
            match result {
                Ok(()) => info!("download worker stopped"),
                Err(e) => {
                    error!(error = %e, "download worker stopped on fatal error");
                    let _ = fatal_tx.send(e);
                }
            }
        }));

        Ok(WorkerEvents { batches: batch_rx, fatal: fatal_rx })
    }

    /// Request stop and wait until the worker is Stopped. Idempotent; safe
    /// from any task.
    pub async fn stop(&self) {
        self.state.send_if_modified(|s| match *s {
            WorkerState::Idle => {
                *s = WorkerState::Stopped;
                true
            }
            WorkerState::Running => {
                *s = WorkerState::Stopping;
                true
            }
            WorkerState::Stopping | WorkerState::Stopped => false,
        });
        WORKER_STATE.set(self.state().code());
        self.cancel.cancel();

        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "download worker task failed");
            }
        }
        set_state(&self.state, WorkerState::Stopped);
    }
}

fn set_state(state: &watch::Sender<WorkerState>, next: WorkerState) {
    state.send_replace(next);
    WORKER_STATE.set(next.code());
}

fn lost_reason(status: &AuthStatus) -> Option<String> {
    match status {
        AuthStatus::Lost(reason) => Some(reason.clone()),
        _ => None,
    }
}

/// Resolves once authorization is lost; never resolves otherwise.
async fn auth_lost(rx: &mut watch::Receiver<AuthStatus>) -> String {
    loop {
        let status = rx.borrow_and_update().clone();
        if let Some(reason) = lost_reason(&status) {
            return reason;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

async fn poll_loop<S: FillSource + ?Sized>(
    source: &S,
    config: WorkerConfig,
    mut cursor: Cursor,
    batches: &mpsc::UnboundedSender<FillBatch>,
    cancel: &CancellationToken,
) -> Result<(), WorkerError> {
    let gate = ScheduleGate::new(config.window().clone());
    let mut auth = source.auth_status();

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let lost = lost_reason(&auth.borrow());
        if let Some(reason) = lost {
            return Err(WorkerError::AuthLost(reason));
        }

        // 1) gate
        let now = Local::now().naive_local();
        if !gate.is_open(now) {
            GATE_OPEN.set(0);
            let wait = gate.wait_from(now).unwrap_or(config.interval()).min(MAX_GATE_SLEEP);
            debug!(?wait, next_open = ?gate.next_open_instant(now), "gate closed");
            select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                reason = auth_lost(&mut auth) => return Err(WorkerError::AuthLost(reason)),
                _ = sleep(wait) => continue,
            }
        }
        GATE_OPEN.set(1);

        // 2) fetch
        let fetched = select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            reason = auth_lost(&mut auth) => return Err(WorkerError::AuthLost(reason)),
            res = source.fetch_fills_since(cursor.since()) => res,
        };
        // a loss that raced the fetch wins over its result
        let lost = lost_reason(&auth.borrow());
        if let Some(reason) = lost {
            POLLS.with_label_values(&["auth_lost"]).inc();
            return Err(WorkerError::AuthLost(reason));
        }

        // 3) forward / classify
        match fetched {
            Ok(batch) => {
                POLLS.with_label_values(&["ok"]).inc();
                let received = batch.len();
                let fresh = cursor.admit(batch);
                debug!(received, fresh = fresh.len(), since = %cursor.since(), "poll done");
                if !fresh.is_empty() {
                    FILLS_DOWNLOADED.inc_by(fresh.len() as u64);
                    if batches.send(fresh).is_err() {
                        warn!("batch consumer gone, stopping");
                        return Ok(());
                    }
                }
            }
            Err(FetchError::AuthExpired(reason)) => {
                POLLS.with_label_values(&["auth_lost"]).inc();
                return Err(WorkerError::AuthLost(reason));
            }
            Err(FetchError::Network(e)) => {
                POLLS.with_label_values(&["network_error"]).inc();
                warn!(error = %e, retry_in = ?config.interval(), "fill fetch failed, retrying next tick");
            }
        }

        // 4) interval
        select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            reason = auth_lost(&mut auth) => return Err(WorkerError::AuthLost(reason)),
            _ = sleep(config.interval()) => {}
        }
    }
}
