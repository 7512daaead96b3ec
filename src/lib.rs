// ===============================
// src/lib.rs
// ===============================
pub mod app;
pub mod columns;
pub mod config;
pub mod domain;
pub mod logging;
pub mod metrics;
pub mod schedule;
pub mod session;
pub mod sink;
pub mod tt;
pub mod worker;

pub use columns::{ColumnRegistry, ColumnSpec, ExtractError};
pub use domain::{FillBatch, FillRecord};
pub use schedule::{ActiveDays, ScheduleGate, ScheduleWindow};
pub use session::{AuthSession, AuthStatus, Credentials, FetchError, FillSource};
pub use sink::{BatchReport, CsvSink, ExtractionFailure};
pub use worker::{Cursor, DownloadWorker, WorkerConfig, WorkerError, WorkerEvents, WorkerState};
