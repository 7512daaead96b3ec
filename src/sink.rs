// ===============================
// src/sink.rs
// ===============================
//
// CSV writer untuk fill:
// - File dibuat ulang (truncate) saat dibuka; parent directory dibuat otomatis.
// - Header sekali, lalu satu baris per fill, tiap sel diikuti koma.
// - One batch = one write_all + flush + sync_data. A failed write is
//   truncated back to the last committed length, so no partial row stays.
// - A failing column leaves its cell empty and is reported; the row goes on.
//
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tracing::{error, info, warn};

use crate::columns::ColumnSpec;
use crate::domain::FillRecord;
use crate::metrics::{EXTRACT_ERRORS, ROWS_WRITTEN};

pub const FIELD_SEPARATOR: char = ',';

#[cfg(windows)]
pub const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
pub const LINE_ENDING: &str = "\n";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("no columns selected for {0}")]
    NoColumns(PathBuf),
    #[error("cannot open output file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("write to {path} failed: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("write to {path} failed ({source}) and the partial row could not be removed: {rollback}")]
    Rollback {
        path: PathBuf,
        #[source]
        source: std::io::Error,
        rollback: std::io::Error,
    },
}

/// One cell that could not be extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionFailure {
    pub column: &'static str,
    pub record_id: String,
    pub message: String,
}

impl fmt::Display for ExtractionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Error parsing fill column {} for fill {}: {}",
            self.column, self.record_id, self.message
        )
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub rows: usize,
    pub failures: Vec<ExtractionFailure>,
}

pub fn render_header(columns: &[ColumnSpec]) -> String {
    let mut line = String::new();
    for c in columns {
        line.push_str(c.name);
        line.push(FIELD_SEPARATOR);
    }
    line.push_str(LINE_ENDING);
    line
}

/// One row, every cell followed by the separator. Values are not quoted.
pub fn render_row(
    fill: &FillRecord,
    columns: &[ColumnSpec],
    failures: &mut Vec<ExtractionFailure>,
) -> String {
    let mut line = String::new();
    for c in columns {
        match c.display(fill) {
            Ok(v) => line.push_str(&v),
            Err(e) => failures.push(ExtractionFailure {
                column: c.name,
                record_id: fill.record_id.clone(),
                message: e.to_string(),
            }),
        }
        line.push(FIELD_SEPARATOR);
    }
    line.push_str(LINE_ENDING);
    line
}

pub struct CsvSink {
    path: PathBuf,
    file: File,
    columns: Vec<ColumnSpec>,
    committed: u64,
    header_written: bool,
}

impl CsvSink {
    /// Create (or truncate) the output file for the selected columns.
    pub async fn create(path: impl AsRef<Path>, columns: Vec<ColumnSpec>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if columns.is_empty() {
            return Err(SinkError::NoColumns(path));
        }
        // Pastikan parent directory ada (kalau ada)
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| SinkError::Open { path: path.clone(), source })?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|source| SinkError::Open { path: path.clone(), source })?;

        info!(path = %path.display(), columns = columns.len(), "output file opened");
        Ok(Self { path, file, columns, committed: 0, header_written: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Write the header line. Only the first call writes.
    pub async fn write_header(&mut self) -> Result<(), SinkError> {
        if self.header_written {
            return Ok(());
        }
        let header = render_header(&self.columns);
        self.commit(header.as_bytes()).await?;
        self.header_written = true;
        Ok(())
    }

    /// Append one row per fill, in order. Extraction failures are reported,
    /// not raised; an I/O failure is fatal and leaves the file as it was
    /// before the call.
    pub async fn write_batch(&mut self, batch: &[FillRecord]) -> Result<BatchReport, SinkError> {
        self.write_header().await?;
        if batch.is_empty() {
            return Ok(BatchReport::default());
        }

        let mut failures = Vec::new();
        let mut buf = String::new();
        for fill in batch {
            buf.push_str(&render_row(fill, &self.columns, &mut failures));
        }
        self.commit(buf.as_bytes()).await?;

        for f in &failures {
            EXTRACT_ERRORS.with_label_values(&[f.column]).inc();
            error!(column = f.column, record_id = %f.record_id, "{f}");
        }
        ROWS_WRITTEN.inc_by(batch.len() as u64);
        Ok(BatchReport { rows: batch.len(), failures })
    }

    /// Flush and sync everything to disk, then release the file.
    pub async fn close(mut self) -> Result<(), SinkError> {
        self.file.flush().await.map_err(|source| self.write_error(source))?;
        self.file.sync_all().await.map_err(|source| self.write_error(source))?;
        info!(path = %self.path.display(), bytes = self.committed, "output file closed");
        Ok(())
    }

    async fn commit(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        match write_durable(&mut self.file, bytes).await {
            Ok(()) => {
                self.committed += bytes.len() as u64;
                Ok(())
            }
            Err(source) => Err(self.rollback(source).await),
        }
    }

    /// Cut the file back to the last full row after a failed write.
    async fn rollback(&mut self, source: std::io::Error) -> SinkError {
        let committed = self.committed;
        let undone = match self.file.set_len(committed).await {
            Ok(()) => self.file.seek(SeekFrom::Start(committed)).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match undone {
            Ok(()) => {
                warn!(path = %self.path.display(), bytes = committed, "failed write rolled back");
                self.write_error(source)
            }
            Err(rollback) => {
                error!(
                    path = %self.path.display(),
                    bytes = committed,
                    error = %rollback,
                    "rollback failed, output may end with a partial row"
                );
                SinkError::Rollback { path: self.path.clone(), source, rollback }
            }
        }
    }

    fn write_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Write { path: self.path.clone(), source }
    }
}

async fn write_durable(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_data().await
}
