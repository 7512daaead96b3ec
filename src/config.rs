// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : fill_download: scheduled TT fill downloader in Rust
Module  : config.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Logs in to the TT REST API with an app key/secret, polls fills on
          a fixed interval inside an active time-of-day / weekday window,
          and appends them to a CSV file with a selectable column set.
          Exposes Prometheus metrics and an append-only error log.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use chrono::{NaiveDate, NaiveTime};
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::columns::{ColumnRegistry, ColumnSpec, SelectError};
use crate::schedule::{ActiveDays, ScheduleError, ScheduleWindow};
use crate::session::Credentials;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Flag mentah dari CLI / ENV (.env ikut dibaca lebih dulu).
#[derive(Clone, Parser)]
#[command(name = "fill_download", version, about = "Download TT fills to CSV on a schedule")]
pub struct Args {
    #[arg(long, env = "TT_API_URL", default_value = "https://ttrestapi.trade.tt")]
    pub api_url: String,

    #[arg(long, env = "TT_APP_KEY", hide_env_values = true)]
    pub app_key: String,

    #[arg(long, env = "TT_APP_SECRET", hide_env_values = true)]
    pub app_secret: String,

    /// e.g. ext_prod_live, ext_uat_cert
    #[arg(long, env = "TT_ENVIRONMENT", default_value = "ext_prod_live")]
    pub environment: String,

    #[arg(long, env = "FILL_INTERVAL_MINUTES", default_value_t = 5)]
    pub interval_minutes: u64,

    /// HH:MM or HH:MM:SS, local time
    #[arg(long, env = "START_TIME", default_value = "00:00:00")]
    pub start_time: String,

    #[arg(long, env = "END_TIME", default_value = "23:59:59")]
    pub end_time: String,

    /// mon,tue,... or the shorthands all / weekdays
    #[arg(long, env = "RUN_DAYS", default_value = "mon,tue,wed,thu,fri")]
    pub days: String,

    /// YYYY-MM-DD; nothing is polled before this local date
    #[arg(long, env = "START_DATE")]
    pub start_date: Option<String>,

    #[arg(long, env = "OUTPUT_FILE")]
    pub output: PathBuf,

    /// Comma separated column names; all columns when empty
    #[arg(long, env = "COLUMNS", value_delimiter = ',')]
    pub columns: Vec<String>,

    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Append every warning and error to this file
    #[arg(long, env = "ERROR_LOG")]
    pub error_log: Option<PathBuf>,
}

impl Args {
    pub fn load() -> Self {
        // Pastikan .env dibaca sebelum clap membaca ENV
        let _ = dotenv();
        Args::parse()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("app key and secret must not be empty")]
    MissingCredentials,
    #[error("polling interval must be a positive number of minutes")]
    Interval,
    #[error("invalid time of day \"{0}\" (expected HH:MM or HH:MM:SS)")]
    TimeOfDay(String),
    #[error("invalid start date \"{0}\" (expected YYYY-MM-DD)")]
    StartDate(String),
    #[error("output file path is empty")]
    OutputPath,
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Columns(#[from] SelectError),
}

/// Validated, immutable settings for one download session.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub api_url: String,
    pub credentials: Credentials,
    pub window: ScheduleWindow,
    pub interval: Duration,
    pub output: PathBuf,
    pub columns: Vec<ColumnSpec>,
    pub request_timeout: Duration,
    pub metrics_port: Option<u16>,
}

impl RunConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        if args.app_key.trim().is_empty() || args.app_secret.trim().is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        let interval_secs = args
            .interval_minutes
            .checked_mul(60)
            .filter(|secs| *secs > 0)
            .ok_or(ConfigError::Interval)?;
        if args.output.as_os_str().is_empty() {
            return Err(ConfigError::OutputPath);
        }

        let start = parse_time_of_day(&args.start_time)?;
        let end = parse_time_of_day(&args.end_time)?;
        let days: ActiveDays = args.days.parse()?;
        let start_date = args
            .start_date
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map_err(|_| ConfigError::StartDate(s.to_string()))
            })
            .transpose()?;
        let window = ScheduleWindow::new(start, end, days, start_date)?;

        let registry = ColumnRegistry::global();
        let names: Vec<&str> = args
            .columns
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect();
        let columns = if names.is_empty() {
            registry.columns().to_vec()
        } else {
            registry.select(names.as_slice())?
        };

        Ok(Self {
            api_url: args.api_url.trim().to_string(),
            credentials: Credentials::new(
                args.app_key.trim(),
                args.app_secret.trim(),
                args.environment.trim(),
            ),
            window,
            interval: Duration::from_secs(interval_secs),
            output: args.output.clone(),
            columns,
            request_timeout: Duration::from_secs(args.request_timeout_secs.max(1)),
            metrics_port: args.metrics_port,
        })
    }
}

fn parse_time_of_day(s: &str) -> Result<NaiveTime, ConfigError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| ConfigError::TimeOfDay(s.to_string()))
}
