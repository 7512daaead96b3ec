// ===============================
// src/main.rs
// ===============================
/*
 # contoh
 TT_APP_KEY=... TT_APP_SECRET=... OUTPUT_FILE=./out/fills.csv \
   RUN_DAYS=weekdays START_TIME=08:00 END_TIME=17:30 METRICS_PORT=9898 \
   cargo run --release

 curl -s localhost:9898/metrics | grep '^fill_'
*/
/*
=============================================================================
Project : fill_download: scheduled TT fill downloader in Rust
Module  : main.rs
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
use std::process::ExitCode;
use tracing::{error, info};

use fill_download::{app, config::Args, logging};

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Load config (.env + CLI) ----
    let args = Args::load();

    // ---- Logging ----
    if let Err(e) = logging::init(args.log_format, args.error_log.as_deref()) {
        eprintln!("{e}");
        return ExitCode::from(2);
    }

    // ---- Run one download session ----
    match app::run(&args).await {
        Ok(summary) => {
            info!(
                batches = summary.batches,
                rows = summary.rows,
                extraction_failures = summary.extraction_failures,
                "session closed"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}
