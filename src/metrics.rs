// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{core::Collector, Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{debug, info, warn};

// Process-wide registry behind the scrape endpoint
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Polling --------
pub static POLLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fill_polls_total", "fill fetches by outcome (ok, network_error, auth_lost)"),
        &["outcome"],
    )
    .unwrap()
});

pub static FILLS_DOWNLOADED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("fills_downloaded_total", "fills delivered to the sink").unwrap()
});

pub static FILLS_DUPLICATE: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "fills_duplicate_skipped_total",
        "fills dropped because they were already delivered",
    )
    .unwrap()
});

pub static FILLS_MALFORMED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("fill_records_malformed_total", "fills the venue sent that could not be decoded")
        .unwrap()
});

// -------- Output --------
pub static ROWS_WRITTEN: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("fill_rows_written_total", "CSV rows written").unwrap());

pub static EXTRACT_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fill_extract_errors_total", "cells left empty because extraction failed"),
        &["column"],
    )
    .unwrap()
});

// -------- State --------
pub static GATE_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("fill_schedule_gate_open", "1 while inside the active window").unwrap()
});

pub static WORKER_STATE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "fill_worker_state",
        "worker lifecycle (0 idle, 1 running, 2 stopping, 3 stopped)",
    )
    .unwrap()
});

pub static AUTH_RENEWALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("auth_token_renewals_total", "access token renewals by result"),
        &["result"],
    )
    .unwrap()
});

/// Register every collector. Safe to call more than once.
pub fn init() {
    let collectors: [Box<dyn Collector>; 9] = [
        Box::new(POLLS.clone()),
        Box::new(FILLS_DOWNLOADED.clone()),
        Box::new(FILLS_DUPLICATE.clone()),
        Box::new(FILLS_MALFORMED.clone()),
        Box::new(ROWS_WRITTEN.clone()),
        Box::new(EXTRACT_ERRORS.clone()),
        Box::new(GATE_OPEN.clone()),
        Box::new(WORKER_STATE.clone()),
        Box::new(AUTH_RENEWALS.clone()),
    ];
    for c in collectors {
        match REGISTRY.register(c) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => warn!(error = %e, "metric registration failed"),
        }
    }
}

pub fn encode_metrics() -> Result<Vec<u8>, prometheus::Error> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buf)?;
    Ok(buf)
}

/// Status line and body for one scrape request, routed on its request line.
fn scrape_response(request_line: &str) -> (&'static str, Vec<u8>) {
    let mut parts = request_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some("/" | "/metrics")) => match encode_metrics() {
            Ok(body) => ("200 OK", body),
            Err(e) => ("500 Internal Server Error", e.to_string().into_bytes()),
        },
        (Some("GET"), Some(_)) => ("404 Not Found", b"not found\n".to_vec()),
        _ => ("405 Method Not Allowed", b"GET only\n".to_vec()),
    }
}

fn handle_client(mut stream: TcpStream) -> std::io::Result<()> {
    let mut line = String::new();
    BufReader::new(&stream).read_line(&mut line)?;
    let (status, body) = scrape_response(&line);
    write!(
        stream,
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    stream.write_all(&body)?;
    stream.flush()
}

/// Bind the scrape port and answer on a dedicated OS thread (keeps the Tokio
/// runtime clean). Bind errors are returned to the caller.
pub fn serve_metrics(port: u16) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)?;
    info!(%addr, "metrics listening on /metrics");

    thread::spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => {
                    if let Err(e) = handle_client(stream) {
                        debug!(error = %e, "metrics scrape aborted");
                    }
                }
                Err(e) => warn!(error = %e, "metrics accept error"),
            }
        }
    });
    Ok(())
}
