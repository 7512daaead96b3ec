// ===============================
// src/tt.rs
// ===============================
//
// Helper for the TT REST endpoints: timestamps, key fingerprint, and the
// minimal wire models for the token and fills replies.
//
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::FillRecord;

pub fn timestamp_ns(ts: DateTime<Utc>) -> i64 {
    ts.timestamp() * 1_000_000_000 + i64::from(ts.timestamp_subsec_nanos())
}

pub fn from_unix_nanos(ns: i64) -> Option<DateTime<Utc>> {
    let secs = ns.div_euclid(1_000_000_000);
    let nanos = ns.rem_euclid(1_000_000_000) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Short, stable identifier for an app key that is safe to log.
pub fn key_fingerprint(app_key: &str) -> String {
    let digest = Sha256::digest(app_key.as_bytes());
    hex::encode(&digest[..6])
}

// ---- token endpoint ----
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub seconds_until_expiry: Option<u64>,
}

impl TokenResponse {
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("ok")
    }
}

// ---- fills endpoint ----
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillsPage {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default = "default_last_page")]
    pub last_page: bool,
    #[serde(default)]
    pub next_page_key: Option<String>,
    // kept raw so one bad record does not sink the whole page
    #[serde(default)]
    pub fills: Vec<serde_json::Value>,
}

fn default_last_page() -> bool {
    true
}

impl FillsPage {
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("ok")
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireFill {
    pub record_id: Option<String>,
    pub utc_timestamp: Option<i64>,
    pub exchange_timestamp: Option<i64>,

    pub client_order_id: Option<String>,
    pub parent_order_id: Option<String>,
    pub oma_order_id: Option<String>,
    pub exchange_order_id: Option<String>,
    pub exchange_transaction_id: Option<String>,

    pub exchange_name: Option<String>,
    pub contract_name: Option<String>,
    pub symbol: Option<String>,
    pub product_type: Option<i32>,
    pub put_call: Option<i32>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub strike: Option<Decimal>,

    pub side: Option<i32>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub fill_qty: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub price: Option<Decimal>,
    pub full_partial: Option<i32>,
    pub ord_type: Option<i32>,
    pub modifier: Option<String>,
    pub fill_type: Option<i32>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub exec_qty: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub work_qty: Option<Decimal>,
    pub aggressor_flag: Option<bool>,
    pub manual_fill: Option<bool>,
    pub position_effect: Option<i32>,

    pub broker: Option<String>,
    pub account: Option<String>,
    pub account_type: Option<i32>,
    pub give_up: Option<String>,
    pub route: Option<String>,
    pub exchange_account: Option<String>,
    pub originator: Option<String>,
    pub current_user: Option<String>,
    pub connection_id: Option<String>,

    pub text_a: Option<String>,
    pub text_b: Option<String>,
    pub text_c: Option<String>,
    #[serde(rename = "textTT")]
    pub text_tt: Option<String>,
    pub order_origination: Option<i32>,
    pub trading_capacity: Option<i32>,
    pub liquidity_provision: Option<bool>,
    pub commodity_derivative_indicator: Option<bool>,
    pub invest_dec: Option<String>,
    pub exec_dec: Option<String>,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedFill {
    #[error("fill has no recordId")]
    MissingRecordId,
    #[error("fill {0} has no usable utcTimestamp")]
    BadTimestamp(String),
    #[error("fill does not decode: {0}")]
    Decode(String),
}

/// Decode one raw fill from a page.
pub fn parse_fill(raw: serde_json::Value) -> Result<FillRecord, MalformedFill> {
    let wire: WireFill =
        serde_json::from_value(raw).map_err(|e| MalformedFill::Decode(e.to_string()))?;
    FillRecord::try_from(wire)
}

impl TryFrom<WireFill> for FillRecord {
    type Error = MalformedFill;

    fn try_from(w: WireFill) -> Result<Self, Self::Error> {
        let record_id = w
            .record_id
            .filter(|id| !id.is_empty())
            .ok_or(MalformedFill::MissingRecordId)?;
        let utc = w
            .utc_timestamp
            .and_then(from_unix_nanos)
            .ok_or_else(|| MalformedFill::BadTimestamp(record_id.clone()))?;
        let exchange_ts = w.exchange_timestamp.and_then(from_unix_nanos);

        let mut fill = FillRecord::new(record_id, utc);
        fill.exchange_date = exchange_ts.map(|t| t.date_naive());
        fill.exchange_time = exchange_ts.map(|t| t.time());
        fill.client_order_id = w.client_order_id;
        fill.parent_order_id = w.parent_order_id;
        fill.oma_order_id = w.oma_order_id;
        fill.exchange_order_id = w.exchange_order_id;
        fill.exchange_transaction_id = w.exchange_transaction_id;
        fill.exchange_name = w.exchange_name;
        fill.contract_name = w.contract_name;
        fill.symbol = w.symbol;
        fill.product_type = w.product_type;
        fill.put_call = w.put_call;
        fill.strike = w.strike;
        fill.trade_side = w.side;
        fill.fill_qty = w.fill_qty;
        fill.price = w.price;
        fill.full_partial = w.full_partial;
        fill.ord_type = w.ord_type;
        fill.modifier = w.modifier;
        fill.fill_type = w.fill_type;
        fill.exec_qty = w.exec_qty;
        fill.work_qty = w.work_qty;
        fill.aggressor_flag = w.aggressor_flag;
        fill.manual_fill = w.manual_fill;
        fill.position_effect = w.position_effect;
        fill.broker = w.broker;
        fill.account = w.account;
        fill.account_type = w.account_type;
        fill.give_up = w.give_up;
        fill.route = w.route;
        fill.exchange_account = w.exchange_account;
        fill.originator = w.originator;
        fill.current_user = w.current_user;
        fill.connection_id = w.connection_id;
        fill.text_a = w.text_a;
        fill.text_b = w.text_b;
        fill.text_c = w.text_c;
        fill.text_tt = w.text_tt;
        fill.order_origination = w.order_origination;
        fill.trading_capacity = w.trading_capacity;
        fill.liquidity_provision = w.liquidity_provision;
        fill.commodity_derivative_indicator = w.commodity_derivative_indicator;
        fill.invest_dec = w.invest_dec;
        fill.exec_dec = w.exec_dec;
        fill.client_id = w.client_id;
        Ok(fill)
    }
}
