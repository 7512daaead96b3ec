// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side { Buy, Sell }

impl Side {
    pub fn from_code(code: i32) -> Option<Self> {
        match code { 1 => Some(Side::Buy), 2 => Some(Side::Sell), _ => None }
    }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "Buy", Side::Sell => "Sell" } }
}

/// One execution reported by the venue.
///
/// Produced once by the fill fetch and only read afterwards (column
/// extraction, cursor bookkeeping). Enumerated attributes keep the raw venue
/// code; mapping a code to its display name is the column registry's job.
#[derive(Debug, Clone, PartialEq)]
pub struct FillRecord {
    // identity
    pub record_id: String,
    pub client_order_id: Option<String>,
    pub parent_order_id: Option<String>,
    pub oma_order_id: Option<String>,
    pub exchange_order_id: Option<String>,
    pub exchange_transaction_id: Option<String>,

    // timing
    pub utc_date: NaiveDate,
    pub utc_time: NaiveTime,
    pub exchange_date: Option<NaiveDate>,
    pub exchange_time: Option<NaiveTime>,

    // instrument
    pub exchange_name: Option<String>,
    pub contract_name: Option<String>,
    pub symbol: Option<String>,
    pub product_type: Option<i32>,
    pub put_call: Option<i32>,
    pub strike: Option<Decimal>,

    // execution
    pub trade_side: Option<i32>,
    pub fill_qty: Option<Decimal>,
    pub price: Option<Decimal>,
    pub full_partial: Option<i32>,
    pub ord_type: Option<i32>,
    pub modifier: Option<String>,
    pub fill_type: Option<i32>,
    pub exec_qty: Option<Decimal>,
    pub work_qty: Option<Decimal>,
    pub aggressor_flag: Option<bool>,
    pub manual_fill: Option<bool>,
    pub position_effect: Option<i32>,

    // account / routing
    pub broker: Option<String>,
    pub account: Option<String>,
    pub account_type: Option<i32>,
    pub give_up: Option<String>,
    pub route: Option<String>,
    pub exchange_account: Option<String>,
    pub originator: Option<String>,
    pub current_user: Option<String>,
    pub connection_id: Option<String>,

    // regulatory / free text
    pub text_a: Option<String>,
    pub text_b: Option<String>,
    pub text_c: Option<String>,
    pub text_tt: Option<String>,
    pub order_origination: Option<i32>,
    pub trading_capacity: Option<i32>,
    pub liquidity_provision: Option<bool>,
    pub commodity_derivative_indicator: Option<bool>,
    pub invest_dec: Option<String>,
    pub exec_dec: Option<String>,
    pub client_id: Option<String>,
}

impl FillRecord {
    /// Bare record: identity and UTC timing set, every other attribute absent.
    pub fn new(record_id: impl Into<String>, utc: DateTime<Utc>) -> Self {
        Self {
            record_id: record_id.into(),
            client_order_id: None,
            parent_order_id: None,
            oma_order_id: None,
            exchange_order_id: None,
            exchange_transaction_id: None,
            utc_date: utc.date_naive(),
            utc_time: utc.time(),
            exchange_date: None,
            exchange_time: None,
            exchange_name: None,
            contract_name: None,
            symbol: None,
            product_type: None,
            put_call: None,
            strike: None,
            trade_side: None,
            fill_qty: None,
            price: None,
            full_partial: None,
            ord_type: None,
            modifier: None,
            fill_type: None,
            exec_qty: None,
            work_qty: None,
            aggressor_flag: None,
            manual_fill: None,
            position_effect: None,
            broker: None,
            account: None,
            account_type: None,
            give_up: None,
            route: None,
            exchange_account: None,
            originator: None,
            current_user: None,
            connection_id: None,
            text_a: None,
            text_b: None,
            text_c: None,
            text_tt: None,
            order_origination: None,
            trading_capacity: None,
            liquidity_provision: None,
            commodity_derivative_indicator: None,
            invest_dec: None,
            exec_dec: None,
            client_id: None,
        }
    }

    pub fn utc_timestamp(&self) -> DateTime<Utc> {
        self.utc_date.and_time(self.utc_time).and_utc()
    }
}

pub type FillBatch = Vec<FillRecord>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn utc_timestamp_recombines_date_and_time() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 8, 14, 30, 5).unwrap()
            + chrono::Duration::milliseconds(250);
        let fill = FillRecord::new("R1", ts);
        assert_eq!(fill.utc_date, NaiveDate::from_ymd_opt(2024, 3, 8).unwrap());
        assert_eq!(fill.utc_timestamp(), ts);
    }

    #[test]
    fn side_codes() {
        assert_eq!(Side::from_code(1), Some(Side::Buy));
        assert_eq!(Side::from_code(2).map(|s| s.as_str()), Some("Sell"));
        assert_eq!(Side::from_code(9), None);
    }
}
