// ===============================
// src/columns.rs
// ===============================
//
// Canonical, ordered table of output columns. Each column is a plain
// function FillRecord -> String that may fail; a failure only ever affects
// its own cell. The table order is the file's column order and never
// changes between runs.
//
use ahash::AHashMap as HashMap;
use chrono::{NaiveDate, NaiveTime};
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::{FillRecord, Side};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("unknown {field} code {code}")]
    UnknownCode { field: &'static str, code: i32 },
    #[error("{0} is missing")]
    Missing(&'static str),
}

pub type Extractor = fn(&FillRecord) -> Result<String, ExtractError>;

#[derive(Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub extract: Extractor,
}

impl ColumnSpec {
    pub const fn new(name: &'static str, extract: Extractor) -> Self {
        Self { name, extract }
    }

    pub fn display(&self, fill: &FillRecord) -> Result<String, ExtractError> {
        (self.extract)(fill)
    }
}

impl std::fmt::Debug for ColumnSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ColumnSpec").field(&self.name).finish()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("unknown column \"{0}\"")]
    Unknown(String),
    #[error("column \"{0}\" selected twice")]
    Duplicate(String),
    #[error("no columns selected")]
    Empty,
}

#[derive(Debug)]
pub struct ColumnRegistry {
    columns: Vec<ColumnSpec>,
    by_name: HashMap<&'static str, usize>,
}

pub static REGISTRY: Lazy<ColumnRegistry> = Lazy::new(|| ColumnRegistry::new(trade_pane_columns()));

impl ColumnRegistry {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        let by_name = columns.iter().enumerate().map(|(i, c)| (c.name, i)).collect();
        Self { columns, by_name }
    }

    pub fn global() -> &'static ColumnRegistry {
        &REGISTRY
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }

    pub fn get(&self, name: &str) -> Option<&ColumnSpec> {
        self.by_name.get(name).map(|&i| &self.columns[i])
    }

    /// Resolve a user selection into a sub-sequence of the registry.
    ///
    /// The result always follows registry order, whatever order the names
    /// were given in, so header and rows line up across runs.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<ColumnSpec>, SelectError> {
        if names.is_empty() {
            return Err(SelectError::Empty);
        }
        let mut picked = vec![false; self.columns.len()];
        for name in names {
            let name = name.as_ref().trim();
            let idx = *self
                .by_name
                .get(name)
                .ok_or_else(|| SelectError::Unknown(name.to_string()))?;
            if std::mem::replace(&mut picked[idx], true) {
                return Err(SelectError::Duplicate(name.to_string()));
            }
        }
        Ok(self
            .columns
            .iter()
            .zip(picked)
            .filter_map(|(c, keep)| keep.then_some(*c))
            .collect())
    }
}

// ---- formatting helpers ----

fn text(v: &Option<String>) -> Result<String, ExtractError> {
    Ok(v.clone().unwrap_or_default())
}

fn number(v: &Option<Decimal>) -> Result<String, ExtractError> {
    Ok(v.map(|d| d.normalize().to_string()).unwrap_or_default())
}

fn flag(v: &Option<bool>) -> Result<String, ExtractError> {
    Ok(match v {
        Some(true) => "True".to_string(),
        Some(false) => "False".to_string(),
        None => String::new(),
    })
}

fn date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn time(t: NaiveTime) -> String {
    t.format("%H:%M:%S%.3f").to_string()
}

/// Map an optional venue code through a lookup table. Absent -> empty cell,
/// unknown -> extraction failure.
fn code(
    field: &'static str,
    v: Option<i32>,
    table: fn(i32) -> Option<&'static str>,
) -> Result<String, ExtractError> {
    match v {
        None => Ok(String::new()),
        Some(c) => table(c)
            .map(str::to_string)
            .ok_or(ExtractError::UnknownCode { field, code: c }),
    }
}

// ---- venue code tables ----

fn side_name(c: i32) -> Option<&'static str> {
    Side::from_code(c).map(|s| s.as_str())
}

fn full_partial_name(c: i32) -> Option<&'static str> {
    match c { 1 => Some("Full"), 2 => Some("Partial"), _ => None }
}

fn ord_type_name(c: i32) -> Option<&'static str> {
    match c {
        1 => Some("Market"),
        2 => Some("Limit"),
        3 => Some("Stop"),
        4 => Some("StopLimit"),
        5 => Some("MarketToLimit"),
        _ => None,
    }
}

fn fill_type_name(c: i32) -> Option<&'static str> {
    match c {
        1 => Some("Fill"),
        2 => Some("Block"),
        3 => Some("Cross"),
        4 => Some("Exercise"),
        5 => Some("Assignment"),
        _ => None,
    }
}

fn position_effect_name(c: i32) -> Option<&'static str> {
    match c { 1 => Some("Open"), 2 => Some("Close"), _ => None }
}

fn product_type_name(c: i32) -> Option<&'static str> {
    match c {
        1 => Some("Future"),
        2 => Some("Option"),
        3 => Some("Spread"),
        4 => Some("Stock"),
        5 => Some("Bond"),
        _ => None,
    }
}

fn put_call_name(c: i32) -> Option<&'static str> {
    match c { 0 => Some("Put"), 1 => Some("Call"), _ => None }
}

fn account_type_name(c: i32) -> Option<&'static str> {
    match c {
        1 => Some("Agent"),
        2 => Some("Principal"),
        3 => Some("MarketMaker"),
        4 => Some("GiveUp"),
        _ => None,
    }
}

fn order_origination_name(c: i32) -> Option<&'static str> {
    match c {
        1 => Some("DirectAccess"),
        2 => Some("SponsoredAccess"),
        3 => Some("Other"),
        _ => None,
    }
}

fn trading_capacity_name(c: i32) -> Option<&'static str> {
    match c { 1 => Some("DEAL"), 2 => Some("MTCH"), 3 => Some("AOTC"), _ => None }
}

/// Kolom trade pane, urutan kanonik.
fn trade_pane_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::new("UtcDate", |f| Ok(date(f.utc_date))),
        ColumnSpec::new("UtcTime", |f| Ok(time(f.utc_time))),
        ColumnSpec::new("ExchangeName", |f| text(&f.exchange_name)),
        ColumnSpec::new("ContractName", |f| text(&f.contract_name)),
        ColumnSpec::new("TradeSide", |f| code("TradeSide", f.trade_side, side_name)),
        ColumnSpec::new("FillQty", |f| number(&f.fill_qty)),
        ColumnSpec::new("Price", |f| number(&f.price)),
        ColumnSpec::new("FullPartial", |f| code("FullPartial", f.full_partial, full_partial_name)),
        ColumnSpec::new("OrdType", |f| code("OrdType", f.ord_type, ord_type_name)),
        ColumnSpec::new("Modifier", |f| text(&f.modifier)),
        ColumnSpec::new("Route", |f| text(&f.route)),
        ColumnSpec::new("PositionEffect", |f| {
            code("PositionEffect", f.position_effect, position_effect_name)
        }),
        ColumnSpec::new("Broker", |f| text(&f.broker)),
        ColumnSpec::new("Account", |f| text(&f.account)),
        ColumnSpec::new("AccountType", |f| code("AccountType", f.account_type, account_type_name)),
        ColumnSpec::new("GiveUp", |f| text(&f.give_up)),
        ColumnSpec::new("TextA", |f| text(&f.text_a)),
        ColumnSpec::new("TextB", |f| text(&f.text_b)),
        ColumnSpec::new("TextC", |f| text(&f.text_c)),
        ColumnSpec::new("TextTT", |f| text(&f.text_tt)),
        ColumnSpec::new("Originator", |f| text(&f.originator)),
        ColumnSpec::new("CurrentUser", |f| text(&f.current_user)),
        ColumnSpec::new("ClientOrderID", |f| text(&f.client_order_id)),
        ColumnSpec::new("ParentOrderID", |f| text(&f.parent_order_id)),
        ColumnSpec::new("OmaOrderID", |f| text(&f.oma_order_id)),
        ColumnSpec::new("ExchangeOrderID", |f| text(&f.exchange_order_id)),
        ColumnSpec::new("ExchangeTransactionID", |f| text(&f.exchange_transaction_id)),
        ColumnSpec::new("ExchangeAccount", |f| text(&f.exchange_account)),
        ColumnSpec::new("ExchangeDate", |f| {
            f.exchange_date.map(date).ok_or(ExtractError::Missing("ExchangeDate"))
        }),
        ColumnSpec::new("ExchangeTime", |f| {
            f.exchange_time.map(time).ok_or(ExtractError::Missing("ExchangeTime"))
        }),
        ColumnSpec::new("ManualFill", |f| flag(&f.manual_fill)),
        ColumnSpec::new("Symbol", |f| text(&f.symbol)),
        ColumnSpec::new("ProductType", |f| code("ProductType", f.product_type, product_type_name)),
        ColumnSpec::new("FillType", |f| code("FillType", f.fill_type, fill_type_name)),
        ColumnSpec::new("ExecQty", |f| number(&f.exec_qty)),
        ColumnSpec::new("WorkQty", |f| number(&f.work_qty)),
        ColumnSpec::new("AggressorFlag", |f| flag(&f.aggressor_flag)),
        ColumnSpec::new("ConnectionId", |f| text(&f.connection_id)),
        ColumnSpec::new("PutCall", |f| code("PutCall", f.put_call, put_call_name)),
        ColumnSpec::new("Strike", |f| number(&f.strike)),
        ColumnSpec::new("OrderOrigination", |f| {
            code("OrderOrigination", f.order_origination, order_origination_name)
        }),
        ColumnSpec::new("TradingCapacity", |f| {
            code("TradingCapacity", f.trading_capacity, trading_capacity_name)
        }),
        ColumnSpec::new("LiquidityProvision", |f| flag(&f.liquidity_provision)),
        ColumnSpec::new("CommodityDerivativeIndicator", |f| {
            flag(&f.commodity_derivative_indicator)
        }),
        ColumnSpec::new("InvestDec", |f| text(&f.invest_dec)),
        ColumnSpec::new("ExecDec", |f| text(&f.exec_dec)),
        ColumnSpec::new("ClientID", |f| text(&f.client_id)),
        ColumnSpec::new("RecordID", |f| Ok(f.record_id.clone())),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::str::FromStr;

    fn sample() -> FillRecord {
        let mut f = FillRecord::new("R-1", Utc.with_ymd_and_hms(2024, 3, 8, 14, 30, 5).unwrap());
        f.trade_side = Some(2);
        f.price = Some(Decimal::from_str("4512.2500").unwrap());
        f.fill_qty = Some(Decimal::from(3));
        f.exchange_name = Some("CME".into());
        f.manual_fill = Some(false);
        f
    }

    #[test]
    fn registry_has_canonical_order() {
        let names: Vec<_> = ColumnRegistry::global().names().collect();
        assert_eq!(names.len(), 48);
        assert_eq!(&names[..3], &["UtcDate", "UtcTime", "ExchangeName"]);
        assert_eq!(names.last(), Some(&"RecordID"));
    }

    #[test]
    fn registry_names_are_unique() {
        let reg = ColumnRegistry::global();
        for name in reg.names() {
            assert_eq!(reg.get(name).map(|c| c.name), Some(name));
        }
    }

    #[test]
    fn select_follows_registry_order() {
        let cols = ColumnRegistry::global().select(&["Price", "UtcDate", "TradeSide"]).unwrap();
        let names: Vec<_> = cols.iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["UtcDate", "TradeSide", "Price"]);
    }

    #[test]
    fn select_rejects_unknown_duplicate_and_empty() {
        let reg = ColumnRegistry::global();
        assert_eq!(reg.select(&["Nope"]).unwrap_err(), SelectError::Unknown("Nope".into()));
        assert_eq!(
            reg.select(&["Price", "Price"]).unwrap_err(),
            SelectError::Duplicate("Price".into())
        );
        assert_eq!(reg.select::<&str>(&[]).unwrap_err(), SelectError::Empty);
    }

    #[test]
    fn extracts_display_values() {
        let reg = ColumnRegistry::global();
        let f = sample();
        let get = |n: &str| reg.get(n).unwrap().display(&f);
        assert_eq!(get("UtcDate").unwrap(), "2024-03-08");
        assert_eq!(get("UtcTime").unwrap(), "14:30:05.000");
        assert_eq!(get("TradeSide").unwrap(), "Sell");
        assert_eq!(get("Price").unwrap(), "4512.25");
        assert_eq!(get("FillQty").unwrap(), "3");
        assert_eq!(get("ManualFill").unwrap(), "False");
        assert_eq!(get("Account").unwrap(), "");
        assert_eq!(get("RecordID").unwrap(), "R-1");
    }

    #[test]
    fn unknown_code_and_missing_exchange_time_fail() {
        let reg = ColumnRegistry::global();
        let mut f = sample();
        f.ord_type = Some(42);
        assert_eq!(
            reg.get("OrdType").unwrap().display(&f),
            Err(ExtractError::UnknownCode { field: "OrdType", code: 42 })
        );
        assert_eq!(
            reg.get("ExchangeTime").unwrap().display(&f),
            Err(ExtractError::Missing("ExchangeTime"))
        );
    }
}
