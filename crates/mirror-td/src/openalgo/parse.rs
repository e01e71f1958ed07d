//! Response body decoding.
//!
//! Brokers behind the gateway disagree on number encoding (`"101.5"` vs
//! `101.5`) and on some field names, so decoding is done field by field
//! over `serde_json::Value`.

use chrono::{DateTime, NaiveDateTime};
use mirror_core::types::{BrokerOrderStatus, Candle, Funds, OrderRecord, PingInfo, QuoteSnapshot};
use mirror_md::json_util::{f64_or_zero, parse_f64_field, parse_str_f64};
use serde_json::Value;

use crate::BrokerError;

/// `Ok(body)` for `status: success`, else the broker's message.
///
/// `http_status` decides the error class: 401/403 is an auth failure, 5xx
/// is transient, anything else is a rejection.
pub fn check_envelope(body: Value, http_status: u16) -> Result<Value, BrokerError> {
    if body.get("status").and_then(|s| s.as_str()) == Some("success") && http_status < 400 {
        return Ok(body);
    }
    let message = body
        .get("message")
        .or_else(|| body.get("error"))
        .and_then(|m| m.as_str())
        .unwrap_or("unknown broker error")
        .to_string();
    Err(match http_status {
        401 | 403 => BrokerError::Auth(message),
        s if s >= 500 => BrokerError::Transport(format!("HTTP {s}: {message}")),
        _ => BrokerError::Rejected(message),
    })
}

fn data(body: &Value) -> Result<&Value, BrokerError> {
    body.get("data").ok_or_else(|| BrokerError::Parse("missing 'data'".into()))
}

fn str_of(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match v.get(*k)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

pub fn parse_ping(body: &Value) -> Result<PingInfo, BrokerError> {
    let d = data(body)?;
    Ok(PingInfo {
        broker: str_of(d, &["broker"]).unwrap_or_default(),
        message: str_of(d, &["message"]).unwrap_or_default(),
    })
}

pub fn parse_funds(body: &Value) -> Result<Funds, BrokerError> {
    let d = data(body)?;
    Ok(Funds {
        available_cash: f64_or_zero(d, "availablecash"),
        collateral: f64_or_zero(d, "collateral"),
        utilised_debits: f64_or_zero(d, "utiliseddebits"),
        m2m_realized: f64_or_zero(d, "m2mrealized"),
        m2m_unrealized: f64_or_zero(d, "m2munrealized"),
    })
}

pub fn parse_order_id(body: &Value) -> Result<String, BrokerError> {
    str_of(body, &["orderid"])
        .or_else(|| body.get("data").and_then(|d| str_of(d, &["orderid"])))
        .ok_or_else(|| BrokerError::Parse("placeorder response without orderid".into()))
}

pub fn parse_order_book(body: &Value) -> Result<Vec<OrderRecord>, BrokerError> {
    let d = data(body)?;
    let orders = d
        .get("orders")
        .or(Some(d))
        .and_then(|o| o.as_array())
        .ok_or_else(|| BrokerError::Parse("orderbook without orders".into()))?;

    Ok(orders
        .iter()
        .filter_map(|o| {
            let order_id = str_of(o, &["orderid", "order_id"])?;
            let status = str_of(o, &["order_status", "status"]).unwrap_or_default();
            let average_price = parse_f64_field(o, "average_price")
                .or_else(|| parse_f64_field(o, "averageprice"))
                .filter(|p| *p > 0.0);
            Some(OrderRecord {
                order_id,
                symbol: str_of(o, &["symbol"]).unwrap_or_default(),
                status: BrokerOrderStatus::parse(&status),
                quantity: parse_f64_field(o, "quantity").unwrap_or(0.0).max(0.0) as u32,
                average_price,
                reason: str_of(o, &["rejection_reason", "rejectreason", "reason", "message"]),
            })
        })
        .collect())
}

pub fn parse_quote(body: &Value) -> Result<QuoteSnapshot, BrokerError> {
    let d = data(body)?;
    Ok(QuoteSnapshot {
        ltp: f64_or_zero(d, "ltp"),
        bid: f64_or_zero(d, "bid"),
        ask: f64_or_zero(d, "ask"),
        open: f64_or_zero(d, "open"),
        high: f64_or_zero(d, "high"),
        low: f64_or_zero(d, "low"),
        prev_close: f64_or_zero(d, "prev_close"),
        volume: f64_or_zero(d, "volume"),
        open_interest: parse_f64_field(d, "oi").unwrap_or(0.0),
    })
}

/// Bars from `data: [{timestamp, open, high, low, close, volume}]`.
///
/// Timestamps may be epoch seconds, epoch millis, RFC 3339 or
/// `YYYY-MM-DD HH:MM:SS`. Bars without OHLC are skipped; the result is
/// sorted oldest first.
pub fn parse_candles(body: &Value) -> Result<Vec<Candle>, BrokerError> {
    let rows = data(body)?
        .as_array()
        .ok_or_else(|| BrokerError::Parse("history data is not an array".into()))?;

    let mut candles: Vec<Candle> = rows
        .iter()
        .filter_map(|r| {
            Some(Candle {
                timestamp: parse_timestamp(r.get("timestamp").or_else(|| r.get("time"))?)?,
                open: parse_f64_field(r, "open")?,
                high: parse_f64_field(r, "high")?,
                low: parse_f64_field(r, "low")?,
                close: parse_f64_field(r, "close")?,
                volume: f64_or_zero(r, "volume"),
            })
        })
        .collect();
    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

fn parse_timestamp(v: &Value) -> Option<i64> {
    if let Some(s) = v.as_str() {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.timestamp());
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
            return Some(dt.and_utc().timestamp());
        }
    }
    let n = parse_str_f64(Some(v))? as i64;
    // Millisecond epochs are 13 digits.
    Some(if n > 100_000_000_000 { n / 1000 } else { n })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_classification() {
        assert!(check_envelope(json!({"status": "success", "data": {}}), 200).is_ok());
        assert_eq!(
            check_envelope(json!({"status": "error", "message": "Insufficient funds"}), 400),
            Err(BrokerError::Rejected("Insufficient funds".into()))
        );
        assert_eq!(
            check_envelope(json!({"status": "error", "message": "Invalid openalgo apikey"}), 403),
            Err(BrokerError::Auth("Invalid openalgo apikey".into()))
        );
        assert!(matches!(check_envelope(json!({}), 502), Err(BrokerError::Transport(_))));
    }

    #[test]
    fn funds_from_strings() {
        let body = json!({"status": "success", "data": {
            "availablecash": "150000.50", "collateral": "50000", "utiliseddebits": "20000.50",
            "m2mrealized": "0", "m2munrealized": "-1200"
        }});
        let funds = parse_funds(&body).unwrap();
        assert_eq!(funds.available_margin(), 180000.0);
        assert_eq!(funds.m2m_unrealized, -1200.0);
    }

    #[test]
    fn order_id_top_level_or_nested() {
        assert_eq!(parse_order_id(&json!({"status": "success", "orderid": "2510190001"})).unwrap(), "2510190001");
        assert_eq!(parse_order_id(&json!({"status": "success", "data": {"orderid": 42}})).unwrap(), "42");
        assert!(parse_order_id(&json!({"status": "success"})).is_err());
    }

    #[test]
    fn order_book_rows() {
        let body = json!({"status": "success", "data": {"orders": [
            {"orderid": "1", "symbol": "NIFTY28OCT2625000CE", "order_status": "complete",
             "quantity": "75", "average_price": "101.25"},
            {"orderid": "2", "symbol": "NIFTY28OCT2625000PE", "order_status": "rejected",
             "quantity": 75, "average_price": 0, "rejection_reason": "RMS: margin exceeds"},
            {"symbol": "no id"}
        ]}});
        let book = parse_order_book(&body).unwrap();
        assert_eq!(book.len(), 2);
        assert_eq!(book[0].status, BrokerOrderStatus::Complete);
        assert_eq!(book[0].average_price, Some(101.25));
        assert_eq!(book[0].quantity, 75);
        assert_eq!(book[1].status, BrokerOrderStatus::Rejected);
        assert_eq!(book[1].average_price, None);
        assert_eq!(book[1].reason.as_deref(), Some("RMS: margin exceeds"));
    }

    #[test]
    fn candles_sorted_with_mixed_timestamps() {
        let body = json!({"status": "success", "data": [
            {"timestamp": 1760846400000i64, "open": 10, "high": 12, "low": 9, "close": 11, "volume": 100},
            {"timestamp": "2025-10-19T03:00:00Z", "open": 1, "high": 2, "low": 0.5, "close": 1.5},
            {"timestamp": 1760846100, "open": "9", "high": "10", "low": "8", "close": "9.5"},
            {"timestamp": 1, "open": 1}
        ]});
        let bars = parse_candles(&body).unwrap();
        assert_eq!(bars.len(), 3);
        assert!(bars.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(bars[2].timestamp, 1760846400);
    }
}
