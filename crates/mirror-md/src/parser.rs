//! Streaming message classifier.
//!
//! Turns one inbound text frame into a [`Parsed`] outcome:
//!
//! - `{"type":"market_data", "mode": 1|2|3, "data": {...}}` → price / quote / depth
//! - `{"type":"auth" | "subscribe" | "unsubscribe" | "pong", ...}` → control frame
//! - untyped frames carrying `ltp` or `symbol` → classified by payload keys
//!   (`bids`/`asks`/`depth` → depth, `open`/`high`/`low` → quote, else price)
//!
//! Anything else is [`Parsed::Unrecognized`] and is dropped by the pipeline.

use mirror_core::types::{DepthUpdate, MarketEvent, Mode, PriceUpdate, QuoteUpdate};
use serde_json::Value;

use crate::json_util::{f64_or_zero, parse_f64_field, parse_levels};

/// Exchange assumed when a frame omits it.
pub const DEFAULT_EXCHANGE: &str = "NFO";

/// Control frame types that carry no market data.
const CONTROL_TYPES: &[&str] = &["auth", "subscribe", "unsubscribe", "pong", "ping", "error"];

/// Outcome of classifying one frame.
#[derive(Debug, Clone)]
pub enum Parsed {
    Event(MarketEvent),
    /// Acknowledgement / keep-alive frame; the payload is the `type` value.
    Control(String),
    /// Not market data and not a known control frame.
    Unrecognized(String),
}

/// Classify a raw frame. `recv_ms` is stamped on the produced event.
pub fn parse_message(text: &str, recv_ms: u64) -> Parsed {
    let v: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Parsed::Unrecognized(format!("invalid json: {e}")),
    };
    if !v.is_object() {
        return Parsed::Unrecognized("not a json object".into());
    }

    match v.get("type").and_then(|t| t.as_str()) {
        Some("market_data") => parse_market_data(&v, recv_ms),
        Some(t) if CONTROL_TYPES.contains(&t) => Parsed::Control(t.to_string()),
        _ if v.get("ltp").is_some() || v.get("symbol").is_some() => {
            let mode = mode_from_keys(&v);
            build_event(&v, &v, mode, recv_ms)
        }
        Some(t) => Parsed::Unrecognized(format!("unknown message type '{t}'")),
        None => Parsed::Unrecognized("message without type or symbol".into()),
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

fn parse_market_data(root: &Value, recv_ms: u64) -> Parsed {
    // Payload is nested under `data`; some adapters flatten it into the root.
    let data = root.get("data").filter(|d| d.is_object()).unwrap_or(root);
    let code = root
        .get("mode")
        .or_else(|| data.get("mode"))
        .and_then(|m| m.as_u64());
    let mode = code.and_then(Mode::from_code).unwrap_or_else(|| mode_from_keys(data));
    build_event(root, data, mode, recv_ms)
}

/// Fallback classification for frames without a usable mode code.
fn mode_from_keys(data: &Value) -> Mode {
    if ["bids", "asks", "depth"].iter().any(|k| data.get(*k).is_some()) {
        Mode::Depth
    } else if ["open", "high", "low"].iter().any(|k| data.get(*k).is_some()) {
        Mode::Quote
    } else {
        Mode::Price
    }
}

fn str_field<'a>(root: &'a Value, data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key)
        .and_then(|s| s.as_str())
        .or_else(|| root.get(key).and_then(|s| s.as_str()))
        .filter(|s| !s.is_empty())
}

fn build_event(root: &Value, data: &Value, mode: Mode, recv_ms: u64) -> Parsed {
    let Some(symbol) = str_field(root, data, "symbol") else {
        return Parsed::Unrecognized("market data without symbol".into());
    };
    let symbol = symbol.to_string();
    let exchange = str_field(root, data, "exchange").unwrap_or(DEFAULT_EXCHANGE).to_string();
    let ltp = parse_f64_field(data, "ltp")
        .or_else(|| parse_f64_field(data, "last_price"))
        .unwrap_or(0.0);

    let event = match mode {
        Mode::Price => MarketEvent::Price(PriceUpdate { symbol, exchange, ltp, timestamp_ms: recv_ms }),
        Mode::Quote => MarketEvent::Quote(QuoteUpdate {
            symbol,
            exchange,
            ltp,
            open: f64_or_zero(data, "open"),
            high: f64_or_zero(data, "high"),
            low: f64_or_zero(data, "low"),
            close: parse_f64_field(data, "close")
                .or_else(|| parse_f64_field(data, "prev_close"))
                .unwrap_or(0.0),
            volume: f64_or_zero(data, "volume"),
            bid: parse_f64_field(data, "bid")
                .or_else(|| parse_f64_field(data, "bid_price"))
                .unwrap_or(0.0),
            ask: parse_f64_field(data, "ask")
                .or_else(|| parse_f64_field(data, "ask_price"))
                .unwrap_or(0.0),
            timestamp_ms: recv_ms,
        }),
        Mode::Depth => {
            let depth = data.get("depth");
            let bids = data.get("bids").or_else(|| depth.and_then(|d| d.get("buy")));
            let asks = data.get("asks").or_else(|| depth.and_then(|d| d.get("sell")));
            MarketEvent::Depth(DepthUpdate {
                symbol,
                exchange,
                ltp,
                bids: parse_levels(bids),
                asks: parse_levels(asks),
                volume: f64_or_zero(data, "volume"),
                open_interest: parse_f64_field(data, "oi")
                    .or_else(|| parse_f64_field(data, "open_interest"))
                    .unwrap_or(0.0),
                timestamp_ms: recv_ms,
            })
        }
    };
    Parsed::Event(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(text: &str) -> MarketEvent {
        match parse_message(text, 42) {
            Parsed::Event(e) => e,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn ltp_mode() {
        let e = event(r#"{"type":"market_data","symbol":"NIFTY","exchange":"NSE_INDEX","mode":1,"data":{"ltp":25012.4}}"#);
        match e {
            MarketEvent::Price(p) => {
                assert_eq!(p.symbol, "NIFTY");
                assert_eq!(p.exchange, "NSE_INDEX");
                assert!((p.ltp - 25012.4).abs() < 1e-9);
                assert_eq!(p.timestamp_ms, 42);
            }
            other => panic!("expected price, got {other:?}"),
        }
    }

    #[test]
    fn quote_mode_with_string_numbers() {
        let e = event(
            r#"{"type":"market_data","symbol":"NIFTY","exchange":"NSE_INDEX","mode":2,
                "data":{"ltp":"25010","open":"24950","high":25100,"low":24900,"close":24980,"volume":1200}}"#,
        );
        let MarketEvent::Quote(q) = e else { panic!("expected quote") };
        assert_eq!(q.open, 24950.0);
        assert_eq!(q.high, 25100.0);
        assert_eq!(q.close, 24980.0);
        assert_eq!(q.volume, 1200.0);
    }

    #[test]
    fn depth_mode_and_default_exchange() {
        let e = event(
            r#"{"type":"market_data","symbol":"NIFTY28OCT2625000CE","mode":3,
                "data":{"ltp":101.5,"oi":150000,"depth":{"buy":[{"price":101.0,"quantity":750}],
                "sell":[{"price":102.0,"quantity":300}]}}}"#,
        );
        let MarketEvent::Depth(d) = e else { panic!("expected depth") };
        assert_eq!(d.exchange, DEFAULT_EXCHANGE);
        assert_eq!(d.best_bid().map(|l| l.price), Some(101.0));
        assert_eq!(d.best_ask().map(|l| l.quantity), Some(300.0));
        assert_eq!(d.open_interest, 150000.0);
    }

    #[test]
    fn flattened_payload_classified_by_keys() {
        let e = event(r#"{"symbol":"BANKNIFTY","exchange":"NSE_INDEX","ltp":56000,"bids":[[55999,10]],"asks":[]}"#);
        assert_eq!(e.mode(), Mode::Depth);
        let e = event(r#"{"symbol":"BANKNIFTY","ltp":56000,"high":56100}"#);
        assert_eq!(e.mode(), Mode::Quote);
        let e = event(r#"{"ltp":56000,"symbol":"BANKNIFTY"}"#);
        assert_eq!(e.mode(), Mode::Price);
    }

    #[test]
    fn unknown_mode_code_falls_back_to_keys() {
        let e = event(r#"{"type":"market_data","symbol":"X","mode":9,"data":{"ltp":1,"open":1}}"#);
        assert_eq!(e.mode(), Mode::Quote);
    }

    #[test]
    fn control_and_garbage() {
        assert!(matches!(parse_message(r#"{"type":"auth","status":"success"}"#, 0), Parsed::Control(t) if t == "auth"));
        assert!(matches!(parse_message(r#"{"type":"subscribe","status":"success"}"#, 0), Parsed::Control(_)));
        assert!(matches!(parse_message(r#"{"type":"heartbeat"}"#, 0), Parsed::Unrecognized(_)));
        assert!(matches!(parse_message("not json", 0), Parsed::Unrecognized(_)));
        assert!(matches!(parse_message("[1,2]", 0), Parsed::Unrecognized(_)));
        assert!(matches!(
            parse_message(r#"{"type":"market_data","mode":1,"data":{"ltp":1}}"#, 0),
            Parsed::Unrecognized(_)
        ));
    }
}
