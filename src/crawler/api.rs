//! Upstream payload handling
//!
//! Turns one HTTP response into a classification the fetcher can act on, and
//! normalizes raw item objects into [`ItemRecord`]s.

use crate::proxy::ProxyErrorKind;
use crate::storage::ItemRecord;
use serde::Deserialize;
use serde_json::Value;

/// Marker the API puts in `msg` when the session cookie is missing or stale
const LOGIN_REQUIRED: &str = "Login Required";

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<Value>,
    #[serde(default)]
    data: Option<ApiData>,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    // null and missing both mean "no items"
    #[serde(default)]
    items: Option<Vec<Value>>,
}

/// How one response should be treated
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResponseClass {
    Items(Vec<ItemRecord>),
    AuthRequired(String),
    RateLimited,
    Failed {
        reason: String,
        kind: ProxyErrorKind,
    },
}

/// Classifies an HTTP status and body
pub(crate) fn classify_response(status: u16, body: &str) -> ResponseClass {
    if status == 429 {
        return ResponseClass::RateLimited;
    }

    if !(200..300).contains(&status) {
        return ResponseClass::Failed {
            reason: format!("HTTP {}", status),
            kind: ProxyErrorKind::Status(status),
        };
    }

    let envelope: ApiEnvelope = match serde_json::from_str(body) {
        Ok(e) => e,
        Err(e) => {
            return ResponseClass::Failed {
                reason: format!("Invalid payload: {}", e),
                kind: ProxyErrorKind::Other,
            }
        }
    };

    let code = envelope.code.unwrap_or_default();
    if code != "OK" {
        let msg = match envelope.msg {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        if msg.contains(LOGIN_REQUIRED) {
            return ResponseClass::AuthRequired(msg);
        }
        if is_rate_limit_signal(&code, &msg) {
            return ResponseClass::RateLimited;
        }
        return ResponseClass::Failed {
            reason: format!("API returned {}: {}", code, msg),
            kind: ProxyErrorKind::Other,
        };
    }

    let raw_items = envelope.data.and_then(|d| d.items).unwrap_or_default();
    let total = raw_items.len();
    let items: Vec<ItemRecord> = raw_items.iter().filter_map(normalize_item).collect();
    if items.len() < total {
        tracing::warn!("Skipped {} items without a usable id", total - items.len());
    }

    ResponseClass::Items(items)
}

fn is_rate_limit_signal(code: &str, msg: &str) -> bool {
    let code = code.to_ascii_lowercase();
    let msg = msg.to_ascii_lowercase();
    code == "429"
        || code.contains("too_many_requests")
        || code.contains("rate_limit")
        || msg.contains("too many requests")
}

/// Converts one upstream item object into a record
///
/// Returns `None` when the object has no usable id.
pub fn normalize_item(raw: &Value) -> Option<ItemRecord> {
    let id = as_i64(raw.get("id")?)?;

    let goods_info = match raw.get("goods_info") {
        Some(Value::Null) | None => Value::Object(Default::default()),
        Some(v) => v.clone(),
    };

    Some(ItemRecord {
        id,
        appid: field_i64(raw, "appid"),
        game: field_string(raw, "game"),
        name: field_string(raw, "name"),
        market_hash_name: field_string(raw, "market_hash_name"),
        steam_market_url: field_string(raw, "steam_market_url"),
        sell_reference_price: field_f64(raw, "sell_reference_price"),
        sell_min_price: field_f64(raw, "sell_min_price"),
        buy_max_price: field_f64(raw, "buy_max_price"),
        sell_num: field_i64(raw, "sell_num"),
        buy_num: field_i64(raw, "buy_num"),
        transacted_num: field_i64(raw, "transacted_num"),
        goods_info,
    })
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Non-finite prices ("NaN", "inf") are treated as missing
fn as_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

fn field_i64(raw: &Value, key: &str) -> i64 {
    raw.get(key).and_then(as_i64).unwrap_or(0)
}

fn field_f64(raw: &Value, key: &str) -> f64 {
    raw.get(key).and_then(as_f64).unwrap_or(0.0)
}

fn field_string(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(Value::as_str).map(str::to_string)
}
