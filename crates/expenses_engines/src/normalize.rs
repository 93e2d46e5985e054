#![forbid(unsafe_code)]

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use expenses_contracts::receipt::{ExtractedTransaction, LineItem};
use rust_decimal::Decimal;
use serde_json::{Map, Value};

const FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed extraction: {reason}")]
pub struct MalformedExtraction {
    pub reason: String,
}

impl MalformedExtraction {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Normalizer output. `text` is what the caller receives, whether or not `parsed` is `Ok`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedExtraction {
    pub text: String,
    pub parsed: Result<ExtractedTransaction, MalformedExtraction>,
}

pub fn normalize_extraction(raw: &str) -> NormalizedExtraction {
    let text = strip_code_fences(raw);
    let parsed = parse_transaction(&text);
    NormalizedExtraction { text, parsed }
}

/// Removes the code fence pair (and an optional language tag after the opening fence)
/// plus surrounding whitespace. Text outside the fences is dropped.
pub fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(open) = trimmed.find(FENCE) else {
        return trimmed.to_string();
    };
    let before = &trimmed[..open];
    let after = &trimmed[open + FENCE.len()..];
    let inner = match after.rfind(FENCE) {
        Some(close) => skip_language_tag(&after[..close]),
        // A lone fence with content after it opens a block that was never closed.
        None if !after.trim().is_empty() => skip_language_tag(after),
        None => before,
    };
    inner.trim().to_string()
}

fn skip_language_tag(s: &str) -> &str {
    match s.find('\n') {
        Some(i) if is_language_tag(&s[..i]) => &s[i + 1..],
        Some(_) => s,
        None => s.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
    }
}

fn is_language_tag(line: &str) -> bool {
    line.trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+'))
}

/// Accepts both the nested shape the extraction instruction asks for and a flat
/// object. Missing or unusable fields become empty/zero; only a non-object fails.
pub fn parse_transaction(text: &str) -> Result<ExtractedTransaction, MalformedExtraction> {
    if text.trim().is_empty() {
        return Err(MalformedExtraction::new("empty text"));
    }
    let value: Value = serde_json::from_str(text)
        .map_err(|e| MalformedExtraction::new(format!("invalid JSON: {e}")))?;
    let root = value
        .as_object()
        .ok_or_else(|| MalformedExtraction::new("top-level value is not an object"))?;

    let merchant = root.get("merchant_details").and_then(Value::as_object);
    let details = root.get("transaction_details").and_then(Value::as_object);
    let mut detail_scopes: Vec<&Map<String, Value>> = Vec::with_capacity(2);
    if let Some(details) = details {
        detail_scopes.push(details);
    }
    detail_scopes.push(root);

    let merchant_name = merchant
        .and_then(|m| m.get("name"))
        .map(text_of)
        .filter(|s| !s.is_empty())
        .or_else(|| pick(&[root], &["merchant_name", "merchant"]).map(text_of))
        .unwrap_or_default();

    let line_items = pick(&[root], &["items", "line_items"])
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(line_item_of).collect())
        .unwrap_or_default();

    Ok(ExtractedTransaction {
        transaction_id: pick(&[root], &["transaction_id"])
            .map(text_of)
            .unwrap_or_default(),
        merchant_name,
        transaction_datetime: pick(
            &detail_scopes,
            &["date_and_time", "transaction_datetime", "date"],
        )
        .and_then(datetime_of),
        payment_method: pick(&detail_scopes, &["payment_method"])
            .map(text_of)
            .unwrap_or_default(),
        total_amount: pick(&detail_scopes, &["total_amount", "total"]).and_then(decimal_of),
        currency: pick(&detail_scopes, &["currency"])
            .map(text_of)
            .unwrap_or_default(),
        line_items,
        spending_category: pick(&[root], &["spending_category"])
            .map(text_of)
            .unwrap_or_default(),
    })
}

/// First non-null value for any key, searching scopes in order.
fn pick<'a>(scopes: &[&'a Map<String, Value>], keys: &[&str]) -> Option<&'a Value> {
    scopes.iter().find_map(|scope| {
        keys.iter()
            .find_map(|key| scope.get(*key).filter(|v| !v.is_null()))
    })
}

fn line_item_of(value: &Value) -> Option<LineItem> {
    let item = value.as_object()?;
    let scopes = [item];
    Some(LineItem {
        name: pick(&scopes, &["item_name", "name"])
            .map(text_of)
            .unwrap_or_default(),
        unit_price: pick(&scopes, &["price", "unit_price"])
            .and_then(decimal_of)
            .unwrap_or_default(),
        quantity: pick(&scopes, &["quantity", "qty"])
            .map(quantity_of)
            .unwrap_or(0),
        category: pick(&scopes, &["category"])
            .map(text_of)
            .unwrap_or_default(),
    })
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

fn decimal_of(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let raw = n.to_string();
            Decimal::from_str(&raw)
                .or_else(|_| Decimal::from_scientific(&raw))
                .ok()
        }
        Value::String(s) => amount_text(s).and_then(|raw| Decimal::from_str(&raw).ok()),
        _ => None,
    }
}

/// Rewrites a receipt amount such as `$1,204.10`, `12,50 €` or `1.234,56` into plain
/// decimal notation. The last separator is the decimal mark when the other separator
/// forms valid thousands groups; a lone comma is a decimal mark only with one or two
/// digits after it. Anything ambiguous is `None`.
fn amount_text(s: &str) -> Option<String> {
    let s = s
        .trim()
        .trim_start_matches(|c: char| !(c.is_ascii_digit() || matches!(c, '-' | '.' | ',')))
        .trim_end_matches(|c: char| !c.is_ascii_digit());
    let (sign, body) = match s.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", s),
    };
    if body.is_empty() || !body.chars().all(|c| c.is_ascii_digit() || c == ',' || c == '.') {
        return None;
    }

    let (decimal_mark, group_mark) = match (body.rfind(','), body.rfind('.')) {
        (None, None) => return Some(format!("{sign}{body}")),
        (Some(comma), Some(dot)) if comma > dot => (',', '.'),
        (Some(_), Some(_)) | (None, Some(_)) => ('.', ','),
        (Some(comma), None) => {
            let fraction_len = body.len() - comma - 1;
            if body.matches(',').count() == 1 && (1..=2).contains(&fraction_len) {
                (',', '.')
            } else {
                ('.', ',')
            }
        }
    };
    let (int_part, fraction) = match body.rfind(decimal_mark) {
        Some(i) => (&body[..i], Some(&body[i + 1..])),
        None => (body, None),
    };
    if int_part.contains(decimal_mark) {
        return None;
    }
    let int_digits = if int_part.contains(group_mark) {
        let groups: Vec<&str> = int_part.split(group_mark).collect();
        let leading_ok = (1..=3).contains(&groups[0].len());
        if !leading_ok || groups[1..].iter().any(|g| g.len() != 3) {
            return None;
        }
        groups.concat()
    } else {
        int_part.to_string()
    };
    let int_digits = if int_digits.is_empty() {
        "0".to_string()
    } else {
        int_digits
    };
    match fraction {
        Some(f) if f.is_empty() || f.contains(group_mark) => None,
        Some(f) => Some(format!("{sign}{int_digits}.{f}")),
        None => Some(format!("{sign}{int_digits}")),
    }
}

fn quantity_of(value: &Value) -> u32 {
    let n = match value {
        Value::Number(n) => n
            .as_u64()
            .map(|v| v as f64)
            .or_else(|| n.as_f64())
            .unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if n.is_finite() && n > 0.0 {
        n.round().min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

fn datetime_of(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    tracing::debug!("unrecognized transaction datetime format, leaving empty");
    None
}
