//! Source configuration maps and scalar parsing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value as Json;

use rill_common::{Result, RillError, Value};

/// String-keyed configuration of one source instance.
pub type Options = HashMap<String, Json>;

/// Required string option.
pub fn get_string(options: &Options, key: &str) -> Result<String> {
    match options.get(key) {
        Some(Json::String(s)) => Ok(s.clone()),
        Some(other) => Err(RillError::InvalidConfig(format!(
            "option {key} must be a string, got {other}"
        ))),
        None => Err(RillError::InvalidConfig(format!("missing option: {key}"))),
    }
}

/// String option with a default.
pub fn get_string_or(options: &Options, key: &str, default: &str) -> Result<String> {
    match options.get(key) {
        None => Ok(default.to_string()),
        Some(_) => get_string(options, key),
    }
}

/// Integer option with a default.
pub fn get_int_or(options: &Options, key: &str, default: i64) -> Result<i64> {
    match options.get(key) {
        None => Ok(default),
        Some(Json::Number(n)) => n.as_i64().ok_or_else(|| {
            RillError::InvalidConfig(format!("option {key} must be an integer, got {n}"))
        }),
        Some(other) => Err(RillError::InvalidConfig(format!(
            "option {key} must be an integer, got {other}"
        ))),
    }
}

/// Boolean option with a default.
pub fn get_bool_or(options: &Options, key: &str, default: bool) -> Result<bool> {
    match options.get(key) {
        None => Ok(default),
        Some(Json::Bool(b)) => Ok(*b),
        Some(other) => Err(RillError::InvalidConfig(format!(
            "option {key} must be a boolean, got {other}"
        ))),
    }
}

/// String list option, defaulting to empty.
pub fn get_string_list(options: &Options, key: &str) -> Result<Vec<String>> {
    match options.get(key) {
        None => Ok(vec![]),
        Some(Json::Array(items)) => items
            .iter()
            .map(|item| match item {
                Json::String(s) => Ok(s.clone()),
                other => Err(RillError::InvalidConfig(format!(
                    "option {key} must be a list of strings, got {other}"
                ))),
            })
            .collect(),
        Some(other) => Err(RillError::InvalidConfig(format!(
            "option {key} must be a list of strings, got {other}"
        ))),
    }
}

/// `host:port` option with a default.
pub fn get_address_or(options: &Options, key: &str, default: (&str, u16)) -> Result<(String, u16)> {
    let raw = get_string_or(options, key, &format!("{}:{}", default.0, default.1))?;
    let (host, port) = raw.rsplit_once(':').ok_or_else(|| {
        RillError::InvalidConfig(format!("option {key} must look like host:port, got {raw}"))
    })?;
    let port: u16 = port.parse().map_err(|_| {
        RillError::InvalidConfig(format!("option {key} has an invalid port: {raw}"))
    })?;
    Ok((host.to_string(), port))
}

/// Parse a scalar string the way sources ingest untyped text.
///
/// Ordered attempts: int, float, bool, RFC3339 timestamp, and finally the
/// string itself.
pub fn parse_scalar(raw: &str) -> Value {
    if let Ok(v) = raw.parse::<i64>() {
        return Value::Int(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return Value::Float(v);
    }
    if let Ok(v) = raw.parse::<bool>() {
        return Value::Boolean(v);
    }
    if let Ok(v) = DateTime::parse_from_rfc3339(raw) {
        return Value::Timestamp(v.with_timezone(&Utc));
    }
    Value::String(raw.to_string())
}

/// The type covering every possible [`parse_scalar`] outcome.
pub fn scalar_type() -> rill_common::Type {
    rill_common::Type::Union(vec![
        rill_common::Type::Int,
        rill_common::Type::Float,
        rill_common::Type::Boolean,
        rill_common::Type::Timestamp,
        rill_common::Type::String,
    ])
}
