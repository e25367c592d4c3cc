//! Pseudo-type coercion for `$reql_type$`-tagged values.
//!
//! The server encodes times, binary blobs, and grouped data as tagged
//! JSON objects. Depending on the configured format, each is either left
//! raw or converted to a native representation before a batch is stored
//! in a cursor.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DriverError, Result};

const REQL_TYPE: &str = "$reql_type$";

/// Whether a pseudo-type is converted or passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Native,
    Raw,
}

/// Per-query format selection for the three convertible pseudo-types.
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub time_format: Format,
    pub group_format: Format,
    pub binary_format: Format,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            time_format: Format::Native,
            group_format: Format::Native,
            binary_format: Format::Native,
        }
    }
}

impl FormatOptions {
    pub fn from_run_options(opts: &crate::config::RunOptions) -> Self {
        let defaults = FormatOptions::default();
        FormatOptions {
            time_format: opts.time_format.unwrap_or(defaults.time_format),
            group_format: opts.group_format.unwrap_or(defaults.group_format),
            binary_format: opts.binary_format.unwrap_or(defaults.binary_format),
        }
    }
}

/// Converts a result batch, recursing through arrays and objects.
pub fn native_types(batch: Vec<Value>, opts: &FormatOptions) -> Result<Vec<Value>> {
    batch
        .into_iter()
        .map(|value| convert_value(value, opts))
        .collect()
}

fn convert_value(value: Value, opts: &FormatOptions) -> Result<Value> {
    match value {
        Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(|item| convert_value(item, opts))
                .collect::<Result<Vec<_>>>()?,
        )),
        Value::Object(map) => match map.get(REQL_TYPE).and_then(Value::as_str) {
            Some("TIME") if opts.time_format == Format::Native => convert_time(&map),
            Some("BINARY") if opts.binary_format == Format::Native => convert_binary(&map),
            Some("GROUPED_DATA") if opts.group_format == Format::Native => {
                convert_grouped(map, opts)
            }
            _ => {
                let mut out = Map::with_capacity(map.len());
                for (key, val) in map {
                    out.insert(key, convert_value(val, opts)?);
                }
                Ok(Value::Object(out))
            }
        },
        other => Ok(other),
    }
}

/// TIME carries `epoch_time` (seconds, fractional) and a `timezone`
/// offset such as `+05:30`. Native form is an RFC 3339 string.
fn convert_time(map: &Map<String, Value>) -> Result<Value> {
    let epoch = map
        .get("epoch_time")
        .and_then(Value::as_f64)
        .ok_or_else(|| DriverError::protocol("TIME value is missing epoch_time"))?;
    let secs = epoch.floor() as i64;
    let nanos = ((epoch - epoch.floor()) * 1e9).round() as u32;
    let utc: DateTime<Utc> = Utc
        .timestamp_opt(secs, nanos)
        .single()
        .ok_or_else(|| DriverError::protocol("TIME epoch_time is out of range"))?;
    let rendered = match map.get("timezone").and_then(Value::as_str) {
        Some(tz) => {
            let offset: FixedOffset = tz
                .parse()
                .map_err(|_| DriverError::protocol(format!("invalid TIME timezone: {}", tz)))?;
            utc.with_timezone(&offset).to_rfc3339()
        }
        None => utc.to_rfc3339(),
    };
    Ok(Value::String(rendered))
}

/// BINARY carries base64 `data`; native form is an array of bytes.
fn convert_binary(map: &Map<String, Value>) -> Result<Value> {
    let data = map
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| DriverError::protocol("BINARY value is missing data"))?;
    let bytes = BASE64
        .decode(data)
        .map_err(|e| DriverError::protocol(format!("invalid BINARY data: {}", e)))?;
    Ok(Value::Array(
        bytes.into_iter().map(|b| Value::from(b as u64)).collect(),
    ))
}

/// GROUPED_DATA carries `data` as `[group, reduction]` pairs; native form
/// is an array of `{group, reduction}` objects.
fn convert_grouped(mut map: Map<String, Value>, opts: &FormatOptions) -> Result<Value> {
    let data = match map.remove("data") {
        Some(Value::Array(pairs)) => pairs,
        _ => return Err(DriverError::protocol("GROUPED_DATA value is missing data")),
    };
    let mut groups = Vec::with_capacity(data.len());
    for pair in data {
        match pair {
            Value::Array(mut parts) if parts.len() == 2 => {
                let reduction = convert_value(parts.pop().unwrap_or(Value::Null), opts)?;
                let group = convert_value(parts.pop().unwrap_or(Value::Null), opts)?;
                let mut entry = Map::with_capacity(2);
                entry.insert("group".to_string(), group);
                entry.insert("reduction".to_string(), reduction);
                groups.push(Value::Object(entry));
            }
            _ => return Err(DriverError::protocol("malformed GROUPED_DATA pair")),
        }
    }
    Ok(Value::Array(groups))
}
