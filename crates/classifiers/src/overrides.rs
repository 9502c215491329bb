//! `key=value` overrides applied to a loaded [`TrainingConfig`].

use std::str::FromStr;

use serde_json::{Map, Number, Value};
use training::{Result, TrainingConfig, TrainingError};

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOverride {
    pub path: String,
    pub value: String,
}

impl FromStr for ConfigOverride {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

/// Rewrites `config` through its JSON form so every field is reachable by a
/// dotted path such as `model.hyper.lr`.
pub fn apply_overrides(
    config: TrainingConfig,
    overrides: &[ConfigOverride],
) -> Result<TrainingConfig> {
    let mut value = serde_json::to_value(config)?;
    for item in overrides {
        let segments: Vec<&str> = item.path.split('.').map(str::trim).collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(TrainingError::configuration(
                item.path.clone(),
                "override path has an empty segment",
            ));
        }
        assign(&mut value, &segments, parse_value(&item.value), &item.path)?;
    }
    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!("config is invalid after overrides: {err}"))
    })
}

fn parse_value(raw: &str) -> Value {
    match raw {
        _ if raw.eq_ignore_ascii_case("true") => return Value::Bool(true),
        _ if raw.eq_ignore_ascii_case("false") => return Value::Bool(false),
        _ if raw.eq_ignore_ascii_case("null") => return Value::Null,
        _ => {}
    }
    if let Ok(int_val) = raw.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = raw.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if raw.starts_with('[') || raw.starts_with('{') {
        if let Ok(json) = serde_json::from_str::<Value>(raw) {
            return json;
        }
    }
    Value::String(raw.to_string())
}

fn assign(target: &mut Value, segments: &[&str], new_value: Value, path: &str) -> Result<()> {
    let Some((head, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };
    if target.is_null() {
        *target = Value::Object(Map::new());
    }
    let map = target.as_object_mut().ok_or_else(|| {
        TrainingError::configuration(
            path.to_string(),
            format!("segment '{}' does not point into a table", head),
        )
    })?;
    let entry = map.entry(head.to_string()).or_insert(Value::Null);
    assign(entry, rest, new_value, path)
}
