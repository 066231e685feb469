//! Typed form of a stored config entry, derived at rebuild time

use crate::matcher::expr::Program;
use crate::store::{ConfigEntry, ValueType};
use serde_json::{Number, Value};

/// Value of a config after parsing its raw string
#[derive(Debug, Clone)]
pub enum ResolvedValue {
    Int(i64),
    Float(f64),
    Str(String),
    /// Compiled code expression
    Code(Program),
    /// Key of the app whose configuration is nested here
    Template(String),
    /// Raw value that could not be parsed for its declared type
    Invalid { raw: String, reason: String },
}

impl ResolvedValue {
    /// Literal JSON value for int/float/string configs
    pub fn literal(&self) -> Option<Value> {
        match self {
            ResolvedValue::Int(i) => Some(Value::from(*i)),
            ResolvedValue::Float(f) => Number::from_f64(*f).map(Value::Number),
            ResolvedValue::Str(s) => Some(Value::String(s.clone())),
            _ => None,
        }
    }
}

/// Read-only config as served to the matching engine
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub key: String,
    pub app_key: String,
    pub k: String,
    pub v_type: ValueType,
    pub value: ResolvedValue,
}

impl ResolvedConfig {
    pub fn from_entry(entry: &ConfigEntry) -> Self {
        Self {
            key: entry.key.clone(),
            app_key: entry.app_key.clone(),
            k: entry.k.clone(),
            v_type: entry.v_type,
            value: parse_value(entry.v_type, &entry.v),
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self.value, ResolvedValue::Invalid { .. })
    }
}

/// Parse a raw value according to its type tag
pub fn parse_value(v_type: ValueType, raw: &str) -> ResolvedValue {
    let invalid = |reason: String| ResolvedValue::Invalid {
        raw: raw.to_string(),
        reason,
    };
    match v_type {
        ValueType::Int => match raw.trim().parse::<i64>() {
            Ok(i) => ResolvedValue::Int(i),
            Err(e) => invalid(format!("invalid int: {}", e)),
        },
        ValueType::Float => match raw.trim().parse::<f64>() {
            Ok(f) if f.is_finite() => ResolvedValue::Float(f),
            Ok(_) => invalid("float must be finite".to_string()),
            Err(e) => invalid(format!("invalid float: {}", e)),
        },
        ValueType::String => ResolvedValue::Str(raw.to_string()),
        ValueType::Code => match Program::compile(raw) {
            Ok(program) => ResolvedValue::Code(program),
            Err(e) => invalid(e.to_string()),
        },
        ValueType::Template => {
            let target = raw.trim();
            if target.is_empty() {
                invalid("template must name an app key".to_string())
            } else {
                ResolvedValue::Template(target.to_string())
            }
        }
    }
}
