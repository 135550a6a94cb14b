//! Trace events consumed by the engine and synthetic events produced by it.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracepat_state::Value;

/// Fixed-point timestamp: `value * 10^scale` seconds.
///
/// Deserializes from a bare integer (nanoseconds) or from `{value, scale}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(from = "TimestampRepr")]
pub struct Timestamp {
    pub value: i64,
    pub scale: i8,
}

const NANOSECOND_SCALE: i8 = -9;

#[derive(Deserialize)]
#[serde(untagged)]
enum TimestampRepr {
    Nanos(i64),
    Scaled {
        value: i64,
        #[serde(default = "default_scale")]
        scale: i8,
    },
}

fn default_scale() -> i8 {
    NANOSECOND_SCALE
}

impl From<TimestampRepr> for Timestamp {
    fn from(repr: TimestampRepr) -> Self {
        match repr {
            TimestampRepr::Nanos(value) => Timestamp::from_nanos(value),
            TimestampRepr::Scaled { value, scale } => Timestamp::new(value, scale),
        }
    }
}

impl Timestamp {
    pub fn new(value: i64, scale: i8) -> Self {
        Self { value, scale }
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Self::new(nanos, NANOSECOND_SCALE)
    }

    /// Normalizes to nanoseconds, saturating on overflow.
    pub fn to_nanos(self) -> i64 {
        let exponent = i32::from(self.scale) - i32::from(NANOSECOND_SCALE);
        if exponent >= 0 {
            10i64
                .checked_pow(exponent as u32)
                .map(|factor| self.value.saturating_mul(factor))
                .unwrap_or(if self.value < 0 { i64::MIN } else { i64::MAX })
        } else {
            10i64
                .checked_pow(exponent.unsigned_abs())
                .map(|factor| self.value / factor)
                .unwrap_or(0)
        }
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.to_nanos() == other.to_nanos()
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_nanos().cmp(&other.to_nanos())
    }
}

/// One event of the input stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "ts")]
    pub timestamp: Timestamp,
    pub name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    /// End of the interval covered by a synthetic event fed back as input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Timestamp>,
}

impl Event {
    pub fn new(timestamp: Timestamp, name: impl Into<String>) -> Self {
        Self {
            timestamp,
            name: name.into(),
            fields: BTreeMap::new(),
            end: None,
        }
    }

    /// Adds a field, builder style.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Timestamp in nanoseconds.
    pub fn nanos(&self) -> i64 {
        self.timestamp.to_nanos()
    }

    pub fn is_synthetic(&self) -> bool {
        self.end.is_some()
    }

    /// Builds an event from a JSON trace record.
    ///
    /// Expected shape: `{"ts": <ns or {value, scale}>, "name": "...", "fields": {...}}`.
    /// Integers that fit in 32 bits become `Int`, other integers `Long`, floats
    /// `Double`, strings `String`, booleans `Int` 0/1. Nulls are dropped and nested
    /// values are kept as their JSON text.
    pub fn from_json(record: &serde_json::Value) -> Result<Self, CoreError> {
        let object = record.as_object().ok_or_else(|| CoreError::InvalidEvent {
            reason: "event record must be a JSON object".to_string(),
        })?;

        let ts = object
            .get("ts")
            .or_else(|| object.get("timestamp"))
            .ok_or_else(|| CoreError::InvalidEvent {
                reason: "missing 'ts'".to_string(),
            })?;
        let timestamp: Timestamp = serde_json::from_value(ts.clone())?;

        let name = object
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| CoreError::InvalidEvent {
                reason: "missing or non-string 'name'".to_string(),
            })?;

        let mut event = Event::new(timestamp, name);

        if let Some(fields) = object.get("fields") {
            let fields = fields.as_object().ok_or_else(|| CoreError::InvalidEvent {
                reason: "'fields' must be an object".to_string(),
            })?;
            for (key, raw) in fields {
                if let Some(value) = json_to_value(raw) {
                    event.fields.insert(key.clone(), value);
                }
            }
        }

        if let Some(end) = object.get("end") {
            event.end = Some(serde_json::from_value(end.clone())?);
        }

        Ok(event)
    }
}

fn json_to_value(raw: &serde_json::Value) -> Option<Value> {
    use serde_json::Value as Json;

    match raw {
        Json::Null => None,
        Json::Bool(b) => Some(Value::Int(i32::from(*b))),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(match i32::try_from(i) {
                    Ok(small) => Value::Int(small),
                    Err(_) => Value::Long(i),
                })
            } else {
                n.as_f64().map(Value::Double)
            }
        }
        Json::String(s) => Some(Value::String(s.clone())),
        other => Some(Value::String(other.to_string())),
    }
}

/// A derived event emitted by an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticEvent {
    pub name: String,
    pub start: Timestamp,
    pub end: Timestamp,
    pub fields: BTreeMap<String, Value>,
}

impl SyntheticEvent {
    /// Converts into an input event positioned at its start, keeping its end.
    pub fn into_event(self) -> Event {
        Event {
            timestamp: self.start,
            name: self.name,
            fields: self.fields,
            end: Some(self.end),
        }
    }
}

/// Receives synthetic events in the order the engine produces them.
pub trait EventSink {
    fn emit(&mut self, event: SyntheticEvent);
}

impl EventSink for Vec<SyntheticEvent> {
    fn emit(&mut self, event: SyntheticEvent) {
        self.push(event);
    }
}

impl<T: EventSink + ?Sized> EventSink for &mut T {
    fn emit(&mut self, event: SyntheticEvent) {
        (**self).emit(event);
    }
}

/// Discards synthetic events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&mut self, _event: SyntheticEvent) {}
}
