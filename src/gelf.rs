//! Minimal GELF record construction, per the producer client contract.
//! The broker never parses producer payloads on the hot path; this module
//! exists only so [`crate::selflog`] can author records using the same
//! contract a real producer would, and so tests can build realistic
//! intake datagrams without a separate client library.

use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Syslog-style severity, 1 (most severe) through 9 (least).
pub type Level = u8;

/// Map a level name alias (case-insensitive) to its numeric severity.
///
/// Returns `None` for an unrecognized name.
pub fn level_from_name(name: &str) -> Option<Level> {
    match name.to_ascii_lowercase().as_str() {
        "fatal" | "emerg" | "emergency" => Some(1),
        "alert" => Some(2),
        "crit" | "critical" => Some(3),
        "error" | "err" => Some(4),
        "warn" | "warning" => Some(5),
        "note" | "notice" => Some(6),
        "info" => Some(7),
        "debug" => Some(8),
        "trace" | "core" => Some(9),
        _ => None,
    }
}

/// Builds a GELF 1.1 JSON document.
///
/// Handles the multi-line `message` → `short_message`/`full_message` split,
/// strips the reserved `_id` field from user-supplied extras, and defaults
/// `host`/`timestamp` when not explicitly set.
pub struct RecordBuilder {
    host: Option<String>,
    timestamp: Option<String>,
    level: Level,
    message: Option<String>,
    short_message: Option<String>,
    full_message: Option<String>,
    extra: Map<String, Value>,
    facility: Option<String>,
}

impl Default for RecordBuilder {
    fn default() -> Self {
        Self {
            host: None,
            timestamp: None,
            level: 7, // info
            message: None,
            short_message: None,
            full_message: None,
            extra: Map::new(),
            facility: None,
        }
    }
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the timestamp from an epoch value (seconds since epoch).
    ///
    /// Normalized to a numeric string, sidestepping JSON float ambiguity in
    /// downstream consumers.
    pub fn timestamp_epoch(mut self, epoch_secs: f64) -> Self {
        self.timestamp = Some(format_epoch(epoch_secs));
        self
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn level_name(mut self, name: &str) -> Self {
        if let Some(level) = level_from_name(name) {
            self.level = level;
        }
        self
    }

    pub fn facility(mut self, facility: impl Into<String>) -> Self {
        self.facility = Some(facility.into());
        self
    }

    /// Set the message body. A multi-line message (containing `\n`) is
    /// split at the first newline into `short_message`/`full_message`;
    /// otherwise it becomes `short_message` alone.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Add a user-defined field, prefixed with `_` if not already. The
    /// reserved `_id` field is silently dropped.
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        let key = if key.starts_with('_') {
            key.to_string()
        } else {
            format!("_{key}")
        };
        if key == "_id" {
            return self;
        }
        self.extra.insert(key, value.into());
        self
    }

    pub fn build(self) -> Value {
        let mut obj = Map::new();
        obj.insert("version".into(), Value::String("1.1".into()));
        obj.insert(
            "host".into(),
            Value::String(self.host.unwrap_or_else(default_hostname)),
        );
        obj.insert(
            "timestamp".into(),
            Value::String(self.timestamp.unwrap_or_else(now_epoch_string)),
        );
        obj.insert("level".into(), Value::Number(self.level.into()));
        if let Some(facility) = self.facility {
            obj.insert("facility".into(), Value::String(facility));
        }

        match (self.short_message, self.full_message, self.message) {
            (Some(short), full, _) => {
                obj.insert("short_message".into(), Value::String(short));
                if let Some(full) = full {
                    obj.insert("full_message".into(), Value::String(full));
                }
            }
            (None, _, Some(message)) => {
                if let Some((first, rest)) = message.split_once('\n') {
                    obj.insert("short_message".into(), Value::String(first.to_string()));
                    obj.insert("full_message".into(), Value::String(rest.to_string()));
                } else {
                    obj.insert("short_message".into(), Value::String(message));
                }
            }
            (None, _, None) => {
                obj.insert("short_message".into(), Value::String(String::new()));
            }
        }

        for (k, v) in self.extra {
            obj.insert(k, v);
        }

        Value::Object(obj)
    }
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn now_epoch_string() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    format_epoch(secs)
}

fn format_epoch(secs: f64) -> String {
    format!("{secs:.3}")
}

/// Strip the reserved `_id` key from a raw JSON object. The identifier
/// field is reserved for the upstream's own use and must never be
/// forwarded from a producer.
pub fn strip_reserved_id(value: &mut Value) {
    if let Value::Object(map) = value {
        map.remove("_id");
    }
}
