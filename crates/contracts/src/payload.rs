//! The dynamic worker payload document.
//!
//! Workers are free to add arbitrary fields, so the payload stays a dynamic
//! JSON tree addressed by dot-separated paths rather than a static model.
//! The engine only relies on the canonical top-level keys being present.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{json, Map, Value};

/// Top-level keys every in-flight payload must carry.
pub const CANONICAL_KEYS: [&str; 9] = [
    "initial_input",
    "return_value",
    "data",
    "trace",
    "debug",
    "nextCommand",
    "error",
    "config",
    "params",
];

/// A path-addressed JSON document threaded through an API call's pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload(Value);

impl Payload {
    /// The base document a new call starts from.
    pub fn empty() -> Self {
        Payload(json!({
            "initial_input": {},
            "return_value": {},
            "data": {},
            "trace": [],
            "debug": {},
            "nextCommand": "",
            "error": {},
            "config": {},
            "params": {},
        }))
    }

    pub fn from_value(value: Value) -> Self {
        Payload(value)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes).map(Payload)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Looks up a dot-separated path. Returns `None` if any segment is
    /// missing or a non-object is traversed.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.0;
        for segment in path.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Sets a dot-separated path, creating (or replacing) intermediate
    /// objects as needed.
    pub fn set(&mut self, path: &str, value: Value) {
        if !self.0.is_object() {
            self.0 = Value::Object(Map::new());
        }
        let mut current = &mut self.0;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let map = current.as_object_mut().expect("cursor is always an object");
            if segments.peek().is_none() {
                map.insert(segment.to_string(), value);
                return;
            }
            let entry = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = entry;
        }
    }

    pub fn to_compact_string(&self) -> String {
        self.0.to_string()
    }

    pub fn to_pretty_string(&self) -> String {
        serde_json::to_string_pretty(&self.0).unwrap_or_else(|_| self.0.to_string())
    }

    /// Checks that all canonical top-level fields are present.
    pub fn check_structure(&self) -> Result<(), String> {
        let Some(map) = self.0.as_object() else {
            return Err("Payload is not a JSON object".to_string());
        };
        for key in CANONICAL_KEYS {
            if !map.contains_key(key) {
                return Err(format!("Payload missing {key}"));
            }
        }
        Ok(())
    }

    /// Confirms each required param exists under `initial_input` with the
    /// configured type tag. Numbers arrive as float64 on the wire; `int64`
    /// additionally requires an exact integral conversion.
    pub fn check_required_params(
        &self,
        required: &HashMap<String, String>,
    ) -> Result<(), String> {
        for (key, tag) in required {
            let Some(value) = self.get("initial_input").and_then(|input| input.get(key)) else {
                return Err(format!("Missing parameter: {key}"));
            };
            if !param_matches(value, tag) {
                return Err(format!(
                    "Parameter:{key}, Expected:{tag}, Received:{}",
                    json_type_name(value)
                ));
            }
        }
        Ok(())
    }

    /// The worker-directed redirect, if set to a non-empty string.
    pub fn next_command(&self) -> Option<String> {
        self.get("nextCommand")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }

    pub fn clear_next_command(&mut self) {
        self.set("nextCommand", Value::String(String::new()));
    }

    /// Appends a snapshot of the payload state to the `trace` array.
    pub fn add_trace_entry(&mut self, command: Option<&str>, index: usize) {
        let mut entry = json!({
            "return_value": self.get("return_value").cloned().unwrap_or(Value::Null),
            "data": self.get("data").cloned().unwrap_or(Value::Null),
            "config": self.get("config").cloned().unwrap_or(Value::Null),
            "params": self.get("params").cloned().unwrap_or(Value::Null),
            "commandIndex": index,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(command) = command {
            entry["command"] = Value::String(command.to_string());
        }
        match self.0.get_mut("trace") {
            Some(Value::Array(trace)) => trace.push(entry),
            _ => self.set("trace", Value::Array(vec![entry])),
        }
    }

    /// Projects the payload down to the listed top-level keys. `None` passes
    /// the document through unmodified.
    pub fn filtered(&self, keys: Option<&[String]>) -> Value {
        let Some(keys) = keys else {
            return self.0.clone();
        };
        let mut out = Map::with_capacity(keys.len());
        if let Some(map) = self.0.as_object() {
            for key in keys {
                if let Some(value) = map.get(key) {
                    out.insert(key.clone(), value.clone());
                }
            }
        }
        Value::Object(out)
    }
}

fn param_matches(value: &Value, tag: &str) -> bool {
    match tag {
        "string" => value.is_string(),
        "bool" => value.is_boolean(),
        "float64" => value.is_number(),
        "int64" => match value {
            Value::Number(n) => {
                n.as_i64().is_some()
                    || n.as_u64().is_some()
                    || n.as_f64().is_some_and(|f| f.is_finite() && f == f.trunc())
            }
            _ => false,
        },
        // Unrecognized tags never match; the config schema keeps them out.
        _ => false,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "float64",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
