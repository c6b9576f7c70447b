//! Structured dump emitter.
//!
//! Tracker dumps are produced against the `DumpFormatter` trait so the admin
//! surface owns the wire format. The shipped `JsonFormatter` assembles a
//! `serde_json::Value` document; sections map to JSON objects and arrays.

use std::fmt;

use serde_json::{Map, Number, Value};

/// Sink for structured dump output.
///
/// Sections nest: `open_object`/`open_array` push a section, `close_section`
/// pops one. Named values written inside an array section keep their order
/// and drop the name.
pub trait DumpFormatter {
    fn open_object(&mut self, name: &str);
    fn open_array(&mut self, name: &str);
    fn close_section(&mut self);
    fn dump_int(&mut self, name: &str, value: i64);
    fn dump_float(&mut self, name: &str, value: f64);
    fn dump_string(&mut self, name: &str, value: &str);

    /// Write any displayable value as a string field.
    fn dump_stream(&mut self, name: &str, value: &dyn fmt::Display) {
        self.dump_string(name, &value.to_string());
    }
}

enum Section {
    Object(String, Map<String, Value>),
    Array(String, Vec<Value>),
}

/// `DumpFormatter` building an in-memory JSON document.
#[derive(Default)]
pub struct JsonFormatter {
    root: Map<String, Value>,
    stack: Vec<Section>,
}

impl JsonFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&mut self, name: &str, value: Value) {
        match self.stack.last_mut() {
            Some(Section::Object(_, fields)) => {
                fields.insert(name.to_string(), value);
            }
            Some(Section::Array(_, items)) => items.push(value),
            None => {
                self.root.insert(name.to_string(), value);
            }
        }
    }

    /// Close any dangling sections and return the finished document.
    pub fn into_value(mut self) -> Value {
        while !self.stack.is_empty() {
            self.close_section();
        }
        Value::Object(self.root)
    }

    pub fn to_string_pretty(self) -> String {
        serde_json::to_string_pretty(&self.into_value()).unwrap_or_else(|_| "{}".to_string())
    }
}

impl DumpFormatter for JsonFormatter {
    fn open_object(&mut self, name: &str) {
        self.stack.push(Section::Object(name.to_string(), Map::new()));
    }

    fn open_array(&mut self, name: &str) {
        self.stack.push(Section::Array(name.to_string(), Vec::new()));
    }

    fn close_section(&mut self) {
        let Some(section) = self.stack.pop() else {
            return;
        };
        let (name, value) = match section {
            Section::Object(name, fields) => (name, Value::Object(fields)),
            Section::Array(name, items) => (name, Value::Array(items)),
        };
        self.attach(&name, value);
    }

    fn dump_int(&mut self, name: &str, value: i64) {
        self.attach(name, Value::Number(Number::from(value)));
    }

    fn dump_float(&mut self, name: &str, value: f64) {
        let number = Number::from_f64(value).unwrap_or_else(|| Number::from(0));
        self.attach(name, Value::Number(number));
    }

    fn dump_string(&mut self, name: &str, value: &str) {
        self.attach(name, Value::String(value.to_string()));
    }
}
