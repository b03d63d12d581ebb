//! Generic remote document envelope

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A document as delivered by the remote store: a server-assigned identifier
/// plus an untyped field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl RawDocument {
    pub fn new(id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Build from a `serde_json::json!` object literal. Non-object values
    /// produce an empty field map.
    pub fn from_value(id: impl Into<String>, value: Value) -> Self {
        let data = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(id, data)
    }
}

/// Records with a stable server-assigned identifier
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for RawDocument {
    fn key(&self) -> &str {
        &self.id
    }
}
