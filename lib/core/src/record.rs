use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::vector::NormalizedVector;

/// The persisted unit: a caller-assigned key, its embedding and an opaque metadata document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub vector: NormalizedVector,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Record {
    #[inline]
    #[must_use]
    pub fn new(key: impl Into<String>, vector: NormalizedVector, metadata: Map<String, Value>) -> Self {
        Self {
            key: key.into(),
            vector,
            metadata,
        }
    }

    /// Metadata field lookup used by payload filters.
    #[inline]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.metadata.get(name)
    }
}

/// One ranked search result. `score` is the collection metric's own value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub key: String,
    pub metadata: Map<String, Value>,
    pub score: f32,
}

/// Coerce an arbitrary JSON value into a metadata document.
///
/// Objects pass through, `null` becomes empty, anything else is wrapped as `{"value": ..}`.
pub fn into_metadata(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
