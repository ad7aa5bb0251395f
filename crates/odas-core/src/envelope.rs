use serde::Serialize;
use serde_json::{Map, Value};

use crate::category::Category;
use crate::errors::RelayError;

/// The `type` field of an outbound envelope.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Tracking,
    Potential,
    Status,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tracking => "tracking",
            Self::Potential => "potential",
            Self::Status => "status",
        }
    }
}

impl From<Category> for MessageKind {
    fn from(category: Category) -> Self {
        match category {
            Category::Tracking => Self::Tracking,
            Category::Potential => Self::Potential,
        }
    }
}

/// Synthetic open/close transition for one category's upstream connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusEvent {
    pub category: Category,
    pub connected: bool,
}

impl StatusEvent {
    pub fn new(category: Category, connected: bool) -> Self {
        Self {
            category,
            connected,
        }
    }

    /// `{"tracking": true}` style payload. Only ever one key.
    pub fn to_payload(&self) -> Value {
        let mut map = Map::with_capacity(1);
        map.insert(self.category.as_str().to_owned(), Value::Bool(self.connected));
        Value::Object(map)
    }
}

/// Wire envelope sent to every subscriber: `{"type": ..., "data": ...}`.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data: &'a Value,
}

impl<'a> Envelope<'a> {
    pub fn new(kind: MessageKind, data: &'a Value) -> Self {
        Self { kind, data }
    }

    pub fn encode(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }
}
