//! Stream cursor: an opaque resumption token handed out by the block source.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque position in the block stream.
///
/// The pipeline never interprets a cursor; it only persists the one
/// attached to the last fully published block and hands it back to the
/// block source on restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cursor {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Cursor {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Durable representation of a cursor: `{"cursor": "<opaque>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub cursor: Cursor,
}

impl CheckpointRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_wire_format() {
        let rec = CheckpointRecord {
            cursor: Cursor::new("c1:abc"),
        };
        let bytes = rec.to_bytes().unwrap();
        assert_eq!(bytes, br#"{"cursor":"c1:abc"}"#.to_vec());
        assert_eq!(CheckpointRecord::from_bytes(&bytes).unwrap(), rec);
    }

    #[test]
    fn record_rejects_garbage() {
        assert!(CheckpointRecord::from_bytes(b"c1:abc").is_err());
    }
}
