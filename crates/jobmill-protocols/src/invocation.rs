//! Invocation descriptors and their encoded form.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// A call to a registered capability operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub capability: String,
    pub operation: String,
    #[serde(default)]
    pub args: Value,
}

impl Invocation {
    pub fn new(capability: impl Into<String>, operation: impl Into<String>, args: Value) -> Self {
        Self {
            capability: capability.into(),
            operation: operation.into(),
            args,
        }
    }

    /// `capability.operation`
    pub fn display_name(&self) -> String {
        format!("{}.{}", self.capability, self.operation)
    }
}

/// Opaque encoded invocation as stored with the job.
///
/// Persisted as a UTF-8 string; invalid bytes are replaced on output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Self(text.into_bytes()))
    }
}
