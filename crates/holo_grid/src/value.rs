//! In-memory value representation.
//!
//! Structures store their payloads either serialized (`Binary`) or as a
//! deserialized object graph (`Object`). Equality is defined on the logical
//! value so a binary and an object copy of the same payload compare equal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InMemoryFormat {
    #[default]
    Binary,
    Object,
}

impl FromStr for InMemoryFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" => Ok(Self::Binary),
            "object" => Ok(Self::Object),
            other => anyhow::bail!("unknown in-memory format '{other}' (expected binary or object)"),
        }
    }
}

impl fmt::Display for InMemoryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => f.write_str("binary"),
            Self::Object => f.write_str("object"),
        }
    }
}

#[derive(Clone, Debug)]
pub enum StoredValue {
    Binary(Vec<u8>),
    Object(serde_json::Value),
}

impl StoredValue {
    /// Store `value` in the given in-memory format.
    pub fn encode(format: InMemoryFormat, value: &serde_json::Value) -> anyhow::Result<Self> {
        match format {
            InMemoryFormat::Binary => Ok(Self::Binary(serde_json::to_vec(value)?)),
            InMemoryFormat::Object => Ok(Self::Object(value.clone())),
        }
    }

    pub fn format(&self) -> InMemoryFormat {
        match self {
            Self::Binary(_) => InMemoryFormat::Binary,
            Self::Object(_) => InMemoryFormat::Object,
        }
    }

    pub fn to_object(&self) -> anyhow::Result<serde_json::Value> {
        match self {
            Self::Binary(bytes) => Ok(serde_json::from_slice(bytes)?),
            Self::Object(value) => Ok(value.clone()),
        }
    }

    /// Convert into `format`, reusing the payload when it already matches.
    pub fn into_format(self, format: InMemoryFormat) -> anyhow::Result<Self> {
        if self.format() == format {
            return Ok(self);
        }
        let object = self.to_object()?;
        Self::encode(format, &object)
    }
}

impl PartialEq for StoredValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Binary(a), Self::Binary(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            _ => match (self.to_object(), other.to_object()) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            },
        }
    }
}
