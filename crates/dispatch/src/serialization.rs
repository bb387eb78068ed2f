//! Body serializers and message compression.

use std::fmt;
use std::str::FromStr;

use fahrplan_core::{FahrplanError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Header announcing a compressed body.
pub const COMPRESSION_HEADER: &str = "compression";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Serializer {
    Json,
    MsgPack,
}

impl Serializer {
    pub fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MsgPack => "msgpack",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::MsgPack => "application/x-msgpack",
        }
    }

    pub fn content_encoding(self) -> &'static str {
        match self {
            Self::Json => "utf-8",
            Self::MsgPack => "binary",
        }
    }

    /// Resolve a serializer by name or content type.
    pub fn lookup(name: &str) -> Option<Self> {
        [Self::Json, Self::MsgPack]
            .into_iter()
            .find(|s| s.name() == name || s.content_type() == name)
    }

    /// Check `name` against the accepted list and resolve it.
    ///
    /// The list may hold names (`json`) or content types
    /// (`application/json`).
    pub fn checked(name: &str, accept_content: &[String]) -> Result<Self> {
        if accept_content.is_empty() {
            return Err(FahrplanError::ImproperlyConfigured(
                "accept_content is empty: no serializer is allowed".into(),
            ));
        }
        let serializer = Self::lookup(name).ok_or_else(|| {
            FahrplanError::Security(format!("unknown serializer '{name}'"))
        })?;
        let allowed = accept_content
            .iter()
            .any(|a| a == serializer.name() || a == serializer.content_type());
        if !allowed {
            return Err(FahrplanError::Security(format!(
                "serializer '{name}' is not in accept_content {accept_content:?}"
            )));
        }
        Ok(serializer)
    }

    pub fn dumps<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        Ok(match self {
            Self::Json => serde_json::to_vec(value)?,
            Self::MsgPack => rmp_serde::to_vec_named(value)?,
        })
    }

    pub fn loads<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        Ok(match self {
            Self::Json => serde_json::from_slice(bytes)?,
            Self::MsgPack => rmp_serde::from_slice(bytes)?,
        })
    }
}

impl fmt::Display for Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Serializer {
    type Err = FahrplanError;

    fn from_str(s: &str) -> Result<Self> {
        Self::lookup(s)
            .ok_or_else(|| FahrplanError::ImproperlyConfigured(format!("unknown serializer '{s}'")))
    }
}

// ── Compression ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zstd,
}

const ZSTD_LEVEL: i32 = 3;

impl Compression {
    pub fn lookup(name: &str) -> Result<Self> {
        match name {
            "zstd" | "application/zstd" => Ok(Self::Zstd),
            other => Err(FahrplanError::ImproperlyConfigured(format!(
                "unknown compression '{other}'"
            ))),
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Zstd => "application/zstd",
        }
    }

    pub fn compress(self, body: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Zstd => Ok(zstd::encode_all(body, ZSTD_LEVEL)?),
        }
    }

    pub fn decompress(self, body: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Zstd => Ok(zstd::decode_all(body)?),
        }
    }
}
