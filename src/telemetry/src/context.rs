//! Trace identity: ids, client kinds, and the `TraceContext` value that names
//! one user action across process boundaries.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Maximum accepted length of a client version string.
pub const MAX_CLIENT_VERSION_LEN: usize = 32;

/// 128-bit trace identifier, rendered as 32 lowercase hex chars.
///
/// The zero id is invalid and can neither be generated nor parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(u128);

/// 64-bit span identifier, rendered as 16 lowercase hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

impl TraceId {
    /// Generate a fresh id from the OS entropy source.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        loop {
            let mut bytes = [0u8; 16];
            rng.fill_bytes(&mut bytes);
            let value = u128::from_be_bytes(bytes);
            if value != 0 {
                return Self(value);
            }
        }
    }

    /// Construct from a raw value. Returns `None` for the invalid zero id.
    pub fn from_u128(value: u128) -> Option<Self> {
        (value != 0).then_some(Self(value))
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_be_bytes()
    }
}

impl SpanId {
    /// Generate a fresh id from the OS entropy source.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        loop {
            let mut bytes = [0u8; 8];
            rng.fill_bytes(&mut bytes);
            let value = u64::from_be_bytes(bytes);
            if value != 0 {
                return Self(value);
            }
        }
    }

    /// Construct from a raw value. Returns `None` for the invalid zero id.
    pub fn from_u64(value: u64) -> Option<Self> {
        (value != 0).then_some(Self(value))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Error returned when parsing a trace or span id from hex.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("invalid id length: expected {expected} hex chars, got {got}")]
    Length { expected: usize, got: usize },

    #[error("invalid hex digit in id")]
    Digit,

    #[error("the all-zero id is invalid")]
    Zero,
}

impl FromStr for TraceId {
    type Err = IdParseError;

    // Parse accepts mixed-case hex; Display always emits lowercase.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(IdParseError::Length {
                expected: 32,
                got: s.len(),
            });
        }
        let value = u128::from_str_radix(s, 16).map_err(|_| IdParseError::Digit)?;
        TraceId::from_u128(value).ok_or(IdParseError::Zero)
    }
}

impl FromStr for SpanId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err(IdParseError::Length {
                expected: 16,
                got: s.len(),
            });
        }
        let value = u64::from_str_radix(s, 16).map_err(|_| IdParseError::Digit)?;
        SpanId::from_u64(value).ok_or(IdParseError::Zero)
    }
}

impl Serialize for TraceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TraceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for SpanId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SpanId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which tier of the platform produced a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    /// Native VST plugin
    Plugin,
    /// Browser client
    Web,
    /// Command-line client
    Cli,
    /// The backend itself
    Server,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plugin => "plugin",
            Self::Web => "web",
            Self::Cli => "cli",
            Self::Server => "server",
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plugin" => Ok(Self::Plugin),
            "web" => Ok(Self::Web),
            "cli" => Ok(Self::Cli),
            "server" => Ok(Self::Server),
            _ => Err(()),
        }
    }
}

/// The causal identity of one unit of work.
///
/// Constructed when the first span of an action begins and retired once the
/// root's last child has ended and its batch is flushed. The context itself
/// is immutable; `span_id` names the current span on the constructing side
/// and `parent_span_id` the remote parent after extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub client_kind: ClientKind,
    pub client_version: String,
    /// Ordered key/value pairs, propagated unchanged.
    pub baggage: Vec<(String, String)>,
}

impl TraceContext {
    /// Start a fresh context: new trace id, root span id, no parent.
    pub fn new(client_kind: ClientKind, client_version: impl Into<String>) -> Self {
        let mut client_version = client_version.into();
        crate::span::truncate_lossy(&mut client_version, MAX_CLIENT_VERSION_LEN);
        Self {
            trace_id: TraceId::generate(),
            span_id: SpanId::generate(),
            parent_span_id: None,
            client_kind,
            client_version,
            baggage: Vec::new(),
        }
    }

    /// A fresh span id distinct from all siblings. Does not mutate `self`.
    pub fn child_span_id(&self) -> SpanId {
        // 64 random bits; collision with a sibling is negligible.
        loop {
            let id = SpanId::generate();
            if id != self.span_id {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_hex_round_trip() {
        let id = TraceId::generate();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 32);
        assert_eq!(rendered, rendered.to_lowercase());
        assert_eq!(rendered.parse::<TraceId>().unwrap(), id);
    }

    #[test]
    fn span_id_hex_round_trip() {
        let id = SpanId::generate();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 16);
        assert_eq!(rendered.parse::<SpanId>().unwrap(), id);
    }

    #[test]
    fn parse_accepts_uppercase_emits_lowercase() {
        let id: TraceId = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".parse().unwrap();
        assert_eq!(id.to_string(), "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    }

    #[test]
    fn zero_ids_rejected() {
        assert_eq!(
            "00000000000000000000000000000000".parse::<TraceId>(),
            Err(IdParseError::Zero)
        );
        assert_eq!(
            "0000000000000000".parse::<SpanId>(),
            Err(IdParseError::Zero)
        );
        assert!(TraceId::from_u128(0).is_none());
        assert!(SpanId::from_u64(0).is_none());
    }

    #[test]
    fn malformed_ids_rejected() {
        assert!("not-hex".parse::<TraceId>().is_err());
        assert!("abc".parse::<SpanId>().is_err());
        assert!("zzzzzzzzzzzzzzzz".parse::<SpanId>().is_err());
    }

    #[test]
    fn id_serde_uses_hex_strings() {
        let id: SpanId = "1111111111111111".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"1111111111111111\"");
        let back: SpanId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn child_span_id_differs_from_current() {
        let ctx = TraceContext::new(ClientKind::Cli, "1.0.0");
        for _ in 0..64 {
            assert_ne!(ctx.child_span_id(), ctx.span_id);
        }
    }

    #[test]
    fn client_version_truncated() {
        let ctx = TraceContext::new(ClientKind::Web, "x".repeat(80));
        assert_eq!(ctx.client_version.len(), MAX_CLIENT_VERSION_LEN);
    }

    #[test]
    fn client_kind_round_trip() {
        for kind in [
            ClientKind::Plugin,
            ClientKind::Web,
            ClientKind::Cli,
            ClientKind::Server,
        ] {
            assert_eq!(kind.as_str().parse::<ClientKind>().unwrap(), kind);
        }
        assert!("desktop".parse::<ClientKind>().is_err());
    }
}
