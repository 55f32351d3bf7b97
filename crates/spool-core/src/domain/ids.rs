//! Domain identifiers (strongly-typed IDs).
//!
//! `Id<T>` wraps a ULID and carries a zero-sized marker so that ids of
//! different kinds cannot be mixed up. ULIDs sort by creation time, which keeps
//! invocation listings in admission order.
//!
//! `IdempotencyToken` is not an `Id<T>`: tokens are chosen by callers and may be
//! any string, so it is a plain string newtype.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each id kind.
///
/// Provides the prefix used by `Display` (`"inv-"`, ...).
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Error returned when parsing an id from its display form.
#[derive(Debug, thiserror::Error)]
#[error("invalid id '{input}': expected prefix '{prefix}' followed by a ULID")]
pub struct ParseIdError {
    input: String,
    prefix: &'static str,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseIdError {
            input: s.to_string(),
            prefix: T::prefix(),
        };
        let raw = s.strip_prefix(T::prefix()).ok_or_else(err)?;
        let ulid = Ulid::from_string(raw).map_err(|_| err())?;
        Ok(Self::from_ulid(ulid))
    }
}

/// Invocation marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Invocation {}

impl IdMarker for Invocation {
    fn prefix() -> &'static str {
        "inv-"
    }
}

/// Identifier of one durable execution of a handler.
pub type InvocationId = Id<Invocation>;

/// Caller-chosen token scoping one logical side effect.
///
/// Two calls carrying the same token against the same target must have at
/// most one observable effect; the target de-duplicates on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// A fresh random token.
    ///
    /// Not replay-stable: generate it inside `Context::run` so the value is
    /// journaled, or use `Context::deterministic_token`.
    pub fn generate() -> Self {
        Self(format!("tok-{}", Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdempotencyToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_ids_display_with_prefix_and_parse_back() {
        let ulid = Ulid::new();
        let id = InvocationId::from_ulid(ulid);

        let shown = id.to_string();
        assert!(shown.starts_with("inv-"));

        let parsed: InvocationId = shown.parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.as_ulid(), ulid);
    }

    #[test]
    fn parsing_rejects_wrong_prefix() {
        let err = format!("run-{}", Ulid::new())
            .parse::<InvocationId>()
            .unwrap_err();
        assert!(err.to_string().contains("inv-"));
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = InvocationId::from_ulid(Ulid::new());

        let json = serde_json::to_value(id).unwrap();
        assert!(json.is_string());

        let back: InvocationId = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = InvocationId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = InvocationId::from_ulid(Ulid::new());

        assert!(id1 < id2);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<InvocationId>(), size_of::<Ulid>());
    }

    #[test]
    fn generated_tokens_are_unique() {
        let a = IdempotencyToken::generate();
        let b = IdempotencyToken::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("tok-"));
    }
}
