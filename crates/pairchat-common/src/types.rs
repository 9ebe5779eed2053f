//! Core type definitions and protocol constants for pairchat.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// WebSocket subprotocol identifier.
/// Bump this on breaking wire-format changes.
pub const PROTOCOL_VERSION: &str = "pairchat.v1";

/// Maximum length of a relayed chat message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 500;

/// Maximum size of a single encoded event on the wire, in bytes.
pub const MAX_EVENT_SIZE: usize = 16 * 1024;

/// Reconnection token handed to a client alongside its display name.
///
/// Tokens are UUID v4 values in their canonical hyphenated form. Anything
/// that does not parse as a UUID is not a token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Issues a fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parses a client-presented token, normalizing it to canonical form.
    ///
    /// # Examples
    ///
    /// ```
    /// use pairchat_common::types::Token;
    /// assert!(Token::parse("not-a-token").is_none());
    /// let t = Token::generate();
    /// assert_eq!(Token::parse(t.as_str()), Some(t));
    /// ```
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim())
            .ok()
            .map(|uuid| Self(uuid.hyphenated().to_string()))
    }

    /// Borrow the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `{name, token}` pair issued to a client when it connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    /// Pseudonymous display name.
    pub name: String,
    /// Secret that lets the client resume this identity after reconnecting.
    pub token: Token,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_unique() {
        assert_ne!(Token::generate(), Token::generate());
    }

    #[test]
    fn parse_normalizes_case_and_whitespace() {
        let t = Token::generate();
        let shouted = format!("  {}  ", t.as_str().to_uppercase());
        assert_eq!(Token::parse(&shouted), Some(t));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Token::parse("").is_none());
        assert!(Token::parse("User1234").is_none());
        assert!(Token::parse("<script>").is_none());
    }

    #[test]
    fn token_serializes_as_plain_string() {
        let t = Token::parse("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(
            serde_json::to_string(&t).unwrap(),
            "\"67e55044-10b1-426f-9247-bb680e5fe0c8\""
        );
    }
}
