//! Canonical conversation addresses.
//!
//! A conversation is identified by the participant's phone number reduced to
//! digits, followed by the transport's user domain (e.g. `15551234567@s.whatsapp.net`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain appended to the digits of a phone number.
pub const ADDRESS_SUFFIX: &str = "@s.whatsapp.net";

/// Normalized conversation id. Construct with [`ConversationId::normalize`].
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Strip every non-digit and append [`ADDRESS_SUFFIX`]. Idempotent: a canonical id
    /// normalizes to itself because the suffix contains no digits.
    pub fn normalize(raw: &str) -> Self {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        Self(format!("{}{}", digits, ADDRESS_SUFFIX))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Digits part of the address (the phone number).
    pub fn number(&self) -> &str {
        self.0.strip_suffix(ADDRESS_SUFFIX).unwrap_or(&self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConversationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
