//! Entity identifiers.
//!
//! An entity is known by a client-minted temporary identifier until the
//! server confirms its create, after which it carries the canonical
//! server identifier. The two states are separate variants so code that
//! needs a canonical id has to match for it instead of sniffing prefixes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire prefix for temporary identifiers (`tmp_<token>`).
///
/// Only used when an id crosses a string boundary (HTTP `clientId`,
/// CLI arguments). Internally the variant is authoritative.
pub const TEMP_PREFIX: &str = "tmp_";

/// Identifier of a Task, Project, TeamMember or Comment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum EntityId {
    /// Client-minted token, not yet known to the server.
    Temporary(String),
    /// Server-assigned identifier.
    Canonical(String),
}

impl EntityId {
    /// Mint a fresh temporary identifier.
    #[must_use]
    pub fn mint() -> Self {
        Self::Temporary(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap a server identifier.
    pub fn canonical(id: impl Into<String>) -> Self {
        Self::Canonical(id.into())
    }

    /// Parse an identifier from its wire form.
    ///
    /// Strings carrying [`TEMP_PREFIX`] become temporary ids; anything else
    /// is taken as canonical.
    #[must_use]
    pub fn from_wire(s: &str) -> Self {
        match s.strip_prefix(TEMP_PREFIX) {
            Some(token) if !token.is_empty() => Self::Temporary(token.to_string()),
            _ => Self::Canonical(s.to_string()),
        }
    }

    /// Wire form: `tmp_<token>` for temporary ids, the raw id otherwise.
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            Self::Temporary(token) => format!("{TEMP_PREFIX}{token}"),
            Self::Canonical(id) => id.clone(),
        }
    }

    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// The canonical id, if the server has assigned one.
    #[must_use]
    pub fn as_canonical(&self) -> Option<&str> {
        match self {
            Self::Canonical(id) => Some(id),
            Self::Temporary(_) => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temporary(token) => write!(f, "{TEMP_PREFIX}{token}"),
            Self::Canonical(id) => f.write_str(id),
        }
    }
}

/// Mint a queue operation identifier (`op_<uuid>`).
#[must_use]
pub fn new_operation_id() -> String {
    format!("op_{}", uuid::Uuid::new_v4().simple())
}
