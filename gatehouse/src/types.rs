//! Common type definitions.
//!
//! This module defines:
//! - [`SubjectId`]: the opaque identifier a token asserts
//! - [`Role`]: the coarse role carried in access tokens
//! - [`Principal`]: the verified identity handed to downstream policy evaluation
//!
//! # Utility Functions
//!
//! - [`abbrev_subject`]: Abbreviate subject ids to their first 8 chars for logging
//! - [`abbrev_token`]: Abbreviate bearer secrets so they never land in logs in full

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type SubjectId = Uuid;

/// Role asserted by an access token.
///
/// Evaluating what a role may do is the job of the downstream policy engine; this crate only
/// carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            "viewer" => Ok(Role::Viewer),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Who a verified access token says the caller is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub subject: SubjectId,
    pub role: Role,
}

/// Abbreviate a subject id to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_subject(id: &SubjectId) -> String {
    id.to_string().chars().take(8).collect()
}

/// Keep only a short prefix of a bearer secret, enough to correlate log lines.
pub fn abbrev_token(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{prefix}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_serde() {
        let json = serde_json::to_string(&Role::Viewer).unwrap();
        assert_eq!(json, "\"viewer\"");
        let role: Role = serde_json::from_str("\"admin\"").unwrap();
        assert_eq!(role, Role::Admin);
    }

    #[test]
    fn test_role_from_str_rejects_unknown() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn test_abbreviations() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(abbrev_subject(&id), "550e8400");
        assert_eq!(abbrev_token("abcdefghijkl"), "abcdef…");
        assert_eq!(abbrev_token("ab"), "ab…");
    }
}
