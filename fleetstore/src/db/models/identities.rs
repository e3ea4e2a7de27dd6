//! Database models for identities.

use crate::db::models::access::AccessLevel;
use crate::types::IdentityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Characters that are not safe in identity names and are replaced with `-`.
const UNSAFE_NAME_CHARS: &[char] = &['~', '!', '$', '%', '^', '&', '*', '_', '=', '{', '}', '\'', '?'];

/// Make an identity name safe for use as a key.
///
/// Unsafe characters become `-`. When anything was replaced, the first six hex digits of the
/// SHA-256 of the original name are inserted before the first `@` so that distinct raw names
/// stay distinct: `a_b@example.com` becomes `a-b<hash>@example.com`.
pub fn sanitise_identity_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if UNSAFE_NAME_CHARS.contains(&c) { '-' } else { c })
        .collect();

    if replaced == name {
        return replaced;
    }

    let digest = Sha256::digest(name.as_bytes());
    let short_hash: String = digest[..3].iter().map(|b| format!("{b:02x}")).collect();
    replaced.replacen('@', &format!("{short_hash}@"), 1)
}

/// Display name derived from an identity name: everything before the first `@`.
pub fn default_display_name(name: &str) -> String {
    name.split('@').next().unwrap_or_default().to_string()
}

/// Database request for creating a new identity
#[derive(Debug, Clone)]
pub struct IdentityCreateDBRequest {
    pub name: String,
    /// Defaults to the part of the name before `@`.
    pub display_name: Option<String>,
    /// Defaults to the store's configured default controller access.
    pub controller_access: Option<AccessLevel>,
    pub disabled: bool,
}

impl IdentityCreateDBRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            controller_access: None,
            disabled: false,
        }
    }
}

/// Database request for updating an identity's scalar fields
#[derive(Debug, Clone)]
pub struct IdentityUpdateDBRequest {
    /// Empty resets to the default derived from the name.
    pub display_name: String,
    pub controller_access: AccessLevel,
    pub last_login: Option<DateTime<Utc>>,
    pub disabled: bool,
}

impl From<&IdentityDBResponse> for IdentityUpdateDBRequest {
    fn from(identity: &IdentityDBResponse) -> Self {
        Self {
            display_name: identity.display_name.clone(),
            controller_access: identity.controller_access,
            last_login: identity.last_login,
            disabled: identity.disabled,
        }
    }
}

/// Database response for an identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityDBResponse {
    pub id: IdentityId,
    pub name: String,
    pub display_name: String,
    pub controller_access: AccessLevel,
    pub last_login: Option<DateTime<Utc>>,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
