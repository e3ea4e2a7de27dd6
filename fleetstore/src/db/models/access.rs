//! Access levels and the grant rows joining identities to clouds, models and credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::db::models::identities::IdentityDBResponse;

/// Access level carried by an access grant, or an identity's controller-wide default.
///
/// There is no "no access" level: revoking access removes the grant row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum AccessLevel {
    Login,
    AddModel,
    Superuser,
    Read,
    Write,
    Admin,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Login => "login",
            AccessLevel::AddModel => "add-model",
            AccessLevel::Superuser => "superuser",
            AccessLevel::Read => "read",
            AccessLevel::Write => "write",
            AccessLevel::Admin => "admin",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "login" => Ok(AccessLevel::Login),
            "add-model" => Ok(AccessLevel::AddModel),
            "superuser" => Ok(AccessLevel::Superuser),
            "read" => Ok(AccessLevel::Read),
            "write" => Ok(AccessLevel::Write),
            "admin" => Ok(AccessLevel::Admin),
            other => Err(format!("unknown access level {other:?}")),
        }
    }
}

/// A stored grant, as returned with its object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub identity_name: String,
    pub access: AccessLevel,
    /// Only tracked for model grants.
    pub last_connection: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Loaded when the graph includes `grants.identity`.
    pub identity: Option<IdentityDBResponse>,
}

/// A grant as supplied in a synchronization snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantSpec {
    pub identity_name: String,
    pub access: AccessLevel,
}

impl GrantSpec {
    pub fn new(identity_name: impl Into<String>, access: AccessLevel) -> Self {
        Self {
            identity_name: identity_name.into(),
            access,
        }
    }
}
