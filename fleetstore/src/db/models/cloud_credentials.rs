//! Database models for cloud credentials.

use crate::db::models::access::{AccessGrant, GrantSpec};
use crate::db::models::clouds::CloudDBResponse;
use crate::db::models::identities::IdentityDBResponse;
use crate::types::{CloudCredentialId, CloudCredentialKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Credential attribute map, e.g. `access-key` / `secret-key`.
pub type CredentialAttributes = BTreeMap<String, String>;

/// Database request for creating a new cloud credential
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudCredentialCreateDBRequest {
    pub cloud_name: String,
    pub owner_identity_name: String,
    pub name: String,
    pub auth_type: String,
    pub label: String,
    pub attributes_in_vault: bool,
    pub attributes: CredentialAttributes,
    /// `None` until the credential has been checked against its cloud.
    pub valid: Option<bool>,
}

impl CloudCredentialCreateDBRequest {
    pub fn key(&self) -> CloudCredentialKey {
        CloudCredentialKey::new(&self.cloud_name, &self.owner_identity_name, &self.name)
    }
}

/// Full snapshot of a credential and its grants, used by `set_cloud_credential`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudCredentialSnapshot {
    pub credential: CloudCredentialCreateDBRequest,
    pub grants: Vec<GrantSpec>,
}

/// Database request for overwriting a credential's scalar fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudCredentialUpdateDBRequest {
    pub auth_type: String,
    pub label: String,
    pub attributes_in_vault: bool,
    pub attributes: CredentialAttributes,
    pub valid: Option<bool>,
}

impl From<&CloudCredentialDBResponse> for CloudCredentialUpdateDBRequest {
    fn from(credential: &CloudCredentialDBResponse) -> Self {
        Self {
            auth_type: credential.auth_type.clone(),
            label: credential.label.clone(),
            attributes_in_vault: credential.attributes_in_vault,
            attributes: credential.attributes.clone(),
            valid: credential.valid,
        }
    }
}

/// Database response for a cloud credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudCredentialDBResponse {
    pub id: CloudCredentialId,
    pub cloud_name: String,
    pub owner_identity_name: String,
    pub name: String,
    pub auth_type: String,
    pub label: String,
    pub attributes_in_vault: bool,
    pub attributes: CredentialAttributes,
    pub valid: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Loaded without its regions or grants.
    pub cloud: Option<Box<CloudDBResponse>>,
    pub owner: Option<IdentityDBResponse>,
    pub grants: Vec<AccessGrant>,
}

impl CloudCredentialDBResponse {
    pub fn key(&self) -> CloudCredentialKey {
        CloudCredentialKey::new(&self.cloud_name, &self.owner_identity_name, &self.name)
    }
}
