//! Common type definitions shared by the entity stores.
//!
//! This module defines:
//! - Type aliases for surrogate row IDs (CloudId, ControllerId, etc.)
//! - Natural key types used to address entities (CloudRegionKey, ControllerKey, ...)
//! - The [`EntityKind`] enum used to label errors, metrics and spans
//!
//! # Natural Keys
//!
//! Every aggregate has a real-world unique identifier in addition to its surrogate `BIGSERIAL`
//! id. Lookups are expressed in terms of natural keys:
//!
//! - Cloud: name
//! - CloudRegion: [`CloudRegionKey`] (cloud name, region name)
//! - Controller: [`ControllerKey`] (UUID or name)
//! - Model: [`ModelKey`] (UUID, or owner + name)
//! - Identity: name
//! - CloudCredential: [`CloudCredentialKey`] (cloud, owner, credential name)
//!
//! # Utility Functions
//!
//! - [`abbrev_uuid`]: Abbreviate UUIDs to first 8 chars for logging

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// Type aliases for surrogate IDs
pub type CloudId = i64;
pub type CloudRegionId = i64;
pub type ControllerId = i64;
pub type ModelId = i64;
pub type IdentityId = i64;
pub type CloudCredentialId = i64;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// The kinds of entity the store persists, used to label errors and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Cloud,
    CloudRegion,
    ControllerPriority,
    Controller,
    Model,
    Identity,
    CloudCredential,
    Schema,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Cloud => "cloud",
            EntityKind::CloudRegion => "cloud region",
            EntityKind::ControllerPriority => "controller priority",
            EntityKind::Controller => "controller",
            EntityKind::Model => "model",
            EntityKind::Identity => "identity",
            EntityKind::CloudCredential => "cloud credential",
            EntityKind::Schema => "schema",
        };
        f.write_str(name)
    }
}

/// A region is addressed by its cloud and its own name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloudRegionKey {
    pub cloud: String,
    pub region: String,
}

impl CloudRegionKey {
    pub fn new(cloud: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            cloud: cloud.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for CloudRegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cloud, self.region)
    }
}

/// Controllers are unique both by UUID and by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKey {
    Uuid(Uuid),
    Name(String),
}

impl fmt::Display for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerKey::Uuid(uuid) => write!(f, "{uuid}"),
            ControllerKey::Name(name) => f.write_str(name),
        }
    }
}

/// Models are addressed by UUID once provisioned, or by owner and name at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKey {
    Uuid(Uuid),
    OwnerName { owner: String, name: String },
}

impl ModelKey {
    pub fn owner_name(owner: impl Into<String>, name: impl Into<String>) -> Self {
        ModelKey::OwnerName {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKey::Uuid(uuid) => write!(f, "{uuid}"),
            ModelKey::OwnerName { owner, name } => write!(f, "{owner}/{name}"),
        }
    }
}

/// A credential belongs to one cloud and one owner, and is named within that pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloudCredentialKey {
    pub cloud: String,
    pub owner: String,
    pub name: String,
}

impl CloudCredentialKey {
    pub fn new(cloud: impl Into<String>, owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cloud: cloud.into(),
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CloudCredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cloud, self.owner, self.name)
    }
}
