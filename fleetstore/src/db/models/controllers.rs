//! Database models for controllers.

use crate::db::models::ConfigMap;
use crate::db::models::clouds::ControllerPriorityDBResponse;
use crate::types::{CloudRegionKey, ControllerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One address a controller can be reached on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPort {
    pub value: String,
    pub port: u16,
    /// e.g. `public`, `local-cloud`
    #[serde(default)]
    pub scope: String,
}

/// Derived health of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    /// Still reachable, but not chosen for new models.
    Deprecated,
    Unavailable,
}

/// A region a new controller can host models in, with its priority there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionPrioritySpec {
    pub region: CloudRegionKey,
    pub priority: i32,
}

/// Database request for creating a new controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerCreateDBRequest {
    pub name: String,
    pub uuid: Uuid,
    pub admin_user: String,
    pub admin_password: String,
    pub ca_certificate: String,
    pub public_address: String,
    pub cloud_name: String,
    pub cloud_region: String,
    pub deprecated: bool,
    pub agent_version: String,
    pub addresses: Vec<HostPort>,
    pub unavailable_since: Option<DateTime<Utc>>,
    pub config: ConfigMap,
    pub region_priorities: Vec<RegionPrioritySpec>,
}

impl ControllerCreateDBRequest {
    /// A minimal request for a controller deployed in `cloud_name/cloud_region`.
    pub fn new(name: impl Into<String>, uuid: Uuid, cloud_name: impl Into<String>, cloud_region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid,
            admin_user: String::new(),
            admin_password: String::new(),
            ca_certificate: String::new(),
            public_address: String::new(),
            cloud_name: cloud_name.into(),
            cloud_region: cloud_region.into(),
            deprecated: false,
            agent_version: String::new(),
            addresses: Vec::new(),
            unavailable_since: None,
            config: ConfigMap::new(),
            region_priorities: Vec::new(),
        }
    }
}

/// Database request for overwriting a controller's scalar fields.
///
/// Name, UUID and hosting cloud/region are fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerUpdateDBRequest {
    pub admin_user: String,
    pub admin_password: String,
    pub ca_certificate: String,
    pub public_address: String,
    pub deprecated: bool,
    pub agent_version: String,
    pub addresses: Vec<HostPort>,
    pub unavailable_since: Option<DateTime<Utc>>,
    pub config: ConfigMap,
}

impl From<&ControllerDBResponse> for ControllerUpdateDBRequest {
    fn from(controller: &ControllerDBResponse) -> Self {
        Self {
            admin_user: controller.admin_user.clone(),
            admin_password: controller.admin_password.clone(),
            ca_certificate: controller.ca_certificate.clone(),
            public_address: controller.public_address.clone(),
            deprecated: controller.deprecated,
            agent_version: controller.agent_version.clone(),
            addresses: controller.addresses.clone(),
            unavailable_since: controller.unavailable_since,
            config: controller.config.clone(),
        }
    }
}

/// Database response for a controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerDBResponse {
    pub id: ControllerId,
    pub name: String,
    pub uuid: Uuid,
    pub admin_user: String,
    pub admin_password: String,
    pub ca_certificate: String,
    pub public_address: String,
    pub cloud_name: String,
    pub cloud_region: String,
    pub deprecated: bool,
    pub agent_version: String,
    pub addresses: Vec<HostPort>,
    pub unavailable_since: Option<DateTime<Utc>>,
    pub config: ConfigMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ordered by descending priority.
    pub cloud_regions: Vec<ControllerPriorityDBResponse>,
}

impl ControllerDBResponse {
    pub fn availability(&self) -> Availability {
        if self.unavailable_since.is_some() {
            Availability::Unavailable
        } else if self.deprecated {
            Availability::Deprecated
        } else {
            Availability::Available
        }
    }
}
