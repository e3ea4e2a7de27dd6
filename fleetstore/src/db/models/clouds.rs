//! Database models for clouds and cloud regions.

use crate::db::models::ConfigMap;
use crate::db::models::access::{AccessGrant, GrantSpec};
use crate::db::models::controllers::ControllerDBResponse;
use crate::types::{CloudId, CloudRegionId, ControllerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority of a controller that has a model deployed in the region.
pub const PRIORITY_DEPLOYED: i32 = 10;

/// Priority of a controller that merely supports the region.
pub const PRIORITY_SUPPORTED: i32 = 1;

/// A region as supplied inside a cloud create request or snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudRegionSpec {
    pub name: String,
    pub endpoint: String,
    pub identity_endpoint: String,
    pub storage_endpoint: String,
    pub config: ConfigMap,
}

impl CloudRegionSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Database request for creating a new cloud, together with its initial regions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudCreateDBRequest {
    pub name: String,
    pub provider_type: String,
    /// `cloud/region` hosting this cloud, empty for public clouds.
    pub host_cloud_region: String,
    pub auth_types: Vec<String>,
    pub endpoint: String,
    pub identity_endpoint: String,
    pub storage_endpoint: String,
    pub ca_certificates: Vec<String>,
    pub config: ConfigMap,
    pub regions: Vec<CloudRegionSpec>,
}

/// Full snapshot of a cloud as reported by a live controller, used by `set_cloud`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudSnapshot {
    pub cloud: CloudCreateDBRequest,
    pub grants: Vec<GrantSpec>,
}

/// Database request for overwriting a cloud's scalar fields.
///
/// Regions and grants are not part of this request; they have their own operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudUpdateDBRequest {
    pub provider_type: String,
    pub host_cloud_region: String,
    pub auth_types: Vec<String>,
    pub endpoint: String,
    pub identity_endpoint: String,
    pub storage_endpoint: String,
    pub ca_certificates: Vec<String>,
    pub config: ConfigMap,
}

impl From<&CloudDBResponse> for CloudUpdateDBRequest {
    fn from(cloud: &CloudDBResponse) -> Self {
        Self {
            provider_type: cloud.provider_type.clone(),
            host_cloud_region: cloud.host_cloud_region.clone(),
            auth_types: cloud.auth_types.clone(),
            endpoint: cloud.endpoint.clone(),
            identity_endpoint: cloud.identity_endpoint.clone(),
            storage_endpoint: cloud.storage_endpoint.clone(),
            ca_certificates: cloud.ca_certificates.clone(),
            config: cloud.config.clone(),
        }
    }
}

/// Database response for a cloud
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudDBResponse {
    pub id: CloudId,
    pub name: String,
    pub provider_type: String,
    pub host_cloud_region: String,
    pub auth_types: Vec<String>,
    pub endpoint: String,
    pub identity_endpoint: String,
    pub storage_endpoint: String,
    pub ca_certificates: Vec<String>,
    pub config: ConfigMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ordered by region name.
    pub regions: Vec<CloudRegionDBResponse>,
    /// Ordered by identity name.
    pub grants: Vec<AccessGrant>,
}

/// Database request for adding a region to an existing cloud
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudRegionCreateDBRequest {
    pub cloud_name: String,
    pub region: CloudRegionSpec,
}

/// Database request for overwriting a region's scalar fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudRegionUpdateDBRequest {
    pub endpoint: String,
    pub identity_endpoint: String,
    pub storage_endpoint: String,
    pub config: ConfigMap,
}

/// Database response for a cloud region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudRegionDBResponse {
    pub id: CloudRegionId,
    pub cloud_name: String,
    pub name: String,
    pub endpoint: String,
    pub identity_endpoint: String,
    pub storage_endpoint: String,
    pub config: ConfigMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cloud: Option<Box<CloudDBResponse>>,
    /// Ordered by descending priority, then controller name.
    pub controllers: Vec<ControllerPriorityDBResponse>,
}

/// Link between a cloud region and a controller able to host models in it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerPriorityDBResponse {
    pub id: i64,
    pub cloud_region_id: CloudRegionId,
    pub controller_id: ControllerId,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Loaded when reached from a region.
    pub controller: Option<Box<ControllerDBResponse>>,
    /// Loaded when reached from a controller.
    pub cloud_region: Option<Box<CloudRegionDBResponse>>,
}
