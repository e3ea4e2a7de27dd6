//! Database models for models hosted on controllers.

use crate::db::models::access::AccessGrant;
use crate::db::models::cloud_credentials::CloudCredentialDBResponse;
use crate::db::models::clouds::CloudRegionDBResponse;
use crate::db::models::controllers::ControllerDBResponse;
use crate::db::models::identities::IdentityDBResponse;
use crate::types::{CloudCredentialId, CloudRegionId, ControllerId, ModelId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Life cycle of a model as reported by its controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Life {
    #[default]
    Alive,
    Dying,
    Dead,
    MigratingInternal,
    MigratingAway,
}

/// Last status reported for a model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub status: String,
    pub info: String,
    pub since: Option<DateTime<Utc>>,
    pub version: String,
}

/// Support level agreement for a model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sla {
    pub level: String,
    pub owner: String,
}

/// Database request for creating a new model.
///
/// The caller is responsible for choosing a region and credential on the same cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCreateDBRequest {
    /// `None` until the controller has provisioned the model.
    pub uuid: Option<Uuid>,
    pub name: String,
    pub owner_identity_name: String,
    pub controller_id: ControllerId,
    pub cloud_region_id: CloudRegionId,
    pub cloud_credential_id: CloudCredentialId,
    pub model_type: String,
    pub is_controller: bool,
    pub default_series: String,
    pub life: Life,
    pub status: ModelStatus,
    pub sla: Sla,
    pub cores: i64,
    pub machines: i64,
    pub units: i64,
}

impl ModelCreateDBRequest {
    pub fn new(
        name: impl Into<String>,
        owner_identity_name: impl Into<String>,
        controller_id: ControllerId,
        cloud_region_id: CloudRegionId,
        cloud_credential_id: CloudCredentialId,
    ) -> Self {
        Self {
            uuid: None,
            name: name.into(),
            owner_identity_name: owner_identity_name.into(),
            controller_id,
            cloud_region_id,
            cloud_credential_id,
            model_type: String::new(),
            is_controller: false,
            default_series: String::new(),
            life: Life::Alive,
            status: ModelStatus::default(),
            sla: Sla::default(),
            cores: 0,
            machines: 0,
            units: 0,
        }
    }
}

/// Database request for overwriting a model's scalar fields.
///
/// Name and owner are fixed at creation; the controller and credential may change when a model
/// is migrated or its credential replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdateDBRequest {
    pub uuid: Option<Uuid>,
    pub controller_id: ControllerId,
    pub cloud_credential_id: CloudCredentialId,
    pub model_type: String,
    pub is_controller: bool,
    pub default_series: String,
    pub life: Life,
    pub status: ModelStatus,
    pub sla: Sla,
    pub cores: i64,
    pub machines: i64,
    pub units: i64,
}

impl From<&ModelDBResponse> for ModelUpdateDBRequest {
    fn from(model: &ModelDBResponse) -> Self {
        Self {
            uuid: model.uuid,
            controller_id: model.controller_id,
            cloud_credential_id: model.cloud_credential_id,
            model_type: model.model_type.clone(),
            is_controller: model.is_controller,
            default_series: model.default_series.clone(),
            life: model.life,
            status: model.status.clone(),
            sla: model.sla.clone(),
            cores: model.cores,
            machines: model.machines,
            units: model.units,
        }
    }
}

/// Database response for a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDBResponse {
    pub id: ModelId,
    pub uuid: Option<Uuid>,
    pub name: String,
    pub owner_identity_name: String,
    pub controller_id: ControllerId,
    pub cloud_region_id: CloudRegionId,
    pub cloud_credential_id: CloudCredentialId,
    pub model_type: String,
    pub is_controller: bool,
    pub default_series: String,
    pub life: Life,
    pub status: ModelStatus,
    pub sla: Sla,
    pub cores: i64,
    pub machines: i64,
    pub units: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner: Option<IdentityDBResponse>,
    pub controller: Option<ControllerDBResponse>,
    pub cloud_region: Option<CloudRegionDBResponse>,
    pub cloud_credential: Option<CloudCredentialDBResponse>,
    pub grants: Vec<AccessGrant>,
}
