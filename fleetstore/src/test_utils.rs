//! Test utilities for integration testing (available with `test-utils` feature).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sqlx::PgPool;
use tracing::instrument::WithSubscriber;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use uuid::Uuid;

use crate::db::context::OpContext;
use crate::db::handlers::repository::Repository;
use crate::db::models::cloud_credentials::{CloudCredentialCreateDBRequest, CloudCredentialDBResponse};
use crate::db::models::clouds::{CloudCreateDBRequest, CloudDBResponse, CloudRegionSpec};
use crate::db::models::controllers::{ControllerCreateDBRequest, ControllerDBResponse};
use crate::db::models::models::{ModelCreateDBRequest, ModelDBResponse};
use crate::db::{Database, StoreSettings};
use crate::types::CloudRegionKey;

/// A store on `pool` with the schema applied and default settings.
pub async fn migrated_database(pool: PgPool) -> Database {
    migrated_database_with(pool, StoreSettings::default()).await
}

pub async fn migrated_database_with(pool: PgPool, settings: StoreSettings) -> Database {
    let db = Database::new(pool, settings);
    db.migrate(&OpContext::background(), false)
        .await
        .expect("Failed to migrate test database");
    db
}

pub async fn create_test_cloud(db: &Database, name: &str, regions: &[&str]) -> CloudDBResponse {
    let request = CloudCreateDBRequest {
        name: name.to_string(),
        provider_type: "ec2".to_string(),
        auth_types: vec!["access-key".to_string()],
        endpoint: format!("https://{name}.example.com"),
        regions: regions.iter().map(|r| CloudRegionSpec::named(*r)).collect(),
        ..Default::default()
    };
    db.clouds()
        .add(&OpContext::background(), &request)
        .await
        .expect("Failed to create test cloud")
}

pub async fn create_test_controller(db: &Database, name: &str, cloud: &str, region: &str) -> ControllerDBResponse {
    let mut request = ControllerCreateDBRequest::new(name, Uuid::new_v4(), cloud, region);
    request.admin_user = "admin".to_string();
    request.agent_version = "3.6.0".to_string();
    db.controllers()
        .add(&OpContext::background(), &request)
        .await
        .expect("Failed to create test controller")
}

pub async fn create_test_credential(db: &Database, cloud: &str, owner: &str, name: &str) -> CloudCredentialDBResponse {
    let request = CloudCredentialCreateDBRequest {
        cloud_name: cloud.to_string(),
        owner_identity_name: owner.to_string(),
        name: name.to_string(),
        auth_type: "access-key".to_string(),
        ..Default::default()
    };
    db.cloud_credentials()
        .add(&OpContext::background(), &request)
        .await
        .expect("Failed to create test credential")
}

/// An unprovisioned model in the region hosting `controller`.
pub async fn create_test_model(
    db: &Database,
    name: &str,
    owner: &str,
    controller: &ControllerDBResponse,
    credential: &CloudCredentialDBResponse,
) -> ModelDBResponse {
    let ctx = OpContext::background();
    let region = db
        .cloud_regions()
        .get(&ctx, &CloudRegionKey::new(&controller.cloud_name, &controller.cloud_region))
        .await
        .expect("Failed to look up controller region");
    let request = ModelCreateDBRequest::new(name, owner, controller.id, region.id, credential.id);
    db.models().add(&ctx, &request).await.expect("Failed to create test model")
}

/// Counts the statements sqlx logs under the `sqlx::query` target.
#[derive(Clone, Default)]
pub struct QueryCounter(Arc<AtomicUsize>);

impl QueryCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

impl<S: Subscriber> Layer<S> for QueryCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() == "sqlx::query" {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Run `fut` and report how many statements it sent to the database.
pub async fn count_queries<F: Future>(fut: F) -> (F::Output, usize) {
    let counter = QueryCounter::default();
    let subscriber = tracing_subscriber::registry().with(counter.clone());
    let output = fut.with_subscriber(subscriber).await;
    (output, counter.get())
}
