//! Database repository for controllers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::types::Json;
use sqlx::{Acquire, FromRow, PgConnection};
use tracing::instrument;
use uuid::Uuid;

use crate::db::context::OpContext;
use crate::db::database::Database;
use crate::db::errors::{DbError, Failure, Result, Subject};
use crate::db::handlers::cloud_regions::{load_priorities_for_controllers, merge_priority, region_id, region_subject};
use crate::db::handlers::repository::Repository;
use crate::db::models::ConfigMap;
use crate::db::models::clouds::ControllerPriorityDBResponse;
use crate::db::models::controllers::{
    ControllerCreateDBRequest, ControllerDBResponse, ControllerUpdateDBRequest, HostPort,
};
use crate::db::models::models::ModelDBResponse;
use crate::db::preload::{self, Hydrate, PreloadGraph};
use crate::types::{CloudRegionKey, ControllerId, ControllerKey, EntityKind, abbrev_uuid};

const CONTROLLER_COLUMNS: &str = "id, name, uuid, admin_user, admin_password, ca_certificate, public_address, \
                                  cloud_name, cloud_region, deprecated, agent_version, addresses, unavailable_since, \
                                  config, created_at, updated_at";

// Database entity model
#[derive(Debug, Clone, FromRow)]
pub(crate) struct Controller {
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
    pub addresses: Json<Vec<HostPort>>,
    pub unavailable_since: Option<DateTime<Utc>>,
    pub config: Json<ConfigMap>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Controller> for ControllerDBResponse {
    fn from(src: Controller) -> Self {
        Self {
            id: src.id,
            name: src.name,
            uuid: src.uuid,
            admin_user: src.admin_user,
            admin_password: src.admin_password,
            ca_certificate: src.ca_certificate,
            public_address: src.public_address,
            cloud_name: src.cloud_name,
            cloud_region: src.cloud_region,
            deprecated: src.deprecated,
            agent_version: src.agent_version,
            addresses: src.addresses.0,
            unavailable_since: src.unavailable_since,
            config: src.config.0,
            created_at: src.created_at,
            updated_at: src.updated_at,
            cloud_regions: Vec::new(),
        }
    }
}

impl Hydrate for Controller {
    type Entity = ControllerDBResponse;

    const KIND: EntityKind = EntityKind::Controller;

    fn hydrate<'a>(
        conn: &'a mut PgConnection,
        rows: Vec<Self>,
        graph: &'a PreloadGraph,
    ) -> BoxFuture<'a, sqlx::Result<Vec<Self::Entity>>> {
        hydrate_controllers(conn, rows, graph)
    }
}

fn hydrate_controllers<'a>(
    conn: &'a mut PgConnection,
    rows: Vec<Controller>,
    graph: &'a PreloadGraph,
) -> BoxFuture<'a, sqlx::Result<Vec<ControllerDBResponse>>> {
    async move {
        let mut controllers: Vec<ControllerDBResponse> = rows.into_iter().map(Into::into).collect();
        if controllers.is_empty() || !graph.contains("cloud_regions") {
            return Ok(controllers);
        }

        let ids: Vec<ControllerId> = controllers.iter().map(|c| c.id).collect();
        let priorities = load_priorities_for_controllers(&mut *conn, &ids, &graph.nested("cloud_regions")).await?;
        let mut by_controller: HashMap<ControllerId, Vec<ControllerPriorityDBResponse>> = HashMap::new();
        for priority in priorities {
            by_controller.entry(priority.controller_id).or_default().push(priority);
        }
        for controller in &mut controllers {
            controller.cloud_regions = by_controller.remove(&controller.id).unwrap_or_default();
        }
        Ok(controllers)
    }
    .boxed()
}

pub(crate) async fn load_controllers_by_ids(
    conn: &mut PgConnection,
    ids: &[ControllerId],
    graph: &PreloadGraph,
) -> sqlx::Result<Vec<ControllerDBResponse>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!("SELECT {CONTROLLER_COLUMNS} FROM controllers WHERE id = ANY($1) ORDER BY id");
    let rows = sqlx::query_as::<_, Controller>(&sql).bind(ids).fetch_all(&mut *conn).await?;
    hydrate_controllers(conn, rows, graph).await
}

pub(crate) async fn controller_id(conn: &mut PgConnection, key: &ControllerKey) -> sqlx::Result<ControllerId> {
    match key {
        ControllerKey::Uuid(uuid) => {
            sqlx::query_scalar("SELECT id FROM controllers WHERE uuid = $1")
                .bind(uuid)
                .fetch_one(conn)
                .await
        }
        ControllerKey::Name(name) => {
            sqlx::query_scalar("SELECT id FROM controllers WHERE name = $1")
                .bind(name)
                .fetch_one(conn)
                .await
        }
    }
}

async fn fetch_controller(conn: &mut PgConnection, id: ControllerId) -> sqlx::Result<ControllerDBResponse> {
    let mut controllers = load_controllers_by_ids(conn, &[id], &preload::controller("")).await?;
    controllers.pop().ok_or(sqlx::Error::RowNotFound)
}

pub(crate) fn controller_subject(key: &ControllerKey) -> Subject {
    match key {
        ControllerKey::Uuid(uuid) => Subject::key(EntityKind::Controller, uuid.to_string()),
        ControllerKey::Name(name) => Subject::key(EntityKind::Controller, name),
    }
}

pub struct Controllers<'d> {
    db: &'d Database,
}

impl<'d> Controllers<'d> {
    pub fn new(db: &'d Database) -> Self {
        Self { db }
    }

    /// Visit every controller in name order.
    pub async fn for_each<F, E>(&self, ctx: &OpContext, f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&ControllerDBResponse) -> std::result::Result<(), E>,
        E: From<DbError>,
    {
        let sql = format!(
            "SELECT {CONTROLLER_COLUMNS} FROM controllers
             WHERE $1::text IS NULL OR name > $1
             ORDER BY name LIMIT $2"
        );
        let page = |last: Option<&Controller>, limit: i64| {
            sqlx::query_as::<_, Controller>(&sql)
                .bind(last.map(|c| c.name.clone()))
                .bind(limit)
        };
        self.db
            .iterate(ctx, "controllers.for_each", page, &preload::controller(""), f)
            .await
    }

    /// Visit every model hosted on `controller`, in creation order.
    ///
    /// An unknown controller hosts nothing, so the callback is never invoked.
    pub async fn for_each_model<F, E>(&self, ctx: &OpContext, controller: &ControllerKey, f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&ModelDBResponse) -> std::result::Result<(), E>,
        E: From<DbError>,
    {
        self.db.models().for_each_on_controller(ctx, controller, f).await
    }
}

#[async_trait::async_trait]
impl<'d> Repository for Controllers<'d> {
    type CreateRequest = ControllerCreateDBRequest;
    type UpdateRequest = ControllerUpdateDBRequest;
    type Response = ControllerDBResponse;
    type Key = ControllerKey;

    /// Insert a controller with its region priorities. The hosting region and every region in
    /// `region_priorities` must already exist.
    #[instrument(skip(self, ctx, request), fields(name = %request.name, uuid = %abbrev_uuid(&request.uuid)), err)]
    async fn add(&self, ctx: &OpContext, request: &Self::CreateRequest) -> Result<Self::Response> {
        let subject = Subject::key(EntityKind::Controller, &request.name);

        self.db
            .run_with(ctx, "controllers.add", &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;

                let hosting = CloudRegionKey::new(&request.cloud_name, &request.cloud_region);
                region_id(&mut tx, &hosting).await.map_err(Failure::at(region_subject(&hosting)))?;
                let id: ControllerId = sqlx::query_scalar(
                    "INSERT INTO controllers (name, uuid, admin_user, admin_password, ca_certificate, public_address,
                                              cloud_name, cloud_region, deprecated, agent_version, addresses,
                                              unavailable_since, config)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                     RETURNING id",
                )
                .bind(&request.name)
                .bind(request.uuid)
                .bind(&request.admin_user)
                .bind(&request.admin_password)
                .bind(&request.ca_certificate)
                .bind(&request.public_address)
                .bind(&request.cloud_name)
                .bind(&request.cloud_region)
                .bind(request.deprecated)
                .bind(&request.agent_version)
                .bind(Json(&request.addresses))
                .bind(request.unavailable_since)
                .bind(Json(&request.config))
                .fetch_one(&mut *tx)
                .await?;

                for spec in &request.region_priorities {
                    let region = region_id(&mut tx, &spec.region)
                        .await
                        .map_err(Failure::at(region_subject(&spec.region)))?;
                    merge_priority(&mut tx, region, id, spec.priority).await?;
                }

                let controller = fetch_controller(&mut tx, id).await?;
                tx.commit().await?;
                Ok(controller)
            })
            .await
    }

    #[instrument(skip(self, ctx), fields(controller = %key), err)]
    async fn get(&self, ctx: &OpContext, key: &Self::Key) -> Result<Self::Response> {
        let subject = controller_subject(key);

        self.db
            .run(ctx, "controllers.get", &subject, async {
                let mut conn = self.db.acquire().await?;
                let id = controller_id(&mut conn, key).await?;
                fetch_controller(&mut conn, id).await
            })
            .await
    }

    #[instrument(skip(self, ctx, request), fields(controller = %key), err)]
    async fn update(&self, ctx: &OpContext, key: &Self::Key, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let subject = controller_subject(key);

        self.db
            .run(ctx, "controllers.update", &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;
                let id = controller_id(&mut tx, key).await?;
                sqlx::query(
                    "UPDATE controllers SET
                        admin_user = $2,
                        admin_password = $3,
                        ca_certificate = $4,
                        public_address = $5,
                        deprecated = $6,
                        agent_version = $7,
                        addresses = $8,
                        unavailable_since = $9,
                        config = $10,
                        updated_at = NOW()
                     WHERE id = $1",
                )
                .bind(id)
                .bind(&request.admin_user)
                .bind(&request.admin_password)
                .bind(&request.ca_certificate)
                .bind(&request.public_address)
                .bind(request.deprecated)
                .bind(&request.agent_version)
                .bind(Json(&request.addresses))
                .bind(request.unavailable_since)
                .bind(Json(&request.config))
                .execute(&mut *tx)
                .await?;
                let controller = fetch_controller(&mut tx, id).await?;
                tx.commit().await?;
                Ok(controller)
            })
            .await
    }

    /// Delete a controller and its region links. Fails Internal while it still hosts models.
    #[instrument(skip(self, ctx), fields(controller = %key), err)]
    async fn delete(&self, ctx: &OpContext, key: &Self::Key) -> Result<()> {
        let subject = controller_subject(key);

        self.db
            .run(ctx, "controllers.delete", &subject, async {
                let mut conn = self.db.acquire().await?;
                let id = controller_id(&mut conn, key).await?;
                sqlx::query("DELETE FROM controllers WHERE id = $1")
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::errors::ErrorCode;
    use crate::db::models::controllers::{Availability, RegionPrioritySpec};
    use crate::db::models::clouds::{PRIORITY_DEPLOYED, PRIORITY_SUPPORTED};
    use crate::test_utils::{
        create_test_cloud, create_test_controller, create_test_credential, create_test_model, migrated_database,
    };
    use sqlx::PgPool;

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_controller_lifecycle_by_uuid(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();
        create_test_cloud(&db, "test-cloud", &["test-region"]).await;

        let uuid = Uuid::new_v4();
        let request = ControllerCreateDBRequest::new("c1", uuid, "test-cloud", "test-region");
        let added = db.controllers().add(&ctx, &request).await.unwrap();

        let fetched = db.controllers().get(&ctx, &ControllerKey::Uuid(uuid)).await.unwrap();
        assert_eq!(fetched.cloud_name, "test-cloud");
        assert_eq!(fetched.cloud_region, "test-region");
        assert_eq!(added, fetched);

        db.controllers().delete(&ctx, &ControllerKey::Uuid(uuid)).await.unwrap();
        let err = db.controllers().get(&ctx, &ControllerKey::Uuid(uuid)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_add_duplicate_name_or_uuid(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();
        create_test_cloud(&db, "test-cloud", &["test-region"]).await;
        let existing = create_test_controller(&db, "c1", "test-cloud", "test-region").await;

        let same_name = ControllerCreateDBRequest::new("c1", Uuid::new_v4(), "test-cloud", "test-region");
        let err = db.controllers().add(&ctx, &same_name).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);
        assert!(err.to_string().contains("c1"), "{err}");

        let same_uuid = ControllerCreateDBRequest::new("c2", existing.uuid, "test-cloud", "test-region");
        let err = db.controllers().add(&ctx, &same_uuid).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);
        assert!(err.to_string().contains(&existing.uuid.to_string()), "{err}");
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_add_in_missing_region_is_not_found(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();
        create_test_cloud(&db, "test-cloud", &["test-region"]).await;

        let request = ControllerCreateDBRequest::new("c1", Uuid::new_v4(), "test-cloud", "nowhere");
        let err = db.controllers().add(&ctx, &request).await.unwrap_err();
        assert!(
            matches!(&err, DbError::NotFound { entity: EntityKind::CloudRegion, key, .. } if key == "test-cloud/nowhere"),
            "{err}"
        );
        assert!(err.to_string().contains("test-cloud/nowhere"), "{err}");
        assert!(!err.to_string().contains("c1"), "{err}");
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_add_with_region_priorities(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();
        create_test_cloud(&db, "test-cloud", &["r1", "r2"]).await;

        let request = ControllerCreateDBRequest {
            region_priorities: vec![
                RegionPrioritySpec {
                    region: CloudRegionKey::new("test-cloud", "r2"),
                    priority: PRIORITY_SUPPORTED,
                },
                RegionPrioritySpec {
                    region: CloudRegionKey::new("test-cloud", "r1"),
                    priority: PRIORITY_DEPLOYED,
                },
            ],
            ..ControllerCreateDBRequest::new("c1", Uuid::new_v4(), "test-cloud", "r1")
        };
        let controller = db.controllers().add(&ctx, &request).await.unwrap();

        let regions: Vec<(&str, i32)> = controller
            .cloud_regions
            .iter()
            .map(|p| (p.cloud_region.as_ref().unwrap().name.as_str(), p.priority))
            .collect();
        assert_eq!(regions, vec![("r1", PRIORITY_DEPLOYED), ("r2", PRIORITY_SUPPORTED)]);
        // Regions reached from a controller carry their cloud
        let region = controller.cloud_regions[0].cloud_region.as_ref().unwrap();
        assert_eq!(region.cloud.as_ref().unwrap().name, "test-cloud");
        assert!(region.controllers.is_empty());

        // A bad priority region rolls back the whole add
        let bad = ControllerCreateDBRequest {
            region_priorities: vec![RegionPrioritySpec {
                region: CloudRegionKey::new("test-cloud", "nowhere"),
                priority: PRIORITY_SUPPORTED,
            }],
            ..ControllerCreateDBRequest::new("c2", Uuid::new_v4(), "test-cloud", "r1")
        };
        let err = db.controllers().add(&ctx, &bad).await.unwrap_err();
        assert!(
            matches!(&err, DbError::NotFound { entity: EntityKind::CloudRegion, key, .. } if key == "test-cloud/nowhere"),
            "{err}"
        );
        let err = db
            .controllers()
            .get(&ctx, &ControllerKey::Name("c2".to_string()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_update_and_availability(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();
        create_test_cloud(&db, "test-cloud", &["test-region"]).await;
        let controller = create_test_controller(&db, "c1", "test-cloud", "test-region").await;
        assert_eq!(controller.availability(), Availability::Available);

        let key = ControllerKey::Name("c1".to_string());
        let update = ControllerUpdateDBRequest {
            deprecated: true,
            agent_version: "3.5.1".to_string(),
            addresses: vec![HostPort {
                value: "10.0.0.1".to_string(),
                port: 17070,
                scope: "local-cloud".to_string(),
            }],
            ..ControllerUpdateDBRequest::from(&controller)
        };
        let updated = db.controllers().update(&ctx, &key, &update).await.unwrap();
        assert_eq!(updated.agent_version, "3.5.1");
        assert_eq!(updated.addresses.len(), 1);
        assert_eq!(updated.addresses[0].port, 17070);
        assert_eq!(updated.availability(), Availability::Deprecated);

        let update = ControllerUpdateDBRequest {
            unavailable_since: Some(Utc::now()),
            ..ControllerUpdateDBRequest::from(&updated)
        };
        let updated = db.controllers().update(&ctx, &key, &update).await.unwrap();
        assert_eq!(updated.availability(), Availability::Unavailable);

        let missing = ControllerKey::Name("missing".to_string());
        assert!(db.controllers().update(&ctx, &missing, &update).await.unwrap_err().is_not_found());
        assert!(db.controllers().delete(&ctx, &missing).await.unwrap_err().is_not_found());
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_delete_controller_hosting_models_fails(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();
        create_test_cloud(&db, "test-cloud", &["test-region"]).await;
        let controller = create_test_controller(&db, "c1", "test-cloud", "test-region").await;
        let credential = create_test_credential(&db, "test-cloud", "alice@example.com", "cred").await;
        create_test_model(&db, "m1", "alice@example.com", &controller, &credential).await;

        let err = db
            .controllers()
            .delete(&ctx, &ControllerKey::Uuid(controller.uuid))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_for_each_in_name_order(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();
        create_test_cloud(&db, "test-cloud", &["test-region"]).await;
        for name in ["zeta", "alpha", "mu"] {
            create_test_controller(&db, name, "test-cloud", "test-region").await;
        }

        let mut seen = Vec::new();
        db.controllers()
            .for_each(&ctx, |c| {
                seen.push(c.name.clone());
                Ok::<_, DbError>(())
            })
            .await
            .unwrap();
        assert_eq!(seen, vec!["alpha", "mu", "zeta"]);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_for_each_model(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();
        create_test_cloud(&db, "test-cloud", &["test-region"]).await;
        let c1 = create_test_controller(&db, "c1", "test-cloud", "test-region").await;
        let c2 = create_test_controller(&db, "c2", "test-cloud", "test-region").await;
        let credential = create_test_credential(&db, "test-cloud", "alice@example.com", "cred").await;
        create_test_model(&db, "m1", "alice@example.com", &c1, &credential).await;
        create_test_model(&db, "m2", "alice@example.com", &c2, &credential).await;
        create_test_model(&db, "m3", "alice@example.com", &c1, &credential).await;

        let mut seen = Vec::new();
        db.controllers()
            .for_each_model(&ctx, &ControllerKey::Name("c1".to_string()), |m| {
                seen.push(m.name.clone());
                Ok::<_, DbError>(())
            })
            .await
            .unwrap();
        assert_eq!(seen, vec!["m1", "m3"]);

        let mut none = 0;
        db.controllers()
            .for_each_model(&ctx, &ControllerKey::Uuid(Uuid::new_v4()), |_| {
                none += 1;
                Ok::<_, DbError>(())
            })
            .await
            .unwrap();
        assert_eq!(none, 0);
    }
}
