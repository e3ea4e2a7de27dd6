//! Database repository for models.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::{Acquire, FromRow, PgConnection};
use tracing::instrument;
use uuid::Uuid;

use crate::db::context::OpContext;
use crate::db::database::Database;
use crate::db::errors::{DbError, Result, Subject};
use crate::db::handlers::cloud_credentials::load_cloud_credentials_by_ids;
use crate::db::handlers::cloud_regions::load_regions_by_ids;
use crate::db::handlers::controllers::load_controllers_by_ids;
use crate::db::handlers::grants::{GrantTable, load_grants, set_grant};
use crate::db::handlers::identities::{ensure_identity, load_identities_map};
use crate::db::handlers::repository::Repository;
use crate::db::models::access::AccessLevel;
use crate::db::models::identities::sanitise_identity_name;
use crate::db::models::models::{Life, ModelCreateDBRequest, ModelDBResponse, ModelStatus, ModelUpdateDBRequest, Sla};
use crate::db::preload::{self, Hydrate, PreloadGraph};
use crate::types::{CloudCredentialId, CloudRegionId, ControllerId, ControllerKey, EntityKind, ModelId, ModelKey};

const MODEL_COLUMNS: &str = "m.id, m.uuid, m.name, m.owner_identity_name, m.controller_id, m.cloud_region_id, \
                             m.cloud_credential_id, m.model_type, m.is_controller, m.default_series, m.life, \
                             m.status, m.status_info, m.status_since, m.status_version, m.sla_level, m.sla_owner, \
                             m.cores, m.machines, m.units, m.created_at, m.updated_at";

// Database entity model
#[derive(Debug, Clone, FromRow)]
pub(crate) struct Model {
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
    pub status: String,
    pub status_info: String,
    pub status_since: Option<DateTime<Utc>>,
    pub status_version: String,
    pub sla_level: String,
    pub sla_owner: String,
    pub cores: i64,
    pub machines: i64,
    pub units: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Model> for ModelDBResponse {
    fn from(src: Model) -> Self {
        Self {
            id: src.id,
            uuid: src.uuid,
            name: src.name,
            owner_identity_name: src.owner_identity_name,
            controller_id: src.controller_id,
            cloud_region_id: src.cloud_region_id,
            cloud_credential_id: src.cloud_credential_id,
            model_type: src.model_type,
            is_controller: src.is_controller,
            default_series: src.default_series,
            life: src.life,
            status: ModelStatus {
                status: src.status,
                info: src.status_info,
                since: src.status_since,
                version: src.status_version,
            },
            sla: Sla {
                level: src.sla_level,
                owner: src.sla_owner,
            },
            cores: src.cores,
            machines: src.machines,
            units: src.units,
            created_at: src.created_at,
            updated_at: src.updated_at,
            owner: None,
            controller: None,
            cloud_region: None,
            cloud_credential: None,
            grants: Vec::new(),
        }
    }
}

impl Hydrate for Model {
    type Entity = ModelDBResponse;

    const KIND: EntityKind = EntityKind::Model;

    fn hydrate<'a>(
        conn: &'a mut PgConnection,
        rows: Vec<Self>,
        graph: &'a PreloadGraph,
    ) -> BoxFuture<'a, sqlx::Result<Vec<Self::Entity>>> {
        hydrate_models(conn, rows, graph)
    }
}

fn distinct<T: Ord + Copy>(values: impl Iterator<Item = T>) -> Vec<T> {
    let mut values: Vec<T> = values.collect();
    values.sort_unstable();
    values.dedup();
    values
}

fn hydrate_models<'a>(
    conn: &'a mut PgConnection,
    rows: Vec<Model>,
    graph: &'a PreloadGraph,
) -> BoxFuture<'a, sqlx::Result<Vec<ModelDBResponse>>> {
    async move {
        let mut models: Vec<ModelDBResponse> = rows.into_iter().map(Into::into).collect();
        if models.is_empty() {
            return Ok(models);
        }

        if graph.contains("owner") {
            let owners = load_identities_map(&mut *conn, models.iter().map(|m| m.owner_identity_name.clone())).await?;
            for model in &mut models {
                model.owner = owners.get(&model.owner_identity_name).cloned();
            }
        }

        if graph.contains("controller") {
            let ids = distinct(models.iter().map(|m| m.controller_id));
            let controllers: HashMap<ControllerId, _> =
                load_controllers_by_ids(&mut *conn, &ids, &graph.nested("controller"))
                    .await?
                    .into_iter()
                    .map(|c| (c.id, c))
                    .collect();
            for model in &mut models {
                model.controller = controllers.get(&model.controller_id).cloned();
            }
        }

        if graph.contains("cloud_credential") {
            let ids = distinct(models.iter().map(|m| m.cloud_credential_id));
            let credentials: HashMap<CloudCredentialId, _> =
                load_cloud_credentials_by_ids(&mut *conn, &ids, &graph.nested("cloud_credential"))
                    .await?
                    .into_iter()
                    .map(|c| (c.id, c))
                    .collect();
            for model in &mut models {
                model.cloud_credential = credentials.get(&model.cloud_credential_id).cloned();
            }
        }

        if graph.contains("cloud_region") {
            let ids = distinct(models.iter().map(|m| m.cloud_region_id));
            let regions: HashMap<CloudRegionId, _> = load_regions_by_ids(&mut *conn, &ids, &graph.nested("cloud_region"))
                .await?
                .into_iter()
                .map(|r| (r.id, r))
                .collect();
            for model in &mut models {
                model.cloud_region = regions.get(&model.cloud_region_id).cloned();
            }
        }

        if graph.contains("grants") {
            let ids: Vec<ModelId> = models.iter().map(|m| m.id).collect();
            let mut grants = load_grants(&mut *conn, GrantTable::Model, &ids, &graph.nested("grants")).await?;
            for model in &mut models {
                model.grants = grants.remove(&model.id).unwrap_or_default();
            }
        }

        Ok(models)
    }
    .boxed()
}

pub(crate) async fn load_models_by_ids(
    conn: &mut PgConnection,
    ids: &[ModelId],
    graph: &PreloadGraph,
) -> sqlx::Result<Vec<ModelDBResponse>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!("SELECT {MODEL_COLUMNS} FROM models m WHERE m.id = ANY($1) ORDER BY m.id");
    let rows = sqlx::query_as::<_, Model>(&sql).bind(ids).fetch_all(&mut *conn).await?;
    hydrate_models(conn, rows, graph).await
}

async fn fetch_model(conn: &mut PgConnection, id: ModelId) -> sqlx::Result<ModelDBResponse> {
    let mut models = load_models_by_ids(conn, &[id], &preload::model("")).await?;
    models.pop().ok_or(sqlx::Error::RowNotFound)
}

async fn model_id(conn: &mut PgConnection, key: &ModelKey) -> sqlx::Result<ModelId> {
    match key {
        ModelKey::Uuid(uuid) => {
            sqlx::query_scalar("SELECT id FROM models WHERE uuid = $1")
                .bind(uuid)
                .fetch_one(conn)
                .await
        }
        ModelKey::OwnerName { owner, name } => {
            sqlx::query_scalar("SELECT id FROM models WHERE owner_identity_name = $1 AND name = $2")
                .bind(owner)
                .bind(name)
                .fetch_one(conn)
                .await
        }
    }
}

/// The key with any owner sanitised, and the matching error subject.
fn resolve_key(key: &ModelKey) -> (ModelKey, Subject) {
    match key {
        ModelKey::Uuid(uuid) => (key.clone(), Subject::key(EntityKind::Model, uuid.to_string())),
        ModelKey::OwnerName { owner, name } => {
            let owner = sanitise_identity_name(owner);
            let subject = Subject::composite(EntityKind::Model, &[owner.as_str(), name.as_str()]);
            (ModelKey::owner_name(owner, name), subject)
        }
    }
}

pub struct Models<'d> {
    db: &'d Database,
}

impl<'d> Models<'d> {
    pub fn new(db: &'d Database) -> Self {
        Self { db }
    }

    /// Visit every model in creation order.
    pub async fn for_each<F, E>(&self, ctx: &OpContext, f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&ModelDBResponse) -> std::result::Result<(), E>,
        E: From<DbError>,
    {
        let sql = format!(
            "SELECT {MODEL_COLUMNS} FROM models m
             WHERE $1::bigint IS NULL OR m.id > $1
             ORDER BY m.id LIMIT $2"
        );
        let page = |last: Option<&Model>, limit: i64| {
            sqlx::query_as::<_, Model>(&sql)
                .bind(last.map(|m| m.id))
                .bind(limit)
        };
        self.db.iterate(ctx, "models.for_each", page, &preload::model(""), f).await
    }

    pub(crate) async fn for_each_on_controller<F, E>(
        &self,
        ctx: &OpContext,
        controller: &ControllerKey,
        f: F,
    ) -> std::result::Result<(), E>
    where
        F: FnMut(&ModelDBResponse) -> std::result::Result<(), E>,
        E: From<DbError>,
    {
        let column = match controller {
            ControllerKey::Uuid(_) => "uuid",
            ControllerKey::Name(_) => "name",
        };
        let sql = format!(
            "SELECT {MODEL_COLUMNS} FROM models m
             JOIN controllers c ON c.id = m.controller_id
             WHERE c.{column} = $1 AND ($2::bigint IS NULL OR m.id > $2)
             ORDER BY m.id LIMIT $3"
        );
        let page = |last: Option<&Model>, limit: i64| {
            let query = sqlx::query_as::<_, Model>(&sql);
            let query = match controller {
                ControllerKey::Uuid(uuid) => query.bind(*uuid),
                ControllerKey::Name(name) => query.bind(name.as_str()),
            };
            query.bind(last.map(|m| m.id)).bind(limit)
        };
        self.db
            .iterate(ctx, "controllers.for_each_model", page, &preload::model(""), f)
            .await
    }

    /// Models with any of the given UUIDs, in creation order. Unknown UUIDs are skipped.
    #[instrument(skip(self, ctx, uuids), fields(count = uuids.len()), err)]
    pub async fn get_by_uuids(&self, ctx: &OpContext, uuids: &[Uuid]) -> Result<Vec<ModelDBResponse>> {
        let subject = Subject::unchecked(EntityKind::Model, "*");

        self.db
            .run(ctx, "models.get_by_uuids", &subject, async {
                let mut conn = self.db.acquire().await?;
                let ids: Vec<ModelId> = sqlx::query_scalar("SELECT id FROM models WHERE uuid = ANY($1) ORDER BY id")
                    .bind(uuids)
                    .fetch_all(&mut *conn)
                    .await?;
                load_models_by_ids(&mut conn, &ids, &preload::model("")).await
            })
            .await
    }

    /// Models using the credential, in creation order.
    #[instrument(skip(self, ctx), err)]
    pub async fn using_credential(
        &self,
        ctx: &OpContext,
        credential_id: CloudCredentialId,
    ) -> Result<Vec<ModelDBResponse>> {
        let subject = Subject::unchecked(EntityKind::CloudCredential, credential_id);

        self.db
            .run(ctx, "models.using_credential", &subject, async {
                let mut conn = self.db.acquire().await?;
                let ids: Vec<ModelId> =
                    sqlx::query_scalar("SELECT id FROM models WHERE cloud_credential_id = $1 ORDER BY id")
                        .bind(credential_id)
                        .fetch_all(&mut *conn)
                        .await?;
                load_models_by_ids(&mut conn, &ids, &preload::model("")).await
            })
            .await
    }

    /// Set an identity's access to a model. `None` removes the grant.
    #[instrument(skip(self, ctx), fields(model = %key), err)]
    pub async fn update_grant(
        &self,
        ctx: &OpContext,
        key: &ModelKey,
        identity: &str,
        access: Option<AccessLevel>,
    ) -> Result<()> {
        let (key, subject) = resolve_key(key);
        let identity = sanitise_identity_name(identity);
        let default_access = self.db.settings().default_controller_access;

        self.db
            .run(ctx, "models.update_grant", &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;
                let id = model_id(&mut tx, &key).await?;
                set_grant(&mut tx, GrantTable::Model, id, &identity, access, default_access).await?;
                tx.commit().await
            })
            .await
    }

    /// Record when `identity` last connected to the model. Fails NotFound if it holds no grant.
    #[instrument(skip(self, ctx), fields(model = %key), err)]
    pub async fn touch_grant_connection(
        &self,
        ctx: &OpContext,
        key: &ModelKey,
        identity: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let (key, subject) = resolve_key(key);
        let identity = sanitise_identity_name(identity);

        self.db
            .run(ctx, "models.touch_grant_connection", &subject, async {
                let mut conn = self.db.acquire().await?;
                let id = model_id(&mut conn, &key).await?;
                let result = sqlx::query(
                    "UPDATE identity_model_access SET last_connection = $3, updated_at = NOW()
                     WHERE model_id = $1 AND identity_name = $2",
                )
                .bind(id)
                .bind(&identity)
                .bind(at)
                .execute(&mut *conn)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(sqlx::Error::RowNotFound);
                }
                Ok(())
            })
            .await
    }
}

#[async_trait::async_trait]
impl<'d> Repository for Models<'d> {
    type CreateRequest = ModelCreateDBRequest;
    type UpdateRequest = ModelUpdateDBRequest;
    type Response = ModelDBResponse;
    type Key = ModelKey;

    /// Insert a model, creating its owner if needed.
    #[instrument(skip(self, ctx, request), fields(owner = %request.owner_identity_name, name = %request.name), err)]
    async fn add(&self, ctx: &OpContext, request: &Self::CreateRequest) -> Result<Self::Response> {
        let owner = sanitise_identity_name(&request.owner_identity_name);
        let subject = Subject::composite(EntityKind::Model, &[owner.as_str(), request.name.as_str()]);
        let default_access = self.db.settings().default_controller_access;

        self.db
            .run(ctx, "models.add", &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;

                ensure_identity(&mut tx, &owner, default_access).await?;
                let id: ModelId = sqlx::query_scalar(
                    "INSERT INTO models (uuid, name, owner_identity_name, controller_id, cloud_region_id,
                                         cloud_credential_id, model_type, is_controller, default_series, life,
                                         status, status_info, status_since, status_version, sla_level, sla_owner,
                                         cores, machines, units)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
                     RETURNING id",
                )
                .bind(request.uuid)
                .bind(&request.name)
                .bind(&owner)
                .bind(request.controller_id)
                .bind(request.cloud_region_id)
                .bind(request.cloud_credential_id)
                .bind(&request.model_type)
                .bind(request.is_controller)
                .bind(&request.default_series)
                .bind(request.life)
                .bind(&request.status.status)
                .bind(&request.status.info)
                .bind(request.status.since)
                .bind(&request.status.version)
                .bind(&request.sla.level)
                .bind(&request.sla.owner)
                .bind(request.cores)
                .bind(request.machines)
                .bind(request.units)
                .fetch_one(&mut *tx)
                .await?;

                let model = fetch_model(&mut tx, id).await?;
                tx.commit().await?;
                Ok(model)
            })
            .await
    }

    #[instrument(skip(self, ctx), fields(model = %key), err)]
    async fn get(&self, ctx: &OpContext, key: &Self::Key) -> Result<Self::Response> {
        let (key, subject) = resolve_key(key);

        self.db
            .run(ctx, "models.get", &subject, async {
                let mut conn = self.db.acquire().await?;
                let id = model_id(&mut conn, &key).await?;
                fetch_model(&mut conn, id).await
            })
            .await
    }

    #[instrument(skip(self, ctx, request), fields(model = %key), err)]
    async fn update(&self, ctx: &OpContext, key: &Self::Key, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let (key, subject) = resolve_key(key);

        self.db
            .run(ctx, "models.update", &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;
                let id = model_id(&mut tx, &key).await?;
                sqlx::query(
                    "UPDATE models SET
                        uuid = $2,
                        controller_id = $3,
                        cloud_credential_id = $4,
                        model_type = $5,
                        is_controller = $6,
                        default_series = $7,
                        life = $8,
                        status = $9,
                        status_info = $10,
                        status_since = $11,
                        status_version = $12,
                        sla_level = $13,
                        sla_owner = $14,
                        cores = $15,
                        machines = $16,
                        units = $17,
                        updated_at = NOW()
                     WHERE id = $1",
                )
                .bind(id)
                .bind(request.uuid)
                .bind(request.controller_id)
                .bind(request.cloud_credential_id)
                .bind(&request.model_type)
                .bind(request.is_controller)
                .bind(&request.default_series)
                .bind(request.life)
                .bind(&request.status.status)
                .bind(&request.status.info)
                .bind(request.status.since)
                .bind(&request.status.version)
                .bind(&request.sla.level)
                .bind(&request.sla.owner)
                .bind(request.cores)
                .bind(request.machines)
                .bind(request.units)
                .execute(&mut *tx)
                .await?;
                let model = fetch_model(&mut tx, id).await?;
                tx.commit().await?;
                Ok(model)
            })
            .await
    }

    #[instrument(skip(self, ctx), fields(model = %key), err)]
    async fn delete(&self, ctx: &OpContext, key: &Self::Key) -> Result<()> {
        let (key, subject) = resolve_key(key);

        self.db
            .run(ctx, "models.delete", &subject, async {
                let mut conn = self.db.acquire().await?;
                let id = model_id(&mut conn, &key).await?;
                sqlx::query("DELETE FROM models WHERE id = $1")
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
    use crate::db::models::cloud_credentials::CloudCredentialDBResponse;
    use crate::db::models::controllers::ControllerDBResponse;
    use crate::test_utils::{
        create_test_cloud, create_test_controller, create_test_credential, create_test_model, migrated_database,
    };
    use sqlx::PgPool;

    async fn setup(db: &Database) -> (ControllerDBResponse, CloudCredentialDBResponse) {
        create_test_cloud(db, "test-cloud", &["test-region"]).await;
        let controller = create_test_controller(db, "c1", "test-cloud", "test-region").await;
        let credential = create_test_credential(db, "test-cloud", "alice@example.com", "cred").await;
        (controller, credential)
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_add_and_get_model_with_full_graph(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();
        let (controller, credential) = setup(&db).await;

        let uuid = Uuid::new_v4();
        let request = ModelCreateDBRequest {
            uuid: Some(uuid),
            life: Life::Alive,
            units: 3,
            ..ModelCreateDBRequest::new(
                "model-1",
                "alice@example.com",
                controller.id,
                controller_region_id(&db, &controller).await,
                credential.id,
            )
        };
        let added = db.models().add(&ctx, &request).await.unwrap();
        assert_eq!(added.units, 3);
        assert_eq!(added.owner.as_ref().unwrap().name, "alice@example.com");
        assert_eq!(added.controller.as_ref().unwrap().name, "c1");
        // Associations outside the declared graph stay empty
        assert!(added.controller.as_ref().unwrap().cloud_regions.is_empty());
        assert_eq!(added.cloud_credential.as_ref().unwrap().name, "cred");
        assert!(added.cloud_credential.as_ref().unwrap().cloud.is_none());
        let region = added.cloud_region.as_ref().unwrap();
        assert_eq!(region.name, "test-region");
        assert_eq!(region.cloud.as_ref().unwrap().name, "test-cloud");

        let by_uuid = db.models().get(&ctx, &ModelKey::Uuid(uuid)).await.unwrap();
        let by_name = db
            .models()
            .get(&ctx, &ModelKey::owner_name("alice@example.com", "model-1"))
            .await
            .unwrap();
        assert_eq!(by_uuid, added);
        assert_eq!(by_name, added);

        let err = db.models().add(&ctx, &request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);
    }

    async fn controller_region_id(db: &Database, controller: &ControllerDBResponse) -> CloudRegionId {
        let key = crate::types::CloudRegionKey::new(&controller.cloud_name, &controller.cloud_region);
        db.cloud_regions().get(&OpContext::background(), &key).await.unwrap().id
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_unprovisioned_models_have_no_uuid(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();
        let (controller, credential) = setup(&db).await;

        // Several models may await a UUID at once
        let a = create_test_model(&db, "a", "alice@example.com", &controller, &credential).await;
        let b = create_test_model(&db, "b", "alice@example.com", &controller, &credential).await;
        assert!(a.uuid.is_none());
        assert!(b.uuid.is_none());

        let uuid = Uuid::new_v4();
        let update = ModelUpdateDBRequest {
            uuid: Some(uuid),
            life: Life::Dying,
            ..ModelUpdateDBRequest::from(&a)
        };
        let updated = db
            .models()
            .update(&ctx, &ModelKey::owner_name("alice@example.com", "a"), &update)
            .await
            .unwrap();
        assert_eq!(updated.uuid, Some(uuid));
        assert_eq!(updated.life, Life::Dying);
        assert_eq!(db.models().get(&ctx, &ModelKey::Uuid(uuid)).await.unwrap().id, a.id);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_get_missing_and_delete(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();
        let (controller, credential) = setup(&db).await;
        create_test_model(&db, "m", "alice@example.com", &controller, &credential).await;

        let key = ModelKey::owner_name("alice@example.com", "m");
        db.models().delete(&ctx, &key).await.unwrap();
        assert!(db.models().get(&ctx, &key).await.unwrap_err().is_not_found());
        assert!(db.models().delete(&ctx, &key).await.unwrap_err().is_not_found());
        assert!(
            db.models()
                .get(&ctx, &ModelKey::owner_name("", "m"))
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_get_by_uuids_and_using_credential(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();
        let (controller, credential) = setup(&db).await;
        let other = create_test_credential(&db, "test-cloud", "alice@example.com", "other").await;

        let mut uuids = Vec::new();
        for (name, cred) in [("m1", &credential), ("m2", &other), ("m3", &credential)] {
            let model = create_test_model(&db, name, "alice@example.com", &controller, cred).await;
            let uuid = Uuid::new_v4();
            let update = ModelUpdateDBRequest {
                uuid: Some(uuid),
                ..ModelUpdateDBRequest::from(&model)
            };
            db.models()
                .update(&ctx, &ModelKey::owner_name("alice@example.com", name), &update)
                .await
                .unwrap();
            uuids.push(uuid);
        }

        let found = db
            .models()
            .get_by_uuids(&ctx, &[uuids[2], Uuid::new_v4(), uuids[0]])
            .await
            .unwrap();
        let names: Vec<&str> = found.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["m1", "m3"]);

        let using = db.models().using_credential(&ctx, credential.id).await.unwrap();
        let names: Vec<&str> = using.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["m1", "m3"]);

        // Credentials in use cannot be deleted
        let err = db.cloud_credentials().delete(&ctx, &credential.key()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_grants_and_last_connection(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();
        let (controller, credential) = setup(&db).await;
        create_test_model(&db, "m", "alice@example.com", &controller, &credential).await;
        let key = ModelKey::owner_name("alice@example.com", "m");

        let err = db
            .models()
            .touch_grant_connection(&ctx, &key, "bob@example.com", Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        db.models()
            .update_grant(&ctx, &key, "bob@example.com", Some(AccessLevel::Write))
            .await
            .unwrap();
        let at = Utc::now();
        db.models()
            .touch_grant_connection(&ctx, &key, "bob@example.com", at)
            .await
            .unwrap();

        let model = db.models().get(&ctx, &key).await.unwrap();
        assert_eq!(model.grants.len(), 1);
        assert_eq!(model.grants[0].access, AccessLevel::Write);
        assert_eq!(
            model.grants[0].last_connection.map(|t| t.timestamp_micros()),
            Some(at.timestamp_micros())
        );

        let seen = db.identities().models(&ctx, "bob@example.com").await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].model.name, "m");
        assert_eq!(seen[0].access, AccessLevel::Write);
        assert!(seen[0].last_connection.is_some());

        db.models()
            .update_grant(&ctx, &key, "bob@example.com", None)
            .await
            .unwrap();
        let model = db.models().get(&ctx, &key).await.unwrap();
        assert!(model.grants.is_empty());
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_for_each_aborts_on_callback_error(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();
        let (controller, credential) = setup(&db).await;
        for name in ["m1", "m2", "m3"] {
            create_test_model(&db, name, "alice@example.com", &controller, &credential).await;
        }

        let mut seen = Vec::new();
        let err = db
            .models()
            .for_each(&ctx, |m| {
                seen.push(m.name.clone());
                if m.name == "m2" {
                    return Err(DbError::internal("test", anyhow::anyhow!("stop at m2")));
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.op(), "test");
        assert_eq!(seen, vec!["m1", "m2"]);
    }
}
