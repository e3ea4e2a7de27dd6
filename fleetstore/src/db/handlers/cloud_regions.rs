//! Database repository for cloud regions and the controllers that can host models in them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::types::Json;
use sqlx::{Acquire, FromRow, PgConnection};
use tracing::{debug, instrument};

use crate::db::context::OpContext;
use crate::db::database::Database;
use crate::db::errors::{DbError, Failure, Result, Subject};
use crate::db::handlers::clouds::{cloud_id, load_clouds_by_names};
use crate::db::handlers::controllers::{controller_id, controller_subject, load_controllers_by_ids};
use crate::db::handlers::repository::Repository;
use crate::db::merge::{MergeOutcome, OnConflict, merge_row};
use crate::db::models::ConfigMap;
use crate::db::models::clouds::{
    CloudRegionCreateDBRequest, CloudRegionDBResponse, CloudRegionSpec, CloudRegionUpdateDBRequest,
    ControllerPriorityDBResponse,
};
use crate::db::preload::{self, Hydrate, PreloadGraph};
use crate::types::{CloudRegionId, CloudRegionKey, ControllerId, ControllerKey, EntityKind};

const REGION_COLUMNS: &str =
    "r.id, r.cloud_name, r.name, r.endpoint, r.identity_endpoint, r.storage_endpoint, r.config, r.created_at, r.updated_at";

const PRIORITY_COLUMNS: &str = "p.id, p.cloud_region_id, p.controller_id, p.priority, p.created_at, p.updated_at";

// Database entity model
#[derive(Debug, Clone, FromRow)]
pub(crate) struct CloudRegion {
    pub id: CloudRegionId,
    pub cloud_name: String,
    pub name: String,
    pub endpoint: String,
    pub identity_endpoint: String,
    pub storage_endpoint: String,
    pub config: Json<ConfigMap>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<CloudRegion> for CloudRegionDBResponse {
    fn from(src: CloudRegion) -> Self {
        Self {
            id: src.id,
            cloud_name: src.cloud_name,
            name: src.name,
            endpoint: src.endpoint,
            identity_endpoint: src.identity_endpoint,
            storage_endpoint: src.storage_endpoint,
            config: src.config.0,
            created_at: src.created_at,
            updated_at: src.updated_at,
            cloud: None,
            controllers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct ControllerPriority {
    pub id: i64,
    pub cloud_region_id: CloudRegionId,
    pub controller_id: ControllerId,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ControllerPriority> for ControllerPriorityDBResponse {
    fn from(src: ControllerPriority) -> Self {
        Self {
            id: src.id,
            cloud_region_id: src.cloud_region_id,
            controller_id: src.controller_id,
            priority: src.priority,
            created_at: src.created_at,
            updated_at: src.updated_at,
            controller: None,
            cloud_region: None,
        }
    }
}

impl Hydrate for CloudRegion {
    type Entity = CloudRegionDBResponse;

    const KIND: EntityKind = EntityKind::CloudRegion;

    fn hydrate<'a>(
        conn: &'a mut PgConnection,
        rows: Vec<Self>,
        graph: &'a PreloadGraph,
    ) -> BoxFuture<'a, sqlx::Result<Vec<Self::Entity>>> {
        hydrate_regions(conn, rows, graph)
    }
}

fn hydrate_regions<'a>(
    conn: &'a mut PgConnection,
    rows: Vec<CloudRegion>,
    graph: &'a PreloadGraph,
) -> BoxFuture<'a, sqlx::Result<Vec<CloudRegionDBResponse>>> {
    async move {
        let mut regions: Vec<CloudRegionDBResponse> = rows.into_iter().map(Into::into).collect();
        if regions.is_empty() {
            return Ok(regions);
        }

        if graph.contains("cloud") {
            let mut names: Vec<String> = regions.iter().map(|r| r.cloud_name.clone()).collect();
            names.sort();
            names.dedup();
            let clouds: HashMap<String, _> = load_clouds_by_names(&mut *conn, &names, &graph.nested("cloud"))
                .await?
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect();
            for region in &mut regions {
                region.cloud = clouds.get(&region.cloud_name).cloned().map(Box::new);
            }
        }

        if graph.contains("controllers") {
            let ids: Vec<CloudRegionId> = regions.iter().map(|r| r.id).collect();
            let priorities = load_priorities_for_regions(&mut *conn, &ids, &graph.nested("controllers")).await?;
            let mut by_region: HashMap<CloudRegionId, Vec<ControllerPriorityDBResponse>> = HashMap::new();
            for priority in priorities {
                by_region.entry(priority.cloud_region_id).or_default().push(priority);
            }
            for region in &mut regions {
                region.controllers = by_region.remove(&region.id).unwrap_or_default();
            }
        }

        Ok(regions)
    }
    .boxed()
}

fn hydrate_priorities<'a>(
    conn: &'a mut PgConnection,
    rows: Vec<ControllerPriority>,
    graph: &'a PreloadGraph,
) -> BoxFuture<'a, sqlx::Result<Vec<ControllerPriorityDBResponse>>> {
    async move {
        let mut priorities: Vec<ControllerPriorityDBResponse> = rows.into_iter().map(Into::into).collect();
        if priorities.is_empty() {
            return Ok(priorities);
        }

        if graph.contains("controller") {
            let mut ids: Vec<ControllerId> = priorities.iter().map(|p| p.controller_id).collect();
            ids.sort_unstable();
            ids.dedup();
            let controllers: HashMap<ControllerId, _> =
                load_controllers_by_ids(&mut *conn, &ids, &graph.nested("controller"))
                    .await?
                    .into_iter()
                    .map(|c| (c.id, c))
                    .collect();
            for priority in &mut priorities {
                priority.controller = controllers.get(&priority.controller_id).cloned().map(Box::new);
            }
        }

        if graph.contains("cloud_region") {
            let mut ids: Vec<CloudRegionId> = priorities.iter().map(|p| p.cloud_region_id).collect();
            ids.sort_unstable();
            ids.dedup();
            let regions: HashMap<CloudRegionId, _> = load_regions_by_ids(&mut *conn, &ids, &graph.nested("cloud_region"))
                .await?
                .into_iter()
                .map(|r| (r.id, r))
                .collect();
            for priority in &mut priorities {
                priority.cloud_region = regions.get(&priority.cloud_region_id).cloned().map(Box::new);
            }
        }

        Ok(priorities)
    }
    .boxed()
}

/// Regions of each named cloud, ordered by cloud then region name.
pub(crate) async fn load_regions_by_cloud_names(
    conn: &mut PgConnection,
    cloud_names: &[String],
    graph: &PreloadGraph,
) -> sqlx::Result<Vec<CloudRegionDBResponse>> {
    if cloud_names.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!("SELECT {REGION_COLUMNS} FROM cloud_regions r WHERE r.cloud_name = ANY($1) ORDER BY r.cloud_name, r.name");
    let rows = sqlx::query_as::<_, CloudRegion>(&sql)
        .bind(cloud_names)
        .fetch_all(&mut *conn)
        .await?;
    hydrate_regions(conn, rows, graph).await
}

pub(crate) async fn load_regions_by_ids(
    conn: &mut PgConnection,
    ids: &[CloudRegionId],
    graph: &PreloadGraph,
) -> sqlx::Result<Vec<CloudRegionDBResponse>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!("SELECT {REGION_COLUMNS} FROM cloud_regions r WHERE r.id = ANY($1) ORDER BY r.id");
    let rows = sqlx::query_as::<_, CloudRegion>(&sql).bind(ids).fetch_all(&mut *conn).await?;
    hydrate_regions(conn, rows, graph).await
}

/// Controller links of each region, highest priority first, ties broken by controller name.
async fn load_priorities_for_regions(
    conn: &mut PgConnection,
    region_ids: &[CloudRegionId],
    graph: &PreloadGraph,
) -> sqlx::Result<Vec<ControllerPriorityDBResponse>> {
    let sql = format!(
        "SELECT {PRIORITY_COLUMNS}
         FROM cloud_region_controller_priorities p
         JOIN controllers c ON c.id = p.controller_id
         WHERE p.cloud_region_id = ANY($1)
         ORDER BY p.cloud_region_id, p.priority DESC, c.name"
    );
    let rows = sqlx::query_as::<_, ControllerPriority>(&sql)
        .bind(region_ids)
        .fetch_all(&mut *conn)
        .await?;
    hydrate_priorities(conn, rows, graph).await
}

/// Region links of each controller, highest priority first, ties broken by region key.
pub(crate) async fn load_priorities_for_controllers(
    conn: &mut PgConnection,
    controller_ids: &[ControllerId],
    graph: &PreloadGraph,
) -> sqlx::Result<Vec<ControllerPriorityDBResponse>> {
    if controller_ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {PRIORITY_COLUMNS}
         FROM cloud_region_controller_priorities p
         JOIN cloud_regions r ON r.id = p.cloud_region_id
         WHERE p.controller_id = ANY($1)
         ORDER BY p.controller_id, p.priority DESC, r.cloud_name, r.name"
    );
    let rows = sqlx::query_as::<_, ControllerPriority>(&sql)
        .bind(controller_ids)
        .fetch_all(&mut *conn)
        .await?;
    hydrate_priorities(conn, rows, graph).await
}

pub(crate) async fn fetch_region_by_id(conn: &mut PgConnection, id: CloudRegionId) -> sqlx::Result<CloudRegionDBResponse> {
    let mut regions = load_regions_by_ids(conn, &[id], &preload::cloud_region("")).await?;
    regions.pop().ok_or(sqlx::Error::RowNotFound)
}

pub(crate) async fn region_id(conn: &mut PgConnection, key: &CloudRegionKey) -> sqlx::Result<CloudRegionId> {
    sqlx::query_scalar("SELECT id FROM cloud_regions WHERE cloud_name = $1 AND name = $2")
        .bind(&key.cloud)
        .bind(&key.region)
        .fetch_one(conn)
        .await
}

/// Insert a region under an existing cloud. A missing cloud is NotFound for that cloud, a
/// duplicate is AlreadyExists for the region.
pub(crate) async fn insert_region(
    conn: &mut PgConnection,
    request: &CloudRegionCreateDBRequest,
) -> std::result::Result<CloudRegionId, Failure> {
    cloud_id(&mut *conn, &request.cloud_name)
        .await
        .map_err(Failure::at(Subject::key(EntityKind::Cloud, &request.cloud_name)))?;

    let region = &request.region;
    sqlx::query_scalar(
        "INSERT INTO cloud_regions (cloud_name, name, endpoint, identity_endpoint, storage_endpoint, config)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING id",
    )
    .bind(&request.cloud_name)
    .bind(&region.name)
    .bind(&region.endpoint)
    .bind(&region.identity_endpoint)
    .bind(&region.storage_endpoint)
    .bind(Json(&region.config))
    .fetch_one(conn)
    .await
    .map_err(Failure::at(Subject::composite(
        EntityKind::CloudRegion,
        &[request.cloud_name.as_str(), region.name.as_str()],
    )))
}

/// Add a region from a cloud snapshot, leaving an existing one untouched.
pub(crate) async fn merge_region(
    conn: &mut PgConnection,
    cloud_name: &str,
    region: &CloudRegionSpec,
) -> sqlx::Result<MergeOutcome> {
    let insert = sqlx::query(
        "INSERT INTO cloud_regions (cloud_name, name, endpoint, identity_endpoint, storage_endpoint, config)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(cloud_name)
    .bind(&region.name)
    .bind(&region.endpoint)
    .bind(&region.identity_endpoint)
    .bind(&region.storage_endpoint)
    .bind(Json(&region.config));
    merge_row(conn, insert, OnConflict::DoNothing).await
}

/// Insert or re-prioritise the link between a region and a controller.
pub(crate) async fn merge_priority(
    conn: &mut PgConnection,
    region_id: CloudRegionId,
    controller_id: ControllerId,
    priority: i32,
) -> sqlx::Result<MergeOutcome> {
    let insert = sqlx::query(
        "INSERT INTO cloud_region_controller_priorities (cloud_region_id, controller_id, priority) VALUES ($1, $2, $3)",
    )
    .bind(region_id)
    .bind(controller_id)
    .bind(priority);
    let update = sqlx::query(
        "UPDATE cloud_region_controller_priorities SET priority = $3, updated_at = NOW()
         WHERE cloud_region_id = $1 AND controller_id = $2 AND priority IS DISTINCT FROM $3",
    )
    .bind(region_id)
    .bind(controller_id)
    .bind(priority);
    merge_row(conn, insert, OnConflict::Update(update)).await
}

pub(crate) fn region_subject(key: &CloudRegionKey) -> Subject {
    Subject::composite(EntityKind::CloudRegion, &[key.cloud.as_str(), key.region.as_str()])
}

fn priority_subject(region: &CloudRegionKey, controller: &ControllerKey) -> Subject {
    let controller = controller.to_string();
    Subject::composite(EntityKind::ControllerPriority, &[region.cloud.as_str(), region.region.as_str(), controller.as_str()])
}

pub struct CloudRegions<'d> {
    db: &'d Database,
}

impl<'d> CloudRegions<'d> {
    pub fn new(db: &'d Database) -> Self {
        Self { db }
    }

    /// The first region named `region` on any cloud of `provider_type`, by creation order.
    #[instrument(skip(self, ctx), err)]
    pub async fn find_region(&self, ctx: &OpContext, provider_type: &str, region: &str) -> Result<CloudRegionDBResponse> {
        let subject = Subject::composite(EntityKind::CloudRegion, &[provider_type, region]);

        self.db
            .run(ctx, "cloud_regions.find_region", &subject, async {
                let mut conn = self.db.acquire().await?;
                let id: CloudRegionId = sqlx::query_scalar(
                    "SELECT r.id
                     FROM cloud_regions r
                     JOIN clouds c ON c.name = r.cloud_name
                     WHERE c.provider_type = $1 AND r.name = $2
                     ORDER BY r.id
                     LIMIT 1",
                )
                .bind(provider_type)
                .bind(region)
                .fetch_one(&mut *conn)
                .await?;
                fetch_region_by_id(&mut conn, id).await
            })
            .await
    }

    /// Visit regions in (cloud, name) order, optionally only those of one cloud.
    pub async fn for_each<F, E>(&self, ctx: &OpContext, cloud: Option<&str>, f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&CloudRegionDBResponse) -> std::result::Result<(), E>,
        E: From<DbError>,
    {
        let sql = format!(
            "SELECT {REGION_COLUMNS} FROM cloud_regions r
             WHERE ($1::text IS NULL OR r.cloud_name = $1)
               AND ($2::text IS NULL OR (r.cloud_name, r.name) > ($2::text, $3::text))
             ORDER BY r.cloud_name, r.name LIMIT $4"
        );
        let page = |last: Option<&CloudRegion>, limit: i64| {
            sqlx::query_as::<_, CloudRegion>(&sql)
                .bind(cloud)
                .bind(last.map(|r| r.cloud_name.clone()))
                .bind(last.map(|r| r.name.clone()))
                .bind(limit)
        };
        self.db
            .iterate(ctx, "cloud_regions.for_each", page, &preload::cloud_region(""), f)
            .await
    }

    /// Record that `controller` can host models in `region` with the given priority.
    #[instrument(skip(self, ctx), fields(region = %region, controller = %controller), err)]
    pub async fn set_controller_priority(
        &self,
        ctx: &OpContext,
        region: &CloudRegionKey,
        controller: &ControllerKey,
        priority: i32,
    ) -> Result<MergeOutcome> {
        let subject = priority_subject(region, controller);

        self.db
            .run_with(ctx, "cloud_regions.set_controller_priority", &subject, async {
                let mut conn = self.db.acquire().await?;
                let region_id = region_id(&mut conn, region).await.map_err(Failure::at(region_subject(region)))?;
                let controller_id = controller_id(&mut conn, controller)
                    .await
                    .map_err(Failure::at(controller_subject(controller)))?;
                let outcome = merge_priority(&mut conn, region_id, controller_id, priority).await?;
                debug!(?outcome, priority, "Set controller priority");
                Ok(outcome)
            })
            .await
    }

    /// Drop the link between a region and a controller. Fails NotFound if there is none.
    #[instrument(skip(self, ctx), fields(region = %region, controller = %controller), err)]
    pub async fn remove_controller_priority(
        &self,
        ctx: &OpContext,
        region: &CloudRegionKey,
        controller: &ControllerKey,
    ) -> Result<()> {
        let subject = priority_subject(region, controller);

        self.db
            .run_with(ctx, "cloud_regions.remove_controller_priority", &subject, async {
                let mut conn = self.db.acquire().await?;
                let region_id = region_id(&mut conn, region).await.map_err(Failure::at(region_subject(region)))?;
                let controller_id = controller_id(&mut conn, controller)
                    .await
                    .map_err(Failure::at(controller_subject(controller)))?;
                let result =
                    sqlx::query("DELETE FROM cloud_region_controller_priorities WHERE cloud_region_id = $1 AND controller_id = $2")
                        .bind(region_id)
                        .bind(controller_id)
                        .execute(&mut *conn)
                        .await?;
                if result.rows_affected() == 0 {
                    return Err(sqlx::Error::RowNotFound.into());
                }
                Ok(())
            })
            .await
    }
}

#[async_trait::async_trait]
impl<'d> Repository for CloudRegions<'d> {
    type CreateRequest = CloudRegionCreateDBRequest;
    type UpdateRequest = CloudRegionUpdateDBRequest;
    type Response = CloudRegionDBResponse;
    type Key = CloudRegionKey;

    #[instrument(skip(self, ctx, request), fields(cloud = %request.cloud_name, region = %request.region.name), err)]
    async fn add(&self, ctx: &OpContext, request: &Self::CreateRequest) -> Result<Self::Response> {
        let subject = Subject::composite(EntityKind::CloudRegion, &[request.cloud_name.as_str(), request.region.name.as_str()]);

        self.db
            .run_with(ctx, "cloud_regions.add", &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;
                let id = insert_region(&mut tx, request).await?;
                let region = fetch_region_by_id(&mut tx, id).await?;
                tx.commit().await?;
                Ok(region)
            })
            .await
    }

    #[instrument(skip(self, ctx), fields(region = %key), err)]
    async fn get(&self, ctx: &OpContext, key: &Self::Key) -> Result<Self::Response> {
        let subject = region_subject(key);

        self.db
            .run(ctx, "cloud_regions.get", &subject, async {
                let mut conn = self.db.acquire().await?;
                let id = region_id(&mut conn, key).await?;
                fetch_region_by_id(&mut conn, id).await
            })
            .await
    }

    #[instrument(skip(self, ctx, request), fields(region = %key), err)]
    async fn update(&self, ctx: &OpContext, key: &Self::Key, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let subject = region_subject(key);

        self.db
            .run(ctx, "cloud_regions.update", &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;
                let id: CloudRegionId = sqlx::query_scalar(
                    "UPDATE cloud_regions SET
                        endpoint = $3,
                        identity_endpoint = $4,
                        storage_endpoint = $5,
                        config = $6,
                        updated_at = NOW()
                     WHERE cloud_name = $1 AND name = $2
                     RETURNING id",
                )
                .bind(&key.cloud)
                .bind(&key.region)
                .bind(&request.endpoint)
                .bind(&request.identity_endpoint)
                .bind(&request.storage_endpoint)
                .bind(Json(&request.config))
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
                let region = fetch_region_by_id(&mut tx, id).await?;
                tx.commit().await?;
                Ok(region)
            })
            .await
    }

    #[instrument(skip(self, ctx), fields(region = %key), err)]
    async fn delete(&self, ctx: &OpContext, key: &Self::Key) -> Result<()> {
        let subject = region_subject(key);

        self.db
            .run(ctx, "cloud_regions.delete", &subject, async {
                let mut conn = self.db.acquire().await?;
                let result = sqlx::query("DELETE FROM cloud_regions WHERE cloud_name = $1 AND name = $2")
                    .bind(&key.cloud)
                    .bind(&key.region)
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
