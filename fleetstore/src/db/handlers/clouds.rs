//! Database repository for clouds.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::types::Json;
use sqlx::{Acquire, FromRow, PgConnection};
use tracing::{info, instrument};

use crate::db::context::OpContext;
use crate::db::database::Database;
use crate::db::errors::{DbError, Result, Subject};
use crate::db::handlers::cloud_regions::{fetch_region_by_id, insert_region, load_regions_by_cloud_names, merge_region};
use crate::db::handlers::grants::{GrantTable, load_grants, merge_grant, set_grant};
use crate::db::handlers::repository::Repository;
use crate::db::merge::{MergeTally, Merged, OnConflict, merge_row};
use crate::db::metrics;
use crate::db::models::ConfigMap;
use crate::db::models::access::AccessLevel;
use crate::db::models::clouds::{
    CloudCreateDBRequest, CloudDBResponse, CloudRegionCreateDBRequest, CloudRegionDBResponse, CloudSnapshot,
    CloudUpdateDBRequest,
};
use crate::db::models::identities::sanitise_identity_name;
use crate::db::preload::{self, Hydrate, PreloadGraph};
use crate::types::{CloudId, EntityKind};

const CLOUD_COLUMNS: &str = "id, name, provider_type, host_cloud_region, auth_types, endpoint, identity_endpoint, \
                             storage_endpoint, ca_certificates, config, created_at, updated_at";

// Database entity model
#[derive(Debug, Clone, FromRow)]
pub(crate) struct Cloud {
    pub id: CloudId,
    pub name: String,
    pub provider_type: String,
    pub host_cloud_region: String,
    pub auth_types: Vec<String>,
    pub endpoint: String,
    pub identity_endpoint: String,
    pub storage_endpoint: String,
    pub ca_certificates: Vec<String>,
    pub config: Json<ConfigMap>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Cloud> for CloudDBResponse {
    fn from(src: Cloud) -> Self {
        Self {
            id: src.id,
            name: src.name,
            provider_type: src.provider_type,
            host_cloud_region: src.host_cloud_region,
            auth_types: src.auth_types,
            endpoint: src.endpoint,
            identity_endpoint: src.identity_endpoint,
            storage_endpoint: src.storage_endpoint,
            ca_certificates: src.ca_certificates,
            config: src.config.0,
            created_at: src.created_at,
            updated_at: src.updated_at,
            regions: Vec::new(),
            grants: Vec::new(),
        }
    }
}

impl Hydrate for Cloud {
    type Entity = CloudDBResponse;

    const KIND: EntityKind = EntityKind::Cloud;

    fn hydrate<'a>(
        conn: &'a mut PgConnection,
        rows: Vec<Self>,
        graph: &'a PreloadGraph,
    ) -> BoxFuture<'a, sqlx::Result<Vec<Self::Entity>>> {
        hydrate_clouds(conn, rows, graph)
    }
}

fn hydrate_clouds<'a>(
    conn: &'a mut PgConnection,
    rows: Vec<Cloud>,
    graph: &'a PreloadGraph,
) -> BoxFuture<'a, sqlx::Result<Vec<CloudDBResponse>>> {
    async move {
        let mut clouds: Vec<CloudDBResponse> = rows.into_iter().map(Into::into).collect();
        if clouds.is_empty() {
            return Ok(clouds);
        }

        if graph.contains("regions") {
            let names: Vec<String> = clouds.iter().map(|c| c.name.clone()).collect();
            let regions = load_regions_by_cloud_names(&mut *conn, &names, &graph.nested("regions")).await?;
            let mut by_cloud: HashMap<String, Vec<CloudRegionDBResponse>> = HashMap::new();
            for region in regions {
                by_cloud.entry(region.cloud_name.clone()).or_default().push(region);
            }
            for cloud in &mut clouds {
                cloud.regions = by_cloud.remove(&cloud.name).unwrap_or_default();
            }
        }

        if graph.contains("grants") {
            let ids: Vec<CloudId> = clouds.iter().map(|c| c.id).collect();
            let mut grants = load_grants(&mut *conn, GrantTable::Cloud, &ids, &graph.nested("grants")).await?;
            for cloud in &mut clouds {
                cloud.grants = grants.remove(&cloud.id).unwrap_or_default();
            }
        }

        Ok(clouds)
    }
    .boxed()
}

pub(crate) async fn load_clouds_by_ids(
    conn: &mut PgConnection,
    ids: &[CloudId],
    graph: &PreloadGraph,
) -> sqlx::Result<Vec<CloudDBResponse>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!("SELECT {CLOUD_COLUMNS} FROM clouds WHERE id = ANY($1) ORDER BY id");
    let rows = sqlx::query_as::<_, Cloud>(&sql).bind(ids).fetch_all(&mut *conn).await?;
    hydrate_clouds(conn, rows, graph).await
}

pub(crate) async fn load_clouds_by_names(
    conn: &mut PgConnection,
    names: &[String],
    graph: &PreloadGraph,
) -> sqlx::Result<Vec<CloudDBResponse>> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!("SELECT {CLOUD_COLUMNS} FROM clouds WHERE name = ANY($1) ORDER BY name");
    let rows = sqlx::query_as::<_, Cloud>(&sql).bind(names).fetch_all(&mut *conn).await?;
    hydrate_clouds(conn, rows, graph).await
}

async fn fetch_cloud(conn: &mut PgConnection, name: &str) -> sqlx::Result<CloudDBResponse> {
    let sql = format!("SELECT {CLOUD_COLUMNS} FROM clouds WHERE name = $1");
    let row = sqlx::query_as::<_, Cloud>(&sql).bind(name).fetch_one(&mut *conn).await?;
    let graph = preload::cloud("");
    let mut clouds = hydrate_clouds(conn, vec![row], &graph).await?;
    clouds.pop().ok_or(sqlx::Error::RowNotFound)
}

pub(crate) async fn cloud_id(conn: &mut PgConnection, name: &str) -> sqlx::Result<CloudId> {
    sqlx::query_scalar("SELECT id FROM clouds WHERE name = $1")
        .bind(name)
        .fetch_one(conn)
        .await
}

pub struct Clouds<'d> {
    db: &'d Database,
}

impl<'d> Clouds<'d> {
    pub fn new(db: &'d Database) -> Self {
        Self { db }
    }

    /// All clouds ordered by name, fully preloaded.
    #[instrument(skip(self, ctx), err)]
    pub async fn list(&self, ctx: &OpContext) -> Result<Vec<CloudDBResponse>> {
        let subject = Subject::unchecked(EntityKind::Cloud, "*");

        self.db
            .run(ctx, "clouds.list", &subject, async {
                let mut conn = self.db.acquire().await?;
                let sql = format!("SELECT {CLOUD_COLUMNS} FROM clouds ORDER BY name");
                let rows = sqlx::query_as::<_, Cloud>(&sql).fetch_all(&mut *conn).await?;
                hydrate_clouds(&mut conn, rows, &preload::cloud("")).await
            })
            .await
    }

    /// Visit every cloud in name order.
    pub async fn for_each<F, E>(&self, ctx: &OpContext, f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&CloudDBResponse) -> std::result::Result<(), E>,
        E: From<DbError>,
    {
        let sql = format!(
            "SELECT {CLOUD_COLUMNS} FROM clouds
             WHERE $1::text IS NULL OR name > $1
             ORDER BY name LIMIT $2"
        );
        let page = |last: Option<&Cloud>, limit: i64| {
            sqlx::query_as::<_, Cloud>(&sql)
                .bind(last.map(|c| c.name.clone()))
                .bind(limit)
        };
        self.db.iterate(ctx, "clouds.for_each", page, &preload::cloud(""), f).await
    }

    /// Reconcile a cloud with a snapshot reported by a controller.
    ///
    /// An existing cloud keeps its stored fields and regions; regions missing from the store are
    /// added. Grants in the snapshot are added or have their access level updated. Nothing is
    /// ever removed. The whole snapshot commits or none of it does.
    #[instrument(skip(self, ctx, snapshot), fields(cloud = %snapshot.cloud.name), err)]
    pub async fn set_cloud(&self, ctx: &OpContext, snapshot: &CloudSnapshot) -> Result<Merged<CloudDBResponse>> {
        const OP: &str = "clouds.set_cloud";
        let cloud = &snapshot.cloud;
        let subject = Subject::key(EntityKind::Cloud, &cloud.name);
        let default_access = self.db.settings().default_controller_access;

        let merged = self
            .db
            .run(ctx, OP, &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;
                let mut tally = MergeTally::default();

                let insert = sqlx::query(
                    "INSERT INTO clouds (name, provider_type, host_cloud_region, auth_types, endpoint,
                                         identity_endpoint, storage_endpoint, ca_certificates, config)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                )
                .bind(&cloud.name)
                .bind(&cloud.provider_type)
                .bind(&cloud.host_cloud_region)
                .bind(&cloud.auth_types)
                .bind(&cloud.endpoint)
                .bind(&cloud.identity_endpoint)
                .bind(&cloud.storage_endpoint)
                .bind(&cloud.ca_certificates)
                .bind(Json(&cloud.config));
                tally.record(merge_row(&mut tx, insert, OnConflict::DoNothing).await?);

                let id = cloud_id(&mut tx, &cloud.name).await?;
                for region in &cloud.regions {
                    tally.record(merge_region(&mut tx, &cloud.name, region).await?);
                }
                for grant in &snapshot.grants {
                    let identity = sanitise_identity_name(&grant.identity_name);
                    tally.record(merge_grant(&mut tx, GrantTable::Cloud, id, &identity, grant.access, default_access).await?);
                }

                let entity = fetch_cloud(&mut tx, &cloud.name).await?;
                tx.commit().await?;
                Ok(Merged { entity, tally })
            })
            .await?;

        metrics::record_merge(OP, &merged.tally);
        info!(
            inserted = merged.tally.inserted,
            updated = merged.tally.updated,
            unchanged = merged.tally.unchanged,
            "Merged cloud snapshot"
        );
        Ok(merged)
    }

    /// Add a region to an existing cloud. Fails NotFound if the cloud is absent.
    #[instrument(skip(self, ctx, request), fields(cloud = %request.cloud_name, region = %request.region.name), err)]
    pub async fn add_region(&self, ctx: &OpContext, request: &CloudRegionCreateDBRequest) -> Result<CloudRegionDBResponse> {
        let subject = Subject::composite(EntityKind::CloudRegion, &[request.cloud_name.as_str(), request.region.name.as_str()]);

        self.db
            .run_with(ctx, "clouds.add_region", &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;
                let id = insert_region(&mut tx, request).await?;
                let region = fetch_region_by_id(&mut tx, id).await?;
                tx.commit().await?;
                Ok(region)
            })
            .await
    }

    /// Set an identity's access to a cloud. `None` removes the grant.
    #[instrument(skip(self, ctx), err)]
    pub async fn update_grant(
        &self,
        ctx: &OpContext,
        cloud: &str,
        identity: &str,
        access: Option<AccessLevel>,
    ) -> Result<()> {
        let identity = sanitise_identity_name(identity);
        let subject = Subject::key(EntityKind::Cloud, cloud);
        let default_access = self.db.settings().default_controller_access;

        self.db
            .run(ctx, "clouds.update_grant", &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;
                let id = cloud_id(&mut tx, cloud).await?;
                set_grant(&mut tx, GrantTable::Cloud, id, &identity, access, default_access).await?;
                tx.commit().await
            })
            .await
    }
}

#[async_trait::async_trait]
impl<'d> Repository for Clouds<'d> {
    type CreateRequest = CloudCreateDBRequest;
    type UpdateRequest = CloudUpdateDBRequest;
    type Response = CloudDBResponse;
    type Key = str;

    /// Insert a cloud and its initial regions in one transaction.
    #[instrument(skip(self, ctx, request), fields(name = %request.name, regions = request.regions.len()), err)]
    async fn add(&self, ctx: &OpContext, request: &Self::CreateRequest) -> Result<Self::Response> {
        let subject = Subject::key(EntityKind::Cloud, &request.name);

        self.db
            .run_with(ctx, "clouds.add", &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;

                sqlx::query(
                    "INSERT INTO clouds (name, provider_type, host_cloud_region, auth_types, endpoint,
                                         identity_endpoint, storage_endpoint, ca_certificates, config)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                )
                .bind(&request.name)
                .bind(&request.provider_type)
                .bind(&request.host_cloud_region)
                .bind(&request.auth_types)
                .bind(&request.endpoint)
                .bind(&request.identity_endpoint)
                .bind(&request.storage_endpoint)
                .bind(&request.ca_certificates)
                .bind(Json(&request.config))
                .execute(&mut *tx)
                .await?;

                for region in &request.regions {
                    let region = CloudRegionCreateDBRequest {
                        cloud_name: request.name.clone(),
                        region: region.clone(),
                    };
                    insert_region(&mut tx, &region).await?;
                }

                let cloud = fetch_cloud(&mut tx, &request.name).await?;
                tx.commit().await?;
                Ok(cloud)
            })
            .await
    }

    #[instrument(skip(self, ctx), err)]
    async fn get(&self, ctx: &OpContext, name: &Self::Key) -> Result<Self::Response> {
        let subject = Subject::key(EntityKind::Cloud, name);

        self.db
            .run(ctx, "clouds.get", &subject, async {
                let mut conn = self.db.acquire().await?;
                fetch_cloud(&mut conn, name).await
            })
            .await
    }

    #[instrument(skip(self, ctx, request), err)]
    async fn update(&self, ctx: &OpContext, name: &Self::Key, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let subject = Subject::key(EntityKind::Cloud, name);

        self.db
            .run(ctx, "clouds.update", &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;
                let result = sqlx::query(
                    "UPDATE clouds SET
                        provider_type = $2,
                        host_cloud_region = $3,
                        auth_types = $4,
                        endpoint = $5,
                        identity_endpoint = $6,
                        storage_endpoint = $7,
                        ca_certificates = $8,
                        config = $9,
                        updated_at = NOW()
                     WHERE name = $1",
                )
                .bind(name)
                .bind(&request.provider_type)
                .bind(&request.host_cloud_region)
                .bind(&request.auth_types)
                .bind(&request.endpoint)
                .bind(&request.identity_endpoint)
                .bind(&request.storage_endpoint)
                .bind(&request.ca_certificates)
                .bind(Json(&request.config))
                .execute(&mut *tx)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(sqlx::Error::RowNotFound);
                }
                let cloud = fetch_cloud(&mut tx, name).await?;
                tx.commit().await?;
                Ok(cloud)
            })
            .await
    }

    /// Delete a cloud with its regions and grants. Fails Internal while controllers, credentials
    /// or models still reference it.
    #[instrument(skip(self, ctx), err)]
    async fn delete(&self, ctx: &OpContext, name: &Self::Key) -> Result<()> {
        let subject = Subject::key(EntityKind::Cloud, name);

        self.db
            .run(ctx, "clouds.delete", &subject, async {
                let mut conn = self.db.acquire().await?;
                let result = sqlx::query("DELETE FROM clouds WHERE name = $1")
                    .bind(name)
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
