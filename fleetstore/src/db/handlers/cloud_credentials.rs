//! Database repository for cloud credentials.
//!
//! A credential is keyed by (cloud, owner, name). Owners are identities and are created on
//! first reference, like grant subjects.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::types::Json;
use sqlx::{Acquire, FromRow, PgConnection};
use tracing::{info, instrument};

use crate::db::context::OpContext;
use crate::db::database::Database;
use crate::db::errors::{DbError, Failure, Result, Subject};
use crate::db::handlers::clouds::{cloud_id, load_clouds_by_names};
use crate::db::handlers::grants::{GrantTable, load_grants, merge_grant, set_grant};
use crate::db::handlers::identities::{ensure_identity, load_identities_map};
use crate::db::handlers::repository::Repository;
use crate::db::merge::{MergeTally, Merged, OnConflict, merge_row};
use crate::db::metrics;
use crate::db::models::access::AccessLevel;
use crate::db::models::cloud_credentials::{
    CloudCredentialCreateDBRequest, CloudCredentialDBResponse, CloudCredentialSnapshot, CloudCredentialUpdateDBRequest,
    CredentialAttributes,
};
use crate::db::models::identities::sanitise_identity_name;
use crate::db::preload::{self, Hydrate, PreloadGraph};
use crate::types::{CloudCredentialId, CloudCredentialKey, EntityKind};

const CREDENTIAL_COLUMNS: &str = "id, cloud_name, owner_identity_name, name, auth_type, label, attributes_in_vault, \
                                  attributes, valid, created_at, updated_at";

// Database entity model
#[derive(Debug, Clone, FromRow)]
pub(crate) struct CloudCredential {
    pub id: CloudCredentialId,
    pub cloud_name: String,
    pub owner_identity_name: String,
    pub name: String,
    pub auth_type: String,
    pub label: String,
    pub attributes_in_vault: bool,
    pub attributes: Json<CredentialAttributes>,
    pub valid: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<CloudCredential> for CloudCredentialDBResponse {
    fn from(src: CloudCredential) -> Self {
        Self {
            id: src.id,
            cloud_name: src.cloud_name,
            owner_identity_name: src.owner_identity_name,
            name: src.name,
            auth_type: src.auth_type,
            label: src.label,
            attributes_in_vault: src.attributes_in_vault,
            attributes: src.attributes.0,
            valid: src.valid,
            created_at: src.created_at,
            updated_at: src.updated_at,
            cloud: None,
            owner: None,
            grants: Vec::new(),
        }
    }
}

impl Hydrate for CloudCredential {
    type Entity = CloudCredentialDBResponse;

    const KIND: EntityKind = EntityKind::CloudCredential;

    fn hydrate<'a>(
        conn: &'a mut PgConnection,
        rows: Vec<Self>,
        graph: &'a PreloadGraph,
    ) -> BoxFuture<'a, sqlx::Result<Vec<Self::Entity>>> {
        hydrate_credentials(conn, rows, graph)
    }
}

fn hydrate_credentials<'a>(
    conn: &'a mut PgConnection,
    rows: Vec<CloudCredential>,
    graph: &'a PreloadGraph,
) -> BoxFuture<'a, sqlx::Result<Vec<CloudCredentialDBResponse>>> {
    async move {
        let mut credentials: Vec<CloudCredentialDBResponse> = rows.into_iter().map(Into::into).collect();
        if credentials.is_empty() {
            return Ok(credentials);
        }

        if graph.contains("cloud") {
            let mut names: Vec<String> = credentials.iter().map(|c| c.cloud_name.clone()).collect();
            names.sort();
            names.dedup();
            let clouds: HashMap<String, _> = load_clouds_by_names(&mut *conn, &names, &graph.nested("cloud"))
                .await?
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect();
            for credential in &mut credentials {
                credential.cloud = clouds.get(&credential.cloud_name).cloned().map(Box::new);
            }
        }

        if graph.contains("owner") {
            let owners =
                load_identities_map(&mut *conn, credentials.iter().map(|c| c.owner_identity_name.clone())).await?;
            for credential in &mut credentials {
                credential.owner = owners.get(&credential.owner_identity_name).cloned();
            }
        }

        if graph.contains("grants") {
            let ids: Vec<CloudCredentialId> = credentials.iter().map(|c| c.id).collect();
            let mut grants = load_grants(&mut *conn, GrantTable::CloudCredential, &ids, &graph.nested("grants")).await?;
            for credential in &mut credentials {
                credential.grants = grants.remove(&credential.id).unwrap_or_default();
            }
        }

        Ok(credentials)
    }
    .boxed()
}

pub(crate) async fn load_cloud_credentials_by_ids(
    conn: &mut PgConnection,
    ids: &[CloudCredentialId],
    graph: &PreloadGraph,
) -> sqlx::Result<Vec<CloudCredentialDBResponse>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!("SELECT {CREDENTIAL_COLUMNS} FROM cloud_credentials WHERE id = ANY($1) ORDER BY id");
    let rows = sqlx::query_as::<_, CloudCredential>(&sql)
        .bind(ids)
        .fetch_all(&mut *conn)
        .await?;
    hydrate_credentials(conn, rows, graph).await
}

/// Credentials owned by `owner`, optionally on one cloud, ordered by cloud then name.
pub(crate) async fn load_cloud_credentials_where_owner(
    conn: &mut PgConnection,
    owner: &str,
    cloud: Option<&str>,
    graph: &PreloadGraph,
) -> sqlx::Result<Vec<CloudCredentialDBResponse>> {
    let sql = format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM cloud_credentials
         WHERE owner_identity_name = $1 AND ($2::text IS NULL OR cloud_name = $2)
         ORDER BY cloud_name, name"
    );
    let rows = sqlx::query_as::<_, CloudCredential>(&sql)
        .bind(owner)
        .bind(cloud)
        .fetch_all(&mut *conn)
        .await?;
    hydrate_credentials(conn, rows, graph).await
}

pub(crate) async fn cloud_credential_id(
    conn: &mut PgConnection,
    key: &CloudCredentialKey,
) -> sqlx::Result<CloudCredentialId> {
    sqlx::query_scalar("SELECT id FROM cloud_credentials WHERE cloud_name = $1 AND owner_identity_name = $2 AND name = $3")
        .bind(&key.cloud)
        .bind(&key.owner)
        .bind(&key.name)
        .fetch_one(conn)
        .await
}

async fn fetch_credential(conn: &mut PgConnection, id: CloudCredentialId) -> sqlx::Result<CloudCredentialDBResponse> {
    let mut credentials = load_cloud_credentials_by_ids(conn, &[id], &preload::cloud_credential("")).await?;
    credentials.pop().ok_or(sqlx::Error::RowNotFound)
}

/// The key with its owner sanitised, and the matching error subject.
fn resolve_key(key: &CloudCredentialKey) -> (CloudCredentialKey, Subject) {
    let key = CloudCredentialKey::new(&key.cloud, sanitise_identity_name(&key.owner), &key.name);
    let subject = Subject::composite(EntityKind::CloudCredential, &[key.cloud.as_str(), key.owner.as_str(), key.name.as_str()]);
    (key, subject)
}

pub struct CloudCredentials<'d> {
    db: &'d Database,
}

impl<'d> CloudCredentials<'d> {
    pub fn new(db: &'d Database) -> Self {
        Self { db }
    }

    /// Visit the credentials of `owner` in (cloud, name) order, optionally only on one cloud.
    pub async fn for_each<F, E>(&self, ctx: &OpContext, owner: &str, cloud: Option<&str>, f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&CloudCredentialDBResponse) -> std::result::Result<(), E>,
        E: From<DbError>,
    {
        let owner = sanitise_identity_name(owner);
        let sql = format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM cloud_credentials
             WHERE owner_identity_name = $1 AND ($2::text IS NULL OR cloud_name = $2)
               AND ($3::text IS NULL OR (cloud_name, name) > ($3::text, $4::text))
             ORDER BY cloud_name, name LIMIT $5"
        );
        let page = |last: Option<&CloudCredential>, limit: i64| {
            sqlx::query_as::<_, CloudCredential>(&sql)
                .bind(owner.as_str())
                .bind(cloud)
                .bind(last.map(|c| c.cloud_name.clone()))
                .bind(last.map(|c| c.name.clone()))
                .bind(limit)
        };
        self.db
            .iterate(ctx, "cloud_credentials.for_each", page, &preload::cloud_credential(""), f)
            .await
    }

    /// Reconcile a credential with a snapshot from a controller.
    ///
    /// An existing credential keeps its stored fields; grants are added or have their access
    /// level updated. Fails NotFound if the cloud is absent.
    #[instrument(skip(self, ctx, snapshot), fields(credential = %snapshot.credential.key()), err)]
    pub async fn set_cloud_credential(
        &self,
        ctx: &OpContext,
        snapshot: &CloudCredentialSnapshot,
    ) -> Result<Merged<CloudCredentialDBResponse>> {
        const OP: &str = "cloud_credentials.set_cloud_credential";
        let credential = &snapshot.credential;
        let (key, subject) = resolve_key(&credential.key());
        let default_access = self.db.settings().default_controller_access;

        let merged = self
            .db
            .run_with(ctx, OP, &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;
                let mut tally = MergeTally::default();

                cloud_id(&mut tx, &key.cloud)
                    .await
                    .map_err(Failure::at(Subject::key(EntityKind::Cloud, &key.cloud)))?;
                ensure_identity(&mut tx, &key.owner, default_access).await?;

                let insert = sqlx::query(
                    "INSERT INTO cloud_credentials (cloud_name, owner_identity_name, name, auth_type, label,
                                                    attributes_in_vault, attributes, valid)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(&key.cloud)
                .bind(&key.owner)
                .bind(&key.name)
                .bind(&credential.auth_type)
                .bind(&credential.label)
                .bind(credential.attributes_in_vault)
                .bind(Json(&credential.attributes))
                .bind(credential.valid);
                tally.record(merge_row(&mut tx, insert, OnConflict::DoNothing).await?);

                let id = cloud_credential_id(&mut tx, &key).await?;
                for grant in &snapshot.grants {
                    let identity = sanitise_identity_name(&grant.identity_name);
                    tally.record(
                        merge_grant(&mut tx, GrantTable::CloudCredential, id, &identity, grant.access, default_access)
                            .await?,
                    );
                }

                let entity = fetch_credential(&mut tx, id).await?;
                tx.commit().await?;
                Ok(Merged { entity, tally })
            })
            .await?;

        metrics::record_merge(OP, &merged.tally);
        info!(
            inserted = merged.tally.inserted,
            updated = merged.tally.updated,
            unchanged = merged.tally.unchanged,
            "Merged cloud credential snapshot"
        );
        Ok(merged)
    }

    /// Set an identity's access to a credential. `None` removes the grant.
    #[instrument(skip(self, ctx), fields(credential = %key), err)]
    pub async fn update_grant(
        &self,
        ctx: &OpContext,
        key: &CloudCredentialKey,
        identity: &str,
        access: Option<AccessLevel>,
    ) -> Result<()> {
        let (key, subject) = resolve_key(key);
        let identity = sanitise_identity_name(identity);
        let default_access = self.db.settings().default_controller_access;

        self.db
            .run(ctx, "cloud_credentials.update_grant", &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;
                let id = cloud_credential_id(&mut tx, &key).await?;
                set_grant(&mut tx, GrantTable::CloudCredential, id, &identity, access, default_access).await?;
                tx.commit().await
            })
            .await
    }
}

#[async_trait::async_trait]
impl<'d> Repository for CloudCredentials<'d> {
    type CreateRequest = CloudCredentialCreateDBRequest;
    type UpdateRequest = CloudCredentialUpdateDBRequest;
    type Response = CloudCredentialDBResponse;
    type Key = CloudCredentialKey;

    /// Insert a credential, creating its owner if needed. Fails NotFound if the cloud is absent.
    #[instrument(skip(self, ctx, request), fields(credential = %request.key()), err)]
    async fn add(&self, ctx: &OpContext, request: &Self::CreateRequest) -> Result<Self::Response> {
        let (key, subject) = resolve_key(&request.key());
        let default_access = self.db.settings().default_controller_access;

        self.db
            .run_with(ctx, "cloud_credentials.add", &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;

                cloud_id(&mut tx, &key.cloud)
                    .await
                    .map_err(Failure::at(Subject::key(EntityKind::Cloud, &key.cloud)))?;
                ensure_identity(&mut tx, &key.owner, default_access).await?;
                let id: CloudCredentialId = sqlx::query_scalar(
                    "INSERT INTO cloud_credentials (cloud_name, owner_identity_name, name, auth_type, label,
                                                    attributes_in_vault, attributes, valid)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                     RETURNING id",
                )
                .bind(&key.cloud)
                .bind(&key.owner)
                .bind(&key.name)
                .bind(&request.auth_type)
                .bind(&request.label)
                .bind(request.attributes_in_vault)
                .bind(Json(&request.attributes))
                .bind(request.valid)
                .fetch_one(&mut *tx)
                .await?;

                let credential = fetch_credential(&mut tx, id).await?;
                tx.commit().await?;
                Ok(credential)
            })
            .await
    }

    #[instrument(skip(self, ctx), fields(credential = %key), err)]
    async fn get(&self, ctx: &OpContext, key: &Self::Key) -> Result<Self::Response> {
        let (key, subject) = resolve_key(key);

        self.db
            .run(ctx, "cloud_credentials.get", &subject, async {
                let mut conn = self.db.acquire().await?;
                let id = cloud_credential_id(&mut conn, &key).await?;
                fetch_credential(&mut conn, id).await
            })
            .await
    }

    #[instrument(skip(self, ctx, request), fields(credential = %key), err)]
    async fn update(&self, ctx: &OpContext, key: &Self::Key, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let (key, subject) = resolve_key(key);

        self.db
            .run(ctx, "cloud_credentials.update", &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;
                let id: CloudCredentialId = sqlx::query_scalar(
                    "UPDATE cloud_credentials SET
                        auth_type = $4,
                        label = $5,
                        attributes_in_vault = $6,
                        attributes = $7,
                        valid = $8,
                        updated_at = NOW()
                     WHERE cloud_name = $1 AND owner_identity_name = $2 AND name = $3
                     RETURNING id",
                )
                .bind(&key.cloud)
                .bind(&key.owner)
                .bind(&key.name)
                .bind(&request.auth_type)
                .bind(&request.label)
                .bind(request.attributes_in_vault)
                .bind(Json(&request.attributes))
                .bind(request.valid)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?;
                let credential = fetch_credential(&mut tx, id).await?;
                tx.commit().await?;
                Ok(credential)
            })
            .await
    }

    /// Delete a credential and its grants. Fails Internal while models still use it.
    #[instrument(skip(self, ctx), fields(credential = %key), err)]
    async fn delete(&self, ctx: &OpContext, key: &Self::Key) -> Result<()> {
        let (key, subject) = resolve_key(key);

        self.db
            .run(ctx, "cloud_credentials.delete", &subject, async {
                let mut conn = self.db.acquire().await?;
                let result = sqlx::query(
                    "DELETE FROM cloud_credentials WHERE cloud_name = $1 AND owner_identity_name = $2 AND name = $3",
                )
                .bind(&key.cloud)
                .bind(&key.owner)
                .bind(&key.name)
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
