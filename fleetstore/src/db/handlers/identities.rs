//! Database repository for identities.
//!
//! Identities are created lazily: [`Identities::get_identity`] and every operation that names
//! an identity in a grant or as an owner inserts it on first reference, with the store's
//! default controller access. Identities are only removed by an explicit delete.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::{Acquire, FromRow, PgConnection};
use tracing::{info, instrument};

use crate::db::context::OpContext;
use crate::db::database::Database;
use crate::db::errors::{DbError, Result, Subject};
use crate::db::handlers::cloud_credentials::load_cloud_credentials_where_owner;
use crate::db::handlers::clouds::load_clouds_by_ids;
use crate::db::handlers::grants::{GrantTable, load_identity_grants};
use crate::db::handlers::models::load_models_by_ids;
use crate::db::handlers::repository::Repository;
use crate::db::merge::{MergeOutcome, OnConflict, merge_row};
use crate::db::models::access::AccessLevel;
use crate::db::models::cloud_credentials::CloudCredentialDBResponse;
use crate::db::models::clouds::CloudDBResponse;
use crate::db::models::identities::{
    IdentityCreateDBRequest, IdentityDBResponse, IdentityUpdateDBRequest, default_display_name, sanitise_identity_name,
};
use crate::db::models::models::ModelDBResponse;
use crate::db::preload::{self, Hydrate, PreloadGraph};
use crate::types::{EntityKind, IdentityId};

const IDENTITY_COLUMNS: &str = "id, name, display_name, controller_access, last_login, disabled, created_at, updated_at";

/// A cloud an identity has been granted access to.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityCloudAccess {
    /// Loaded without regions or grants.
    pub cloud: CloudDBResponse,
    pub access: AccessLevel,
}

/// A model an identity has been granted access to.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityModelAccess {
    /// Loaded without associations.
    pub model: ModelDBResponse,
    pub access: AccessLevel,
    pub last_connection: Option<DateTime<Utc>>,
}

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct Identity {
    pub id: IdentityId,
    pub name: String,
    pub display_name: String,
    pub controller_access: AccessLevel,
    pub last_login: Option<DateTime<Utc>>,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Identity> for IdentityDBResponse {
    fn from(src: Identity) -> Self {
        Self {
            id: src.id,
            name: src.name,
            display_name: src.display_name,
            controller_access: src.controller_access,
            last_login: src.last_login,
            disabled: src.disabled,
            created_at: src.created_at,
            updated_at: src.updated_at,
        }
    }
}

impl Hydrate for Identity {
    type Entity = IdentityDBResponse;

    const KIND: EntityKind = EntityKind::Identity;

    fn hydrate<'a>(
        _conn: &'a mut PgConnection,
        rows: Vec<Self>,
        _graph: &'a PreloadGraph,
    ) -> BoxFuture<'a, sqlx::Result<Vec<Self::Entity>>> {
        async move { Ok(rows.into_iter().map(Into::into).collect()) }.boxed()
    }
}

/// Insert the identity unless it already exists. `name` must already be sanitised.
pub(crate) async fn ensure_identity(
    conn: &mut PgConnection,
    name: &str,
    default_access: AccessLevel,
) -> sqlx::Result<MergeOutcome> {
    let insert = sqlx::query("INSERT INTO identities (name, display_name, controller_access) VALUES ($1, $2, $3)")
        .bind(name)
        .bind(default_display_name(name))
        .bind(default_access);
    let outcome = merge_row(conn, insert, OnConflict::DoNothing).await?;
    if outcome == MergeOutcome::Inserted {
        info!(identity = %name, access = %default_access, "Created identity on first reference");
    }
    Ok(outcome)
}

async fn fetch_identity(conn: &mut PgConnection, name: &str) -> sqlx::Result<IdentityDBResponse> {
    let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE name = $1");
    let identity = sqlx::query_as::<_, Identity>(&sql).bind(name).fetch_one(conn).await?;
    Ok(identity.into())
}

pub(crate) async fn load_identities_by_names(
    conn: &mut PgConnection,
    names: &[String],
) -> sqlx::Result<Vec<IdentityDBResponse>> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE name = ANY($1) ORDER BY name");
    let rows = sqlx::query_as::<_, Identity>(&sql).bind(names).fetch_all(conn).await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Owner identities keyed by name, ready to attach as a `BelongsTo` association.
pub(crate) async fn load_identities_map(
    conn: &mut PgConnection,
    names: impl IntoIterator<Item = String>,
) -> sqlx::Result<HashMap<String, IdentityDBResponse>> {
    let mut names: Vec<String> = names.into_iter().collect();
    names.sort();
    names.dedup();
    Ok(load_identities_by_names(conn, &names)
        .await?
        .into_iter()
        .map(|identity| (identity.name.clone(), identity))
        .collect())
}

pub struct Identities<'d> {
    db: &'d Database,
}

impl<'d> Identities<'d> {
    pub fn new(db: &'d Database) -> Self {
        Self { db }
    }

    /// Get an identity, creating it with the default controller access if it doesn't exist.
    ///
    /// Names are sanitised first; an empty name fails NotFound.
    #[instrument(skip(self, ctx), err)]
    pub async fn get_identity(&self, ctx: &OpContext, name: &str) -> Result<IdentityDBResponse> {
        let name = sanitise_identity_name(name);
        let subject = Subject::key(EntityKind::Identity, &name);
        let default_access = self.db.settings().default_controller_access;

        self.db
            .run(ctx, "identities.get_identity", &subject, async {
                let mut conn = self.db.acquire().await?;
                let mut tx = conn.begin().await?;
                ensure_identity(&mut tx, &name, default_access).await?;
                let identity = fetch_identity(&mut tx, &name).await?;
                tx.commit().await?;
                Ok(identity)
            })
            .await
    }

    /// Visit every identity in name order.
    pub async fn for_each<F, E>(&self, ctx: &OpContext, f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&IdentityDBResponse) -> std::result::Result<(), E>,
        E: From<DbError>,
    {
        let sql = format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities
             WHERE $1::text IS NULL OR name > $1
             ORDER BY name LIMIT $2"
        );
        let page = |last: Option<&Identity>, limit: i64| {
            sqlx::query_as::<_, Identity>(&sql)
                .bind(last.map(|i| i.name.clone()))
                .bind(limit)
        };
        self.db
            .iterate(ctx, "identities.for_each", page, &preload::identity(""), f)
            .await
    }

    /// Clouds the identity holds a grant on, ordered by cloud id.
    #[instrument(skip(self, ctx), err)]
    pub async fn clouds(&self, ctx: &OpContext, name: &str) -> Result<Vec<IdentityCloudAccess>> {
        let name = sanitise_identity_name(name);
        let subject = Subject::key(EntityKind::Identity, &name);

        self.db
            .run(ctx, "identities.clouds", &subject, async {
                let mut conn = self.db.acquire().await?;
                let grants = load_identity_grants(&mut conn, GrantTable::Cloud, &name).await?;
                let ids: Vec<i64> = grants.iter().map(|g| g.object_id).collect();
                let mut clouds: HashMap<i64, CloudDBResponse> = load_clouds_by_ids(&mut conn, &ids, &PreloadGraph::new())
                    .await?
                    .into_iter()
                    .map(|c| (c.id, c))
                    .collect();

                Ok(grants
                    .into_iter()
                    .filter_map(|g| {
                        clouds.remove(&g.object_id).map(|cloud| IdentityCloudAccess {
                            cloud,
                            access: g.access,
                        })
                    })
                    .collect())
            })
            .await
    }

    /// Models the identity holds a grant on, ordered by model id.
    #[instrument(skip(self, ctx), err)]
    pub async fn models(&self, ctx: &OpContext, name: &str) -> Result<Vec<IdentityModelAccess>> {
        let name = sanitise_identity_name(name);
        let subject = Subject::key(EntityKind::Identity, &name);

        self.db
            .run(ctx, "identities.models", &subject, async {
                let mut conn = self.db.acquire().await?;
                let grants = load_identity_grants(&mut conn, GrantTable::Model, &name).await?;
                let ids: Vec<i64> = grants.iter().map(|g| g.object_id).collect();
                let mut models: HashMap<i64, ModelDBResponse> = load_models_by_ids(&mut conn, &ids, &PreloadGraph::new())
                    .await?
                    .into_iter()
                    .map(|m| (m.id, m))
                    .collect();

                Ok(grants
                    .into_iter()
                    .filter_map(|g| {
                        models.remove(&g.object_id).map(|model| IdentityModelAccess {
                            model,
                            access: g.access,
                            last_connection: g.last_connection,
                        })
                    })
                    .collect())
            })
            .await
    }

    /// Credentials the identity owns on `cloud`, ordered by name.
    #[instrument(skip(self, ctx), err)]
    pub async fn cloud_credentials(
        &self,
        ctx: &OpContext,
        name: &str,
        cloud: &str,
    ) -> Result<Vec<CloudCredentialDBResponse>> {
        let name = sanitise_identity_name(name);
        let subject = Subject::composite(EntityKind::CloudCredential, &[cloud, name.as_str()]);

        self.db
            .run(ctx, "identities.cloud_credentials", &subject, async {
                let mut conn = self.db.acquire().await?;
                load_cloud_credentials_where_owner(&mut conn, &name, Some(cloud), &preload::cloud_credential("")).await
            })
            .await
    }
}

#[async_trait::async_trait]
impl<'d> Repository for Identities<'d> {
    type CreateRequest = IdentityCreateDBRequest;
    type UpdateRequest = IdentityUpdateDBRequest;
    type Response = IdentityDBResponse;
    type Key = str;

    #[instrument(skip(self, ctx, request), fields(name = %request.name), err)]
    async fn add(&self, ctx: &OpContext, request: &Self::CreateRequest) -> Result<Self::Response> {
        let name = sanitise_identity_name(&request.name);
        let subject = Subject::key(EntityKind::Identity, &name);
        let display_name = request
            .display_name
            .clone()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| default_display_name(&name));
        let access = request
            .controller_access
            .unwrap_or(self.db.settings().default_controller_access);

        self.db
            .run(ctx, "identities.add", &subject, async {
                let mut conn = self.db.acquire().await?;
                let sql = format!(
                    "INSERT INTO identities (name, display_name, controller_access, disabled)
                     VALUES ($1, $2, $3, $4)
                     RETURNING {IDENTITY_COLUMNS}"
                );
                let identity = sqlx::query_as::<_, Identity>(&sql)
                    .bind(&name)
                    .bind(&display_name)
                    .bind(access)
                    .bind(request.disabled)
                    .fetch_one(&mut *conn)
                    .await?;
                Ok(identity.into())
            })
            .await
    }

    /// Fetch an existing identity. Unlike [`Identities::get_identity`] this never creates one.
    #[instrument(skip(self, ctx), err)]
    async fn get(&self, ctx: &OpContext, name: &Self::Key) -> Result<Self::Response> {
        let name = sanitise_identity_name(name);
        let subject = Subject::key(EntityKind::Identity, &name);

        self.db
            .run(ctx, "identities.get", &subject, async {
                let mut conn = self.db.acquire().await?;
                fetch_identity(&mut conn, &name).await
            })
            .await
    }

    #[instrument(skip(self, ctx, request), err)]
    async fn update(&self, ctx: &OpContext, name: &Self::Key, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let name = sanitise_identity_name(name);
        let subject = Subject::key(EntityKind::Identity, &name);
        let display_name = if request.display_name.is_empty() {
            default_display_name(&name)
        } else {
            request.display_name.clone()
        };

        self.db
            .run(ctx, "identities.update", &subject, async {
                let mut conn = self.db.acquire().await?;
                let sql = format!(
                    "UPDATE identities SET
                        display_name = $2,
                        controller_access = $3,
                        last_login = $4,
                        disabled = $5,
                        updated_at = NOW()
                     WHERE name = $1
                     RETURNING {IDENTITY_COLUMNS}"
                );
                let identity = sqlx::query_as::<_, Identity>(&sql)
                    .bind(&name)
                    .bind(&display_name)
                    .bind(request.controller_access)
                    .bind(request.last_login)
                    .bind(request.disabled)
                    .fetch_optional(&mut *conn)
                    .await?
                    .ok_or(sqlx::Error::RowNotFound)?;
                Ok(identity.into())
            })
            .await
    }

    #[instrument(skip(self, ctx), err)]
    async fn delete(&self, ctx: &OpContext, name: &Self::Key) -> Result<()> {
        let name = sanitise_identity_name(name);
        let subject = Subject::key(EntityKind::Identity, &name);

        self.db
            .run(ctx, "identities.delete", &subject, async {
                let mut conn = self.db.acquire().await?;
                let result = sqlx::query("DELETE FROM identities WHERE name = $1")
                    .bind(&name)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::database::StoreSettings;
    use crate::db::errors::ErrorCode;
    use crate::test_utils::{create_test_cloud, migrated_database, migrated_database_with};
    use sqlx::PgPool;

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_get_identity_creates_on_first_reference(pool: PgPool) {
        let db = migrated_database_with(
            pool.clone(),
            StoreSettings {
                default_controller_access: AccessLevel::Login,
                ..Default::default()
            },
        )
        .await;
        let ctx = OpContext::background();

        let first = db.identities().get_identity(&ctx, "new@x").await.unwrap();
        assert_eq!(first.name, "new@x");
        assert_eq!(first.display_name, "new");
        assert_eq!(first.controller_access, AccessLevel::Login);
        assert!(!first.disabled);

        let second = db.identities().get_identity(&ctx, "new@x").await.unwrap();
        assert_eq!(first, second);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM identities WHERE name = 'new@x'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_empty_name_is_not_found(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();

        let err = db.identities().get_identity(&ctx, "").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        let err = db.identities().get(&ctx, "").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_get_does_not_create(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();

        let err = db.identities().get(&ctx, "nobody@example.com").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.op(), "identities.get");
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_names_are_sanitised(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();

        let identity = db.identities().get_identity(&ctx, "a_b@example.com").await.unwrap();
        assert_eq!(identity.name, sanitise_identity_name("a_b@example.com"));
        assert!(identity.name.starts_with("a-b"));

        // The raw name resolves to the same record
        let fetched = db.identities().get(&ctx, "a_b@example.com").await.unwrap();
        assert_eq!(fetched.id, identity.id);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_add_twice_is_already_exists(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();

        let request = IdentityCreateDBRequest {
            display_name: Some("Alice".to_string()),
            controller_access: Some(AccessLevel::Superuser),
            ..IdentityCreateDBRequest::new("alice@example.com")
        };
        let added = db.identities().add(&ctx, &request).await.unwrap();
        assert_eq!(added.display_name, "Alice");
        assert_eq!(added.controller_access, AccessLevel::Superuser);

        let fetched = db.identities().get(&ctx, "alice@example.com").await.unwrap();
        assert_eq!(added, fetched);

        let err = db.identities().add(&ctx, &request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);
        assert!(err.to_string().contains("alice@example.com"));
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_update_overwrites_scalars(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();

        let identity = db.identities().get_identity(&ctx, "bob@example.com").await.unwrap();
        let login = Utc::now();
        let update = IdentityUpdateDBRequest {
            display_name: "Bob B".to_string(),
            last_login: Some(login),
            disabled: true,
            ..IdentityUpdateDBRequest::from(&identity)
        };
        let updated = db.identities().update(&ctx, "bob@example.com", &update).await.unwrap();
        assert_eq!(updated.display_name, "Bob B");
        assert!(updated.disabled);
        assert_eq!(
            updated.last_login.map(|t| t.timestamp_micros()),
            Some(login.timestamp_micros())
        );

        // Empty display name falls back to the default
        let update = IdentityUpdateDBRequest {
            display_name: String::new(),
            ..IdentityUpdateDBRequest::from(&updated)
        };
        let updated = db.identities().update(&ctx, "bob@example.com", &update).await.unwrap();
        assert_eq!(updated.display_name, "bob");

        let err = db
            .identities()
            .update(&ctx, "missing@example.com", &update)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_delete(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();

        db.identities().get_identity(&ctx, "carol@example.com").await.unwrap();
        db.identities().delete(&ctx, "carol@example.com").await.unwrap();

        let err = db.identities().get(&ctx, "carol@example.com").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        let err = db.identities().delete(&ctx, "carol@example.com").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_for_each_in_name_order_and_aborts(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();

        for name in ["c@example.com", "a@example.com", "b@example.com"] {
            db.identities().get_identity(&ctx, name).await.unwrap();
        }

        let mut seen = Vec::new();
        db.identities()
            .for_each(&ctx, |identity| {
                seen.push(identity.name.clone());
                Ok::<_, DbError>(())
            })
            .await
            .unwrap();
        assert_eq!(seen, vec!["a@example.com", "b@example.com", "c@example.com"]);

        #[derive(Debug)]
        enum VisitError {
            Stop(String),
            Store(DbError),
        }
        impl From<DbError> for VisitError {
            fn from(e: DbError) -> Self {
                VisitError::Store(e)
            }
        }

        let mut seen = Vec::new();
        let err = db
            .identities()
            .for_each(&ctx, |identity| {
                seen.push(identity.name.clone());
                if identity.name == "b@example.com" {
                    return Err(VisitError::Stop(identity.name.clone()));
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VisitError::Stop(ref name) if name == "b@example.com"));
        assert_eq!(seen, vec!["a@example.com", "b@example.com"]);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_identity_clouds(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();

        create_test_cloud(&db, "test-cloud", &["test-region"]).await;
        db.clouds()
            .update_grant(&ctx, "test-cloud", "dave@example.com", Some(AccessLevel::Admin))
            .await
            .unwrap();

        let clouds = db.identities().clouds(&ctx, "dave@example.com").await.unwrap();
        assert_eq!(clouds.len(), 1);
        assert_eq!(clouds[0].cloud.name, "test-cloud");
        assert_eq!(clouds[0].access, AccessLevel::Admin);
        // Shallow: no associations are loaded
        assert!(clouds[0].cloud.regions.is_empty());
        assert!(clouds[0].cloud.grants.is_empty());

        let none = db.identities().clouds(&ctx, "eve@example.com").await.unwrap();
        assert!(none.is_empty());
    }
}
