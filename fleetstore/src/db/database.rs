//! The store object every consumer holds.
//!
//! A [`Database`] owns the connection pool, the [`ReadinessGuard`] and the [`StoreSettings`].
//! Entity stores are borrowed from it (`db.clouds()`, `db.models()`, ...) and run each operation
//! through [`Database::run`], which checks readiness, races the operation against its
//! [`OpContext`], translates failures and records metrics.

use std::future::Future;
use std::time::Instant;

use futures::TryFutureExt;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::QueryAs;
use sqlx::{FromRow, PgPool, Postgres};
use tracing::{debug, error, info, instrument, warn};

use crate::db::context::{Interruption, OpContext};
use crate::db::errors::{DbError, ErrorCode, Failure, Op, Result, Subject};
use crate::db::handlers::{CloudCredentials, CloudRegions, Clouds, Controllers, Identities, Models};
use crate::db::metrics;
use crate::db::models::access::AccessLevel;
use crate::db::preload::{Hydrate, PreloadGraph};
use crate::db::readiness::{MigrationStart, ReadinessGuard, ReadinessState};
use crate::types::EntityKind;

/// Drops every table owned by the store, and the migration ledger.
const RESET_SQL: &str = r#"
DROP TABLE IF EXISTS
    identity_model_access,
    identity_cloud_credential_access,
    identity_cloud_access,
    models,
    cloud_credentials,
    cloud_region_controller_priorities,
    controllers,
    cloud_regions,
    clouds,
    identities,
    _sqlx_migrations
CASCADE
"#;

/// Behaviour knobs for the store, usually taken from [`crate::config::Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// Controller access given to identities created on first reference.
    pub default_controller_access: AccessLevel,
    /// Rows hydrated per batch while iterating.
    pub iteration_batch_size: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            default_controller_access: AccessLevel::AddModel,
            iteration_batch_size: 100,
        }
    }
}

/// Either a store failure or the caller's own callback error.
enum IterError<E> {
    Store(DbError),
    Callback(E),
}

#[derive(Debug)]
pub struct Database {
    pool: Option<PgPool>,
    readiness: ReadinessGuard,
    settings: StoreSettings,
}

impl Database {
    /// Bind a store to `pool`. It starts Unconfigured: call [`Database::migrate`] before use.
    pub fn new(pool: PgPool, settings: StoreSettings) -> Self {
        Self {
            pool: Some(pool),
            readiness: ReadinessGuard::new(true),
            settings,
        }
    }

    /// A store with no backing connection. Every operation fails ServerConfiguration.
    pub fn unconfigured(settings: StoreSettings) -> Self {
        Self {
            pool: None,
            readiness: ReadinessGuard::new(false),
            settings,
        }
    }

    pub fn state(&self) -> ReadinessState {
        self.readiness.state()
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn clouds(&self) -> Clouds<'_> {
        Clouds::new(self)
    }

    pub fn cloud_regions(&self) -> CloudRegions<'_> {
        CloudRegions::new(self)
    }

    pub fn controllers(&self) -> Controllers<'_> {
        Controllers::new(self)
    }

    pub fn models(&self) -> Models<'_> {
        Models::new(self)
    }

    pub fn identities(&self) -> Identities<'_> {
        Identities::new(self)
    }

    pub fn cloud_credentials(&self) -> CloudCredentials<'_> {
        CloudCredentials::new(self)
    }

    /// Bring the schema up to date and move the store to Ready.
    ///
    /// With `reset` every store table is dropped first; only use it against test or
    /// development databases. Without it migrations are applied forward-only, and a schema
    /// with migrations this build does not know fails ServerConfiguration.
    ///
    /// Only one migration runs per store: concurrent calls fail UpgradeInProgress, calls on a
    /// Ready store succeed without doing anything, and a failed migration is not retried.
    #[instrument(skip(self, ctx), err)]
    pub async fn migrate(&self, ctx: &OpContext, reset: bool) -> Result<()> {
        const OP: Op = "database.migrate";
        let started = Instant::now();

        let result = match self.readiness.begin_migration(OP) {
            Ok(MigrationStart::AlreadyReady) => {
                debug!("Database already migrated");
                Ok(())
            }
            Ok(MigrationStart::Started) => {
                let result = self.run_migrations(ctx, OP, reset).await;
                self.readiness.finish_migration(result.is_ok());
                if result.is_ok() {
                    info!(reset, "Database migrated and ready");
                }
                result
            }
            Err(e) => Err(e),
        };

        metrics::record_operation(OP, metrics::outcome_of(&result), started.elapsed());
        result
    }

    async fn run_migrations(&self, ctx: &OpContext, op: Op, reset: bool) -> Result<()> {
        let pool = self.pool.as_ref().ok_or_else(|| DbError::ServerConfiguration {
            op,
            reason: "database not configured".to_string(),
        })?;
        let subject = Subject::unchecked(EntityKind::Schema, "fleetstore");

        let work = async {
            if reset {
                warn!("Resetting database: dropping all store tables");
                sqlx::query(RESET_SQL)
                    .execute(pool)
                    .await
                    .map_err(|e| DbError::translate(op, &subject, e))?;
            }
            crate::migrator().run(pool).await.map_err(|e| DbError::from_migrate(op, e))
        };

        ctx.race(work)
            .await
            .map_err(|interruption| DbError::Cancelled { op, interruption })?
    }

    pub(crate) async fn acquire(&self) -> sqlx::Result<PoolConnection<Postgres>> {
        match &self.pool {
            Some(pool) => pool.acquire().await,
            None => Err(sqlx::Error::PoolClosed),
        }
    }

    /// Run one store operation.
    ///
    /// `fut` is only polled once the store is Ready and `subject` is a valid key, so a store
    /// that isn't ready never touches storage.
    pub(crate) async fn run<T, F>(&self, ctx: &OpContext, op: Op, subject: &Subject, fut: F) -> Result<T>
    where
        F: Future<Output = sqlx::Result<T>>,
    {
        self.run_with(ctx, op, subject, fut.map_err(Failure::from)).await
    }

    /// [`Database::run`] for operations whose steps attribute some failures to other subjects.
    pub(crate) async fn run_with<T, F>(&self, ctx: &OpContext, op: Op, subject: &Subject, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, Failure>>,
    {
        let started = Instant::now();
        let result = self.run_guarded(ctx, op, subject, fut).await;

        if let Err(e) = &result
            && e.code() == ErrorCode::Internal
        {
            error!(op, error = %e, "Store operation failed");
        }
        metrics::record_operation(op, metrics::outcome_of(&result), started.elapsed());
        result
    }

    async fn run_guarded<T, F>(&self, ctx: &OpContext, op: Op, subject: &Subject, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, Failure>>,
    {
        self.readiness.check(op)?;
        if !subject.is_valid() {
            return Err(DbError::not_found(op, subject));
        }

        match ctx.race(fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(failure.translate(op, subject)),
            Err(interruption) => Err(DbError::Cancelled { op, interruption }),
        }
    }

    /// Visit every row, hydrated with `graph`, in keyset pages of `iteration_batch_size` rows.
    ///
    /// `page` builds the query for the page after `last` (`None` for the first page), returning
    /// at most `limit` rows ordered by a unique key. Each page is read in full, hydrated and
    /// handed to `f` on the same pooled connection, so an iteration never holds more than one
    /// connection. The first error returned by `f` stops the iteration and is returned
    /// unchanged. Nothing is wrapped in a transaction.
    pub(crate) async fn iterate<'q, R, P, F, E>(
        &self,
        ctx: &OpContext,
        op: Op,
        page: P,
        graph: &PreloadGraph,
        mut f: F,
    ) -> std::result::Result<(), E>
    where
        R: Hydrate + for<'r> FromRow<'r, PgRow> + Clone + Unpin,
        P: FnMut(Option<&R>, i64) -> QueryAs<'q, Postgres, R, PgArguments>,
        F: FnMut(&R::Entity) -> std::result::Result<(), E>,
        E: From<DbError>,
    {
        let started = Instant::now();
        let subject = Subject::unchecked(R::KIND, "*");
        let result = self.iterate_guarded(ctx, op, &subject, page, graph, &mut f).await;

        let outcome = match &result {
            Ok(()) => "ok",
            Err(IterError::Store(e)) => e.code().as_str(),
            Err(IterError::Callback(_)) => metrics::OUTCOME_ABORTED,
        };
        metrics::record_operation(op, outcome, started.elapsed());

        match result {
            Ok(()) => Ok(()),
            Err(IterError::Store(e)) => Err(E::from(e)),
            Err(IterError::Callback(e)) => Err(e),
        }
    }

    async fn iterate_guarded<'q, R, P, F, E>(
        &self,
        ctx: &OpContext,
        op: Op,
        subject: &Subject,
        mut page: P,
        graph: &PreloadGraph,
        f: &mut F,
    ) -> std::result::Result<(), IterError<E>>
    where
        R: Hydrate + for<'r> FromRow<'r, PgRow> + Clone + Unpin,
        P: FnMut(Option<&R>, i64) -> QueryAs<'q, Postgres, R, PgArguments>,
        F: FnMut(&R::Entity) -> std::result::Result<(), E>,
    {
        self.readiness.check(op).map_err(IterError::Store)?;

        let store_err = |e: sqlx::Error| IterError::Store(DbError::translate(op, subject, e));
        let cancelled = |interruption: Interruption| IterError::Store(DbError::Cancelled { op, interruption });

        let mut conn = ctx.race(self.acquire()).await.map_err(cancelled)?.map_err(store_err)?;

        let batch_size = self.settings.iteration_batch_size.max(1);
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
        let mut last: Option<R> = None;

        loop {
            let rows: Vec<R> = ctx
                .race(page(last.as_ref(), limit).fetch_all(&mut *conn))
                .await
                .map_err(cancelled)?
                .map_err(store_err)?;
            let exhausted = rows.len() < batch_size;
            last = rows.last().cloned();
            if rows.is_empty() {
                return Ok(());
            }

            let entities = ctx
                .race(R::hydrate(&mut conn, rows, graph))
                .await
                .map_err(cancelled)?
                .map_err(store_err)?;
            for entity in &entities {
                f(entity).map_err(IterError::Callback)?;
            }

            if exhausted {
                return Ok(());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn readiness(&self) -> &ReadinessGuard {
        &self.readiness
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::Repository;
    use crate::db::models::clouds::CloudCreateDBRequest;
    use crate::test_utils::{create_test_cloud, migrated_database, migrated_database_with};
    use sqlx::PgPool;
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
    use std::time::Duration;

    #[tokio::test]
    async fn test_unconfigured_store_rejects_operations() {
        let db = Database::unconfigured(StoreSettings::default());
        let ctx = OpContext::background();

        let err = db.clouds().get(&ctx, "test-cloud").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerConfiguration);
        assert_eq!(err.op(), "clouds.get");

        let err = db.identities().get_identity(&ctx, "bob@example.com").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerConfiguration);

        let err = db.migrate(&ctx, false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerConfiguration);
        assert_eq!(db.state(), ReadinessState::Unconfigured);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_unmigrated_store_rejects_operations(pool: PgPool) {
        let db = Database::new(pool, StoreSettings::default());
        let ctx = OpContext::background();

        let err = db.controllers().for_each(&ctx, |_| Ok::<_, DbError>(())).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerConfiguration);

        let err = db.clouds().add(&ctx, &CloudCreateDBRequest::default()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerConfiguration);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_operations_during_migration_report_upgrade_in_progress(pool: PgPool) {
        let db = Database::new(pool, StoreSettings::default());
        db.readiness().force_state(ReadinessState::Migrating);
        let ctx = OpContext::background();

        let err = db.clouds().get(&ctx, "test-cloud").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UpgradeInProgress);

        let err = db.models().for_each(&ctx, |_| Ok::<_, DbError>(())).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UpgradeInProgress);

        let err = db.migrate(&ctx, false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UpgradeInProgress);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_migrate_is_idempotent_once_ready(pool: PgPool) {
        let db = Database::new(pool, StoreSettings::default());
        let ctx = OpContext::background();

        db.migrate(&ctx, false).await.unwrap();
        assert_eq!(db.state(), ReadinessState::Ready);
        db.migrate(&ctx, false).await.unwrap();
        assert_eq!(db.state(), ReadinessState::Ready);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_reset_drops_existing_data(pool: PgPool) {
        let ctx = OpContext::background();
        let first = migrated_database(pool.clone()).await;
        create_test_cloud(&first, "test-cloud", &["test-region"]).await;

        let second = Database::new(pool, StoreSettings::default());
        second.migrate(&ctx, true).await.unwrap();

        let err = second.clouds().get(&ctx, "test-cloud").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_unknown_migration_is_server_configuration(pool: PgPool) {
        let ctx = OpContext::background();
        migrated_database(pool.clone()).await;

        sqlx::query(
            "INSERT INTO _sqlx_migrations (version, description, success, checksum, execution_time)
             VALUES (99991231000000, 'from a newer build', TRUE, '\\x00'::bytea, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let db = Database::new(pool, StoreSettings::default());
        let err = db.migrate(&ctx, false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerConfiguration);

        // A failed migration is not retried
        assert_eq!(db.state(), ReadinessState::Unconfigured);
        let err = db.migrate(&ctx, false).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerConfiguration);
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_cancelled_context_fails_without_running(pool: PgPool) {
        let db = migrated_database(pool).await;
        let ctx = OpContext::background();
        ctx.cancellation_token().cancel();

        let err = db.clouds().get(&ctx, "test-cloud").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
    }

    async fn cloud_names(db: &Database, ctx: &OpContext) -> Result<Vec<String>> {
        let mut names = Vec::new();
        db.clouds()
            .for_each(ctx, |cloud| {
                names.push(cloud.name.clone());
                Ok::<_, DbError>(())
            })
            .await?;
        Ok(names)
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_concurrent_iterations_on_small_pool(pool_opts: PgPoolOptions, connect_opts: PgConnectOptions) {
        let pool = pool_opts
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(connect_opts)
            .await
            .unwrap();
        let settings = StoreSettings {
            iteration_batch_size: 1,
            ..Default::default()
        };
        let db = migrated_database_with(pool, settings).await;
        let ctx = OpContext::background();
        for name in ["cloud-a", "cloud-b", "cloud-c"] {
            create_test_cloud(&db, name, &["r1"]).await;
        }

        let (a, b) = tokio::join!(cloud_names(&db, &ctx), cloud_names(&db, &ctx));
        let expected = vec!["cloud-a", "cloud-b", "cloud-c"];
        assert_eq!(a.unwrap(), expected);
        assert_eq!(b.unwrap(), expected);
    }
}
