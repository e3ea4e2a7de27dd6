//! Two-phase row merge used by the synchronization-driven `set_*` operations.
//!
//! Each row is merged with an explicit insert attempted inside a savepoint. When the insert hits
//! a unique violation the savepoint is rolled back and the caller's conflict policy applies:
//! either nothing happens, or a targeted UPDATE touches only the designated mutable columns.
//! No dialect-specific upsert clause is involved.
//!
//! Callers run a whole snapshot through [`merge_row`] on one transaction; any error other than
//! the expected unique violation propagates and the outer transaction is rolled back.

use serde::Serialize;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{Connection, PgConnection, Postgres};

/// What happened to a single row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Per-snapshot count of row outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeTally {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

impl MergeTally {
    pub fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Updated => self.updated += 1,
            MergeOutcome::Unchanged => self.unchanged += 1,
        }
    }

    /// True when the snapshot changed nothing.
    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.updated == 0
    }
}

/// The hydrated aggregate after a merge, with the per-row tally.
#[derive(Debug, Clone)]
pub struct Merged<T> {
    pub entity: T,
    pub tally: MergeTally,
}

/// Policy applied when the insert collides with an existing row.
pub(crate) enum OnConflict<'q> {
    DoNothing,
    /// Must be written to report zero affected rows when the stored values already match, so
    /// identical snapshots stay `Unchanged`.
    Update(Query<'q, Postgres, PgArguments>),
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Merge a single row. `conn` is expected to be inside a transaction.
pub(crate) async fn merge_row<'q>(
    conn: &mut PgConnection,
    insert: Query<'q, Postgres, PgArguments>,
    on_conflict: OnConflict<'q>,
) -> sqlx::Result<MergeOutcome> {
    let mut savepoint = conn.begin().await?;

    match insert.execute(&mut *savepoint).await {
        Ok(_) => {
            savepoint.commit().await?;
            Ok(MergeOutcome::Inserted)
        }
        Err(err) if is_unique_violation(&err) => {
            savepoint.rollback().await?;
            match on_conflict {
                OnConflict::DoNothing => Ok(MergeOutcome::Unchanged),
                OnConflict::Update(update) => {
                    let result = update.execute(&mut *conn).await?;
                    if result.rows_affected() > 0 {
                        Ok(MergeOutcome::Updated)
                    } else {
                        Ok(MergeOutcome::Unchanged)
                    }
                }
            }
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    async fn create_scratch_table(pool: &PgPool) {
        sqlx::query("CREATE TABLE scratch (name TEXT PRIMARY KEY, access TEXT NOT NULL, note TEXT NOT NULL)")
            .execute(pool)
            .await
            .unwrap();
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_merge_row_inserts_then_ignores(pool: PgPool) {
        create_scratch_table(&pool).await;
        let mut tx = pool.begin().await.unwrap();

        let insert = || {
            sqlx::query("INSERT INTO scratch (name, access, note) VALUES ($1, $2, $3)")
                .bind("a")
                .bind("read")
                .bind("first")
        };

        assert_eq!(
            merge_row(&mut tx, insert(), OnConflict::DoNothing).await.unwrap(),
            MergeOutcome::Inserted
        );
        assert_eq!(
            merge_row(&mut tx, insert(), OnConflict::DoNothing).await.unwrap(),
            MergeOutcome::Unchanged
        );

        // The transaction is still usable after the rolled back savepoint
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scratch")
            .fetch_one(&mut *tx)
            .await
            .unwrap();
        assert_eq!(count, 1);
        tx.commit().await.unwrap();
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_merge_row_targeted_update(pool: PgPool) {
        create_scratch_table(&pool).await;
        let mut tx = pool.begin().await.unwrap();

        let insert = |access: &'static str| {
            sqlx::query("INSERT INTO scratch (name, access, note) VALUES ($1, $2, 'from-insert')")
                .bind("a")
                .bind(access)
        };
        let update = |access: &'static str| {
            OnConflict::Update(
                sqlx::query("UPDATE scratch SET access = $2 WHERE name = $1 AND access IS DISTINCT FROM $2")
                    .bind("a")
                    .bind(access),
            )
        };

        assert_eq!(
            merge_row(&mut tx, insert("read"), update("read")).await.unwrap(),
            MergeOutcome::Inserted
        );
        assert_eq!(
            merge_row(&mut tx, insert("read"), update("read")).await.unwrap(),
            MergeOutcome::Unchanged
        );
        assert_eq!(
            merge_row(&mut tx, insert("admin"), update("admin")).await.unwrap(),
            MergeOutcome::Updated
        );

        let (access, note): (String, String) = sqlx::query_as("SELECT access, note FROM scratch WHERE name = 'a'")
            .fetch_one(&mut *tx)
            .await
            .unwrap();
        assert_eq!(access, "admin");
        assert_eq!(note, "from-insert");
    }

    #[sqlx::test(migrations = false)]
    #[test_log::test]
    async fn test_merge_row_propagates_other_errors(pool: PgPool) {
        create_scratch_table(&pool).await;
        let mut conn = pool.acquire().await.unwrap();

        // NOT NULL violation is not a conflict
        let insert = sqlx::query("INSERT INTO scratch (name, access, note) VALUES ($1, NULL, 'x')").bind("a");
        let err = merge_row(&mut conn, insert, OnConflict::DoNothing).await.unwrap_err();
        assert!(!is_unique_violation(&err));
    }

    #[test]
    fn test_tally() {
        let mut tally = MergeTally::default();
        assert!(tally.is_noop());
        tally.record(MergeOutcome::Unchanged);
        assert!(tally.is_noop());
        tally.record(MergeOutcome::Updated);
        tally.record(MergeOutcome::Inserted);
        assert_eq!(
            tally,
            MergeTally {
                inserted: 1,
                updated: 1,
                unchanged: 1
            }
        );
        assert!(!tally.is_noop());
    }
}
