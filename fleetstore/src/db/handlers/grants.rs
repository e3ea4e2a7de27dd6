//! Access-grant tables shared by clouds, models and cloud credentials.
//!
//! Each relation lives in its own join table keyed by (object id, identity name) with an
//! `access` column. "No access" is never stored: revoking deletes the row.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};

use crate::db::handlers::identities::{ensure_identity, load_identities_by_names};
use crate::db::merge::{MergeOutcome, OnConflict, merge_row};
use crate::db::models::access::{AccessGrant, AccessLevel};
use crate::db::preload::PreloadGraph;

/// Which object an access relation points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GrantTable {
    Cloud,
    Model,
    CloudCredential,
}

impl GrantTable {
    fn table(&self) -> &'static str {
        match self {
            GrantTable::Cloud => "identity_cloud_access",
            GrantTable::Model => "identity_model_access",
            GrantTable::CloudCredential => "identity_cloud_credential_access",
        }
    }

    fn object_column(&self) -> &'static str {
        match self {
            GrantTable::Cloud => "cloud_id",
            GrantTable::Model => "model_id",
            GrantTable::CloudCredential => "cloud_credential_id",
        }
    }

    fn last_connection_column(&self) -> &'static str {
        match self {
            GrantTable::Model => "last_connection",
            _ => "NULL::timestamptz",
        }
    }
}

#[derive(Debug, FromRow)]
struct GrantRow {
    object_id: i64,
    identity_name: String,
    access: AccessLevel,
    last_connection: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// A grant seen from the identity's side.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct IdentityGrant {
    pub object_id: i64,
    pub access: AccessLevel,
    pub last_connection: Option<DateTime<Utc>>,
}

/// Grants for each of `object_ids`, ordered by identity name.
pub(crate) async fn load_grants(
    conn: &mut PgConnection,
    table: GrantTable,
    object_ids: &[i64],
    graph: &PreloadGraph,
) -> sqlx::Result<HashMap<i64, Vec<AccessGrant>>> {
    if object_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let sql = format!(
        "SELECT {object} AS object_id, identity_name, access, {last_connection} AS last_connection, created_at, updated_at
         FROM {table}
         WHERE {object} = ANY($1)
         ORDER BY {object}, identity_name",
        object = table.object_column(),
        last_connection = table.last_connection_column(),
        table = table.table(),
    );
    let rows = sqlx::query_as::<_, GrantRow>(&sql)
        .bind(object_ids)
        .fetch_all(&mut *conn)
        .await?;

    let mut identities = HashMap::new();
    if graph.contains("identity") {
        let mut names: Vec<String> = rows.iter().map(|r| r.identity_name.clone()).collect();
        names.sort();
        names.dedup();
        for identity in load_identities_by_names(&mut *conn, &names).await? {
            identities.insert(identity.name.clone(), identity);
        }
    }

    let mut grants: HashMap<i64, Vec<AccessGrant>> = HashMap::new();
    for row in rows {
        let identity = identities.get(&row.identity_name).cloned();
        grants.entry(row.object_id).or_default().push(AccessGrant {
            identity_name: row.identity_name,
            access: row.access,
            last_connection: row.last_connection,
            created_at: row.created_at,
            updated_at: row.updated_at,
            identity,
        });
    }
    Ok(grants)
}

/// Grants held by `identity_name` in `table`, ordered by object id.
pub(crate) async fn load_identity_grants(
    conn: &mut PgConnection,
    table: GrantTable,
    identity_name: &str,
) -> sqlx::Result<Vec<IdentityGrant>> {
    let sql = format!(
        "SELECT {object} AS object_id, access, {last_connection} AS last_connection
         FROM {table}
         WHERE identity_name = $1
         ORDER BY {object}",
        object = table.object_column(),
        last_connection = table.last_connection_column(),
        table = table.table(),
    );
    sqlx::query_as::<_, IdentityGrant>(&sql)
        .bind(identity_name)
        .fetch_all(conn)
        .await
}

/// Insert a grant, or update only its access level and timestamp if one exists.
///
/// The identity is created on first reference with `default_access`.
pub(crate) async fn merge_grant(
    conn: &mut PgConnection,
    table: GrantTable,
    object_id: i64,
    identity_name: &str,
    access: AccessLevel,
    default_access: AccessLevel,
) -> sqlx::Result<MergeOutcome> {
    ensure_identity(&mut *conn, identity_name, default_access).await?;

    let insert_sql = format!(
        "INSERT INTO {table} ({object}, identity_name, access) VALUES ($1, $2, $3)",
        table = table.table(),
        object = table.object_column(),
    );
    let update_sql = format!(
        "UPDATE {table} SET access = $3, updated_at = NOW()
         WHERE {object} = $1 AND identity_name = $2 AND access IS DISTINCT FROM $3",
        table = table.table(),
        object = table.object_column(),
    );

    let insert = sqlx::query(&insert_sql).bind(object_id).bind(identity_name).bind(access);
    let update = sqlx::query(&update_sql).bind(object_id).bind(identity_name).bind(access);
    merge_row(conn, insert, OnConflict::Update(update)).await
}

/// Delete a grant. Returns whether a row was removed.
pub(crate) async fn revoke_grant(
    conn: &mut PgConnection,
    table: GrantTable,
    object_id: i64,
    identity_name: &str,
) -> sqlx::Result<bool> {
    let sql = format!(
        "DELETE FROM {table} WHERE {object} = $1 AND identity_name = $2",
        table = table.table(),
        object = table.object_column(),
    );
    let result = sqlx::query(&sql)
        .bind(object_id)
        .bind(identity_name)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Set or clear a grant. `None` removes the row.
pub(crate) async fn set_grant(
    conn: &mut PgConnection,
    table: GrantTable,
    object_id: i64,
    identity_name: &str,
    access: Option<AccessLevel>,
    default_access: AccessLevel,
) -> sqlx::Result<()> {
    match access {
        Some(access) => {
            merge_grant(conn, table, object_id, identity_name, access, default_access).await?;
        }
        None => {
            revoke_grant(conn, table, object_id, identity_name).await?;
        }
    }
    Ok(())
}
