//! # fleetstore: persistence for a multi-cloud orchestration control plane
//!
//! `fleetstore` stores the control plane's view of its fleet: clouds and their regions, the
//! controllers that host models in those regions, the models themselves, the identities that use
//! them, the cloud credentials models are deployed with, and the access grants joining identities
//! to clouds, models and credentials.
//!
//! ## Overview
//!
//! Consumers hold one [`db::Database`]. It is bound to a PostgreSQL pool, starts Unconfigured, and
//! becomes Ready once [`db::Database::migrate`] has applied the schema. Every operation is checked
//! against that state first, so callers see a clean ServerConfiguration or UpgradeInProgress error
//! instead of a backend failure while the schema is missing or changing.
//!
//! Entity stores are borrowed from the database handle:
//!
//! - `db.clouds()`, `db.cloud_regions()`, `db.controllers()`, `db.models()`,
//!   `db.identities()`, `db.cloud_credentials()`
//!
//! They share the [`db::handlers::Repository`] trait for add/get/update/delete and add inherent
//! methods for ordered iteration, grant changes and snapshot merges. Results carry their
//! associations as the entity's preload graph describes (see [`db::preload`]).
//!
//! A synchronization component feeds full snapshots through `set_cloud` and
//! `set_cloud_credential`. Those merges are additive for structural children, update grants in
//! place, run in one transaction and report what they inserted, updated and left alone.
//!
//! ## Quick Start
//!
//! ```no_run
//! use fleetstore::db::context::OpContext;
//! use fleetstore::db::handlers::Repository;
//! use fleetstore::{Config, config::Args};
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(&Args::parse())?;
//!     let pool = fleetstore::connect_pool(&config).await?;
//!     let db = fleetstore::db::Database::new(pool, config.store_settings());
//!
//!     let ctx = OpContext::background();
//!     db.migrate(&ctx, false).await?;
//!
//!     let identity = db.identities().get_identity(&ctx, "alice@example.com").await?;
//!     println!("{} has {} access", identity.name, identity.controller_access);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod config;
pub mod db;
pub mod telemetry;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use sqlx::PgPool;
use tracing::{info, instrument};

pub use config::Config;

/// Get the fleetstore database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Open the connection pool described by `config.database`.
#[instrument(skip_all, err)]
pub async fn connect_pool(config: &Config) -> sqlx::Result<PgPool> {
    let settings = &config.database.pool;
    let pool = settings.pool_options().connect(&config.database.url).await?;
    info!(
        max_connections = settings.max_connections,
        min_connections = settings.min_connections,
        "Connected to database"
    );
    Ok(pool)
}
