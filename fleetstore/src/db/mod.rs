//! Database layer for the control plane.
//!
//! This module implements the persistence layer using SQLx with PostgreSQL.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │  Database   │  (readiness, contexts, error translation, metrics)
//! └──────┬──────┘
//!        │
//!        ↓
//! ┌─────────────┐
//! │   Stores    │  (db::handlers - queries, merges, grants)
//! └──────┬──────┘
//!        │
//!        ↓
//! ┌─────────────┐
//! │   Preload   │  (db::preload - association hydration)
//! └──────┬──────┘
//!        │
//!        ↓
//! ┌─────────────┐
//! │  PostgreSQL │
//! └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`database`]: the store handle and its operation runner
//! - [`readiness`]: the Unconfigured / Migrating / Ready state machine
//! - [`errors`]: the store's error taxonomy and backend error translation
//! - [`context`]: per-operation cancellation and deadlines
//! - [`preload`]: which associations each fetch returns
//! - [`merge`]: insert-or-update with per-row outcomes
//! - [`handlers`]: entity stores
//! - [`models`]: request and response records
//!
//! # Migrations
//!
//! Schema migrations are managed by SQLx and located in the `migrations/` directory. They are
//! applied through [`Database::migrate`], which also moves the store to Ready:
//!
//! ```ignore
//! let db = fleetstore::db::Database::new(pool, StoreSettings::default());
//! db.migrate(&OpContext::background(), false).await?;
//! ```

pub mod context;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod merge;
pub(crate) mod metrics;
pub mod models;
pub mod preload;
pub mod readiness;

pub use database::{Database, StoreSettings};
