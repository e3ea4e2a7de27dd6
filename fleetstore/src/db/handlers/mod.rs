//! Entity stores for the control plane aggregates.
//!
//! Each store borrows the [`Database`](crate::db::Database) and runs every operation through it,
//! so readiness, cancellation and error translation behave the same everywhere. Stores implement
//! the [`Repository`] trait for create/get/update/delete and add inherent methods for iteration,
//! access grants and merges.
//!
//! # Available Stores
//!
//! - [`Clouds`]: clouds, their regions and cloud grants
//! - [`CloudRegions`]: single regions and controller priorities
//! - [`Controllers`]: controllers and the regions they serve
//! - [`Models`]: models and model grants
//! - [`Identities`]: identities, created on first reference
//! - [`CloudCredentials`]: credentials and credential grants
//!
//! # Common Pattern
//!
//! ```ignore
//! use fleetstore::db::handlers::Repository;
//! use fleetstore::db::context::OpContext;
//!
//! async fn example(db: &fleetstore::db::Database) -> fleetstore::db::errors::Result<()> {
//!     let ctx = OpContext::background();
//!     let cloud = db.clouds().get(&ctx, "aws").await?;
//!     for region in &cloud.regions {
//!         println!("{}/{}", cloud.name, region.name);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cloud_credentials;
pub mod cloud_regions;
pub mod clouds;
pub mod controllers;
pub(crate) mod grants;
pub mod identities;
pub mod models;
pub mod repository;

pub use cloud_credentials::CloudCredentials;
pub use cloud_regions::CloudRegions;
pub use clouds::Clouds;
pub use controllers::Controllers;
pub use identities::{Identities, IdentityCloudAccess, IdentityModelAccess};
pub use models::Models;
pub use repository::Repository;
