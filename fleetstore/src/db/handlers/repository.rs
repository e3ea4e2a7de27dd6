//! Base repository trait for entity stores.

/// Contains the Repository trait.
///
/// A repository is the data access layer for one aggregate. It provides insert-only creation,
/// lookup by natural key, overwrite of mutable scalar fields, and deletion. Iteration and the
/// aggregate-specific operations (grants, merges, lookups by secondary key) are inherent methods
/// on each store.
///
/// Every method takes an [`OpContext`] and is gated by the store's readiness state.
use crate::db::context::OpContext;
use crate::db::errors::Result;

/// Base repository trait providing common database operations
///
/// This trait has separate associated types for create requests, update requests, and responses.
#[async_trait::async_trait]
pub trait Repository {
    /// The request type for creating entities
    type CreateRequest: Sync;

    /// The request type for updating entities. Carries scalar fields only.
    type UpdateRequest: Sync;

    /// The hydrated type returned by operations
    type Response;

    /// The natural key used for lookups
    type Key: ?Sized + Sync;

    /// Insert a new entity. Fails AlreadyExists if its natural key is taken.
    async fn add(&self, ctx: &OpContext, request: &Self::CreateRequest) -> Result<Self::Response>;

    /// Get an entity by key, with its preload graph. Fails NotFound if absent.
    async fn get(&self, ctx: &OpContext, key: &Self::Key) -> Result<Self::Response>;

    /// Overwrite an entity's mutable scalar fields. Fails NotFound if absent.
    async fn update(&self, ctx: &OpContext, key: &Self::Key, request: &Self::UpdateRequest) -> Result<Self::Response>;

    /// Delete an entity by key. Fails NotFound if absent.
    async fn delete(&self, ctx: &OpContext, key: &Self::Key) -> Result<()>;
}
