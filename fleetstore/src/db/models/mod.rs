//! Database record structures.
//!
//! Each entity has a create request, an update request carrying only mutable scalar fields, and
//! a response hydrated according to the entity's preload graph (see [`crate::db::preload`]).
//! Owned collections such as regions and access grants never appear in update requests; they
//! are changed through their own operations.

use std::collections::BTreeMap;

pub mod access;
pub mod cloud_credentials;
pub mod clouds;
pub mod controllers;
pub mod identities;
pub mod models;

/// Free-form configuration attached to clouds, regions and controllers.
pub type ConfigMap = BTreeMap<String, serde_json::Value>;
