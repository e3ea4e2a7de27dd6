//! Declarative eager-loading graphs.
//!
//! Each entity declares the fixed set of associations returned with it, as a map from dotted
//! association path to [`FetchStrategy`]. Builders take a path prefix so the same association
//! set can be attached at any nesting depth: a model's region is loaded with
//! `cloud_region("cloud_region")`, yielding `cloud_region.cloud`, `cloud_region.controllers` and
//! `cloud_region.controllers.controller`.
//!
//! Hydration issues one batched `= ANY($1)` query per association path, so the number of queries
//! does not grow with the size of any collection. Associations absent from the graph are left
//! empty (`None` or an empty `Vec`).
//!
//! | entity           | associations                                                      |
//! |------------------|-------------------------------------------------------------------|
//! | cloud            | regions, regions.controllers, regions.controllers.controller,      |
//! |                  | grants, grants.identity                                           |
//! | cloud_region     | cloud, controllers, controllers.controller                        |
//! | controller       | cloud_regions, cloud_regions.cloud_region,                        |
//! |                  | cloud_regions.cloud_region.cloud                                  |
//! | model            | owner, controller, cloud_credential, grants, grants.identity,     |
//! |                  | cloud_region + cloud_region("cloud_region")                       |
//! | cloud_credential | cloud, owner, grants, grants.identity                             |
//! | identity         | (none)                                                            |

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use sqlx::PgConnection;

use crate::types::EntityKind;

/// How an association is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchStrategy {
    /// One parent row per child, looked up by the child's foreign key.
    BelongsTo,
    /// Any number of child rows, grouped by the parent's key.
    HasMany,
}

/// A set of association paths to load, each with its fetch strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadGraph {
    paths: BTreeMap<String, FetchStrategy>,
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

impl PreloadGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `name` under `prefix`.
    pub fn with(mut self, prefix: &str, name: &str, strategy: FetchStrategy) -> Self {
        self.paths.insert(join(prefix, name), strategy);
        self
    }

    pub fn merge(mut self, other: PreloadGraph) -> Self {
        self.paths.extend(other.paths);
        self
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains_key(path)
    }

    pub fn strategy(&self, path: &str) -> Option<FetchStrategy> {
        self.paths.get(path).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn paths(&self) -> impl Iterator<Item = (&str, FetchStrategy)> {
        self.paths.iter().map(|(p, s)| (p.as_str(), *s))
    }

    /// The sub-graph below `association`, with the `association.` prefix stripped.
    pub fn nested(&self, association: &str) -> PreloadGraph {
        let prefix = format!("{association}.");
        PreloadGraph {
            paths: self
                .paths
                .iter()
                .filter_map(|(path, strategy)| path.strip_prefix(&prefix).map(|rest| (rest.to_string(), *strategy)))
                .collect(),
        }
    }
}

pub fn cloud(prefix: &str) -> PreloadGraph {
    use FetchStrategy::*;
    PreloadGraph::new()
        .with(prefix, "regions", HasMany)
        .with(prefix, "regions.controllers", HasMany)
        .with(prefix, "regions.controllers.controller", BelongsTo)
        .with(prefix, "grants", HasMany)
        .with(prefix, "grants.identity", BelongsTo)
}

pub fn cloud_region(prefix: &str) -> PreloadGraph {
    use FetchStrategy::*;
    PreloadGraph::new()
        .with(prefix, "cloud", BelongsTo)
        .with(prefix, "controllers", HasMany)
        .with(prefix, "controllers.controller", BelongsTo)
}

pub fn controller(prefix: &str) -> PreloadGraph {
    use FetchStrategy::*;
    PreloadGraph::new()
        .with(prefix, "cloud_regions", HasMany)
        .with(prefix, "cloud_regions.cloud_region", BelongsTo)
        .with(prefix, "cloud_regions.cloud_region.cloud", BelongsTo)
}

pub fn model(prefix: &str) -> PreloadGraph {
    use FetchStrategy::*;
    PreloadGraph::new()
        .with(prefix, "owner", BelongsTo)
        .with(prefix, "controller", BelongsTo)
        .with(prefix, "cloud_credential", BelongsTo)
        .with(prefix, "grants", HasMany)
        .with(prefix, "grants.identity", BelongsTo)
        .with(prefix, "cloud_region", BelongsTo)
        .merge(cloud_region(&join(prefix, "cloud_region")))
}

pub fn cloud_credential(prefix: &str) -> PreloadGraph {
    use FetchStrategy::*;
    PreloadGraph::new()
        .with(prefix, "cloud", BelongsTo)
        .with(prefix, "owner", BelongsTo)
        .with(prefix, "grants", HasMany)
        .with(prefix, "grants.identity", BelongsTo)
}

pub fn identity(_prefix: &str) -> PreloadGraph {
    PreloadGraph::new()
}

/// A database row type that can be turned into its entity, loading the associations named in
/// a graph.
pub(crate) trait Hydrate: Sized + Send + 'static {
    type Entity: Send;

    const KIND: EntityKind;

    fn hydrate<'a>(
        conn: &'a mut PgConnection,
        rows: Vec<Self>,
        graph: &'a PreloadGraph,
    ) -> BoxFuture<'a, sqlx::Result<Vec<Self::Entity>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_graph() {
        let graph = cloud("");
        assert_eq!(graph.len(), 5);
        assert_eq!(graph.strategy("regions"), Some(FetchStrategy::HasMany));
        assert_eq!(graph.strategy("regions.controllers.controller"), Some(FetchStrategy::BelongsTo));
        assert!(graph.contains("grants.identity"));
        assert!(!graph.contains("regions.cloud"));
    }

    #[test]
    fn test_prefix_attaches_at_depth() {
        let graph = cloud_region("cloud_region");
        let paths: Vec<&str> = graph.paths().map(|(p, _)| p).collect();
        assert_eq!(
            paths,
            vec![
                "cloud_region.cloud",
                "cloud_region.controllers",
                "cloud_region.controllers.controller"
            ]
        );
    }

    #[test]
    fn test_model_graph_includes_region_subgraph() {
        let graph = model("");
        for path in [
            "owner",
            "controller",
            "cloud_credential",
            "grants",
            "grants.identity",
            "cloud_region",
            "cloud_region.cloud",
            "cloud_region.controllers",
            "cloud_region.controllers.controller",
        ] {
            assert!(graph.contains(path), "missing {path}");
        }
        assert_eq!(graph.len(), 9);
        // Stable shape: the region sub-graph is exactly what the region builder declares
        assert_eq!(graph.nested("cloud_region"), cloud_region(""));
    }

    #[test]
    fn test_nested_strips_prefix() {
        let graph = controller("");
        let nested = graph.nested("cloud_regions");
        assert_eq!(
            nested,
            PreloadGraph::new()
                .with("", "cloud_region", FetchStrategy::BelongsTo)
                .with("", "cloud_region.cloud", FetchStrategy::BelongsTo)
        );
        assert!(nested.nested("cloud_region").nested("cloud").is_empty());
    }

    #[test]
    fn test_identity_graph_is_empty() {
        assert!(identity("").is_empty());
        assert!(identity("owner").is_empty());
    }

    #[test]
    fn test_prefixed_graphs_compose() {
        let graph = PreloadGraph::new()
            .with("", "cloud", FetchStrategy::BelongsTo)
            .merge(cloud("cloud"));
        assert_eq!(graph.nested("cloud"), cloud(""));
    }
}
