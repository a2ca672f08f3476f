//! Expansion of folders and organizations into the projects beneath them.
//!
//! A folder or organization is expanded by listing its child folders (each expanded recursively)
//! and its child projects, then caching the union under the node's qualified path. Projects are
//! leaves and never touch the cache.
//!
//! Each call carries the chain of nodes above it. Revisiting a node on that chain is reported as a
//! [`HierarchyError::Cycle`] and descending past `max_depth` as [`HierarchyError::DepthExceeded`],
//! so a malformed hierarchy fails one assignee instead of recursing forever.
//!
//! Concurrent resolutions of the same assignee share one expansion. Nested nodes are read from and
//! written to the cache without waiting on expansions owned by other walks.

use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::cache::{CacheOutcome, HierarchyCache};
use crate::state::dedup_accounts;
use crate::upstream::models::{Assignee, AssigneeKind};
use crate::upstream::{self, HierarchyService};

#[derive(Debug, Clone, Error)]
pub enum HierarchyError {
    #[error("cycle in resource hierarchy: {path} is its own ancestor")]
    Cycle { path: String },

    #[error("resource hierarchy below {path} exceeds {max_depth} levels")]
    DepthExceeded { path: String, max_depth: usize },

    #[error("unrecognized assignee '{0}'")]
    UnknownAssigneeKind(String),

    #[error("failed to list {resource} under {parent}: {message}")]
    Upstream {
        resource: &'static str,
        parent: String,
        message: String,
    },
}

impl HierarchyError {
    fn upstream(resource: &'static str, parent: &str, cause: anyhow::Error) -> Self {
        HierarchyError::Upstream {
            resource,
            parent: parent.to_string(),
            message: format!("{cause:#}"),
        }
    }
}

pub struct HierarchyResolver {
    service: Arc<dyn HierarchyService>,
    cache: HierarchyCache,
    max_depth: usize,
}

impl HierarchyResolver {
    pub fn new(service: Arc<dyn HierarchyService>, cache: HierarchyCache, max_depth: usize) -> Self {
        Self {
            service,
            cache,
            max_depth,
        }
    }

    /// Returns the projects an assignee stands for.
    #[instrument(skip_all, fields(assignee = %assignee))]
    pub async fn resolve(&self, assignee: &Assignee) -> Result<Vec<String>, HierarchyError> {
        match assignee.kind {
            AssigneeKind::Account => Ok(vec![assignee.id.clone()]),
            AssigneeKind::Folder | AssigneeKind::Organization => {
                let accounts = self.expand(assignee.qualified(), Vec::new()).await?;
                Ok(accounts.as_ref().clone())
            }
        }
    }

    fn expand(&self, path: String, ancestors: Vec<String>) -> BoxFuture<'_, Result<Arc<Vec<String>>, HierarchyError>> {
        async move {
            if ancestors.contains(&path) {
                return Err(HierarchyError::Cycle { path });
            }
            if ancestors.len() >= self.max_depth {
                return Err(HierarchyError::DepthExceeded {
                    path,
                    max_depth: self.max_depth,
                });
            }

            // Only the walk root waits on an in-flight expansion. Nested nodes never block on
            // another walk, so walks entering a cycle at different nodes cannot wait on each other.
            let (accounts, outcome) = if ancestors.is_empty() {
                self.cache
                    .get_or_resolve(&path, self.expand_uncached(&path, &ancestors))
                    .await?
            } else if let Some(accounts) = self.cache.get(&path).await {
                (accounts, CacheOutcome::Hit)
            } else {
                let accounts = self.expand_uncached(&path, &ancestors).await?;
                self.cache.insert(path.clone(), accounts.clone()).await;
                (Arc::new(accounts), CacheOutcome::Miss)
            };
            crate::metrics::record_cache_lookup(outcome);

            Ok(accounts)
        }
        .boxed()
    }

    async fn expand_uncached(&self, path: &str, ancestors: &[String]) -> Result<Vec<String>, HierarchyError> {
        let mut chain = ancestors.to_vec();
        chain.push(path.to_string());

        let mut accounts = Vec::new();

        let mut folders = upstream::child_folders(self.service.clone(), path.to_string());
        while let Some(folder) = folders.next().await {
            let folder = folder.map_err(|e| HierarchyError::upstream("folders", path, e))?;
            let nested = self.expand(format!("folders/{}", folder.id), chain.clone()).await?;
            accounts.extend(nested.iter().cloned());
        }

        let mut projects = upstream::child_accounts(self.service.clone(), path.to_string());
        while let Some(project) = projects.next().await {
            let project = project.map_err(|e| HierarchyError::upstream("projects", path, e))?;
            accounts.push(project.id);
        }

        debug!(path, count = accounts.len(), "expanded hierarchy node");
        Ok(dedup_accounts(accounts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeHierarchy;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn cache() -> HierarchyCache {
        HierarchyCache::new(Duration::from_secs(3600), 1000)
    }

    fn org_with_folder() -> FakeHierarchy {
        FakeHierarchy::default()
            .with_folders("organizations/ORG1", &["F1"])
            .with_projects("folders/F1", &["P1", "P2"])
            .with_projects("organizations/ORG1", &["P3"])
    }

    fn as_set(accounts: Vec<String>) -> BTreeSet<String> {
        accounts.into_iter().collect()
    }

    #[tokio::test]
    async fn test_account_resolves_to_itself_without_upstream_calls() {
        let hierarchy = Arc::new(FakeHierarchy::default());
        let resolver = HierarchyResolver::new(hierarchy.clone(), cache(), 32);

        let accounts = resolver
            .resolve(&Assignee::new(AssigneeKind::Account, "P9"))
            .await
            .unwrap();

        assert_eq!(accounts, vec!["P9"]);
        assert_eq!(hierarchy.calls(), 0);
    }

    #[tokio::test]
    async fn test_organization_expands_nested_folders() {
        let resolver = HierarchyResolver::new(Arc::new(org_with_folder()), cache(), 32);

        let accounts = resolver
            .resolve(&Assignee::new(AssigneeKind::Organization, "ORG1"))
            .await
            .unwrap();

        assert_eq!(as_set(accounts), as_set(vec!["P1".into(), "P2".into(), "P3".into()]));
    }

    #[tokio::test]
    async fn test_expansion_is_idempotent_with_cold_cache() {
        let hierarchy = Arc::new(org_with_folder());
        let org = Assignee::new(AssigneeKind::Organization, "ORG1");

        let first = HierarchyResolver::new(hierarchy.clone(), cache(), 32)
            .resolve(&org)
            .await
            .unwrap();
        let second = HierarchyResolver::new(hierarchy, cache(), 32)
            .resolve(&org)
            .await
            .unwrap();

        assert_eq!(as_set(first), as_set(second));
    }

    #[tokio::test]
    async fn test_cached_subtree_skips_upstream() {
        let hierarchy = Arc::new(org_with_folder());
        let shared = cache();
        let resolver = HierarchyResolver::new(hierarchy.clone(), shared.clone(), 32);
        let org = Assignee::new(AssigneeKind::Organization, "ORG1");

        resolver.resolve(&org).await.unwrap();
        let calls_after_first = hierarchy.calls();
        assert!(calls_after_first > 0);

        resolver.resolve(&org).await.unwrap();
        resolver
            .resolve(&Assignee::new(AssigneeKind::Folder, "F1"))
            .await
            .unwrap();
        assert_eq!(hierarchy.calls(), calls_after_first);
        assert_eq!(*shared.get("folders/F1").await.unwrap(), vec!["P1", "P2"]);
    }

    #[tokio::test]
    async fn test_cycle_is_reported() {
        let hierarchy = FakeHierarchy::default()
            .with_folders("folders/A", &["B"])
            .with_folders("folders/B", &["A"]);
        let resolver = HierarchyResolver::new(Arc::new(hierarchy), cache(), 32);

        let err = resolver
            .resolve(&Assignee::new(AssigneeKind::Folder, "A"))
            .await
            .unwrap_err();

        assert!(matches!(err, HierarchyError::Cycle { ref path } if path == "folders/A"));
    }

    #[tokio::test]
    async fn test_depth_guard() {
        let hierarchy = FakeHierarchy::default()
            .with_folders("folders/1", &["2"])
            .with_folders("folders/2", &["3"])
            .with_folders("folders/3", &["4"])
            .with_projects("folders/4", &["deep"]);

        let shallow = HierarchyResolver::new(Arc::new(hierarchy.clone()), cache(), 3);
        let err = shallow
            .resolve(&Assignee::new(AssigneeKind::Folder, "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, HierarchyError::DepthExceeded { max_depth: 3, .. }));

        let deep = HierarchyResolver::new(Arc::new(hierarchy), cache(), 4);
        let accounts = deep
            .resolve(&Assignee::new(AssigneeKind::Folder, "1"))
            .await
            .unwrap();
        assert_eq!(accounts, vec!["deep"]);
    }

    #[tokio::test]
    async fn test_child_failure_aborts_branch_and_is_not_cached() {
        let hierarchy = org_with_folder().failing("folders/F1");
        let shared = cache();
        let resolver = HierarchyResolver::new(Arc::new(hierarchy), shared.clone(), 32);

        let err = resolver
            .resolve(&Assignee::new(AssigneeKind::Organization, "ORG1"))
            .await
            .unwrap_err();

        assert!(matches!(err, HierarchyError::Upstream { ref parent, .. } if parent == "folders/F1"));
        assert!(shared.get("organizations/ORG1").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolution_expands_once() {
        let hierarchy = Arc::new(org_with_folder().with_delay(Duration::from_millis(20)));
        let resolver = Arc::new(HierarchyResolver::new(hierarchy.clone(), cache(), 32));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move {
                resolver
                    .resolve(&Assignee::new(AssigneeKind::Organization, "ORG1"))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().len(), 3);
        }

        // folders + projects for ORG1, folders + projects for F1
        assert_eq!(hierarchy.calls(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cycle_entered_from_both_ends_concurrently() {
        let hierarchy = FakeHierarchy::default()
            .with_folders("folders/A", &["B"])
            .with_folders("folders/B", &["A"])
            .with_delay(Duration::from_millis(50));
        let resolver = Arc::new(HierarchyResolver::new(Arc::new(hierarchy), cache(), 32));

        let walk = |id: &'static str| {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve(&Assignee::new(AssigneeKind::Folder, id)).await })
        };
        let (a, b) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(walk("A"), walk("B")) })
            .await
            .expect("concurrent walks of a cycle must not wait on each other");

        assert!(matches!(a.unwrap(), Err(HierarchyError::Cycle { .. })));
        assert!(matches!(b.unwrap(), Err(HierarchyError::Cycle { .. })));

        for id in ["A", "B"] {
            let later = tokio::time::timeout(
                Duration::from_secs(5),
                resolver.resolve(&Assignee::new(AssigneeKind::Folder, id)),
            )
            .await
            .expect("a failed cycle must not leave a pending cache entry");
            assert!(matches!(later, Err(HierarchyError::Cycle { .. })));
        }
    }
}
