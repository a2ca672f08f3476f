//! Upstream service seams.
//!
//! The pipeline talks to three services: reservations, the resource hierarchy, and running
//! workloads. Each is an `async_trait` so the pipeline can be driven against in-memory fakes in
//! tests and against the Google Cloud REST APIs in production (see [`google`]).
//!
//! Listing calls return one [`Page`] at a time; [`paginate`] turns a page-fetching closure into a
//! stream that yields items until the last page or the first error.

pub mod google;
pub mod models;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use crate::errors::Result;
use models::{Account, Assignment, Folder, ReservationRecord, WorkloadDetail, WorkloadRef};

/// One page of a listing call.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_page_token: None,
        }
    }
}

#[async_trait]
pub trait ReservationService: Send + Sync {
    /// Lists reservations under `projects/{p}/locations/{l}`.
    async fn list_reservations(&self, parent: &str, page_token: Option<String>) -> anyhow::Result<Page<ReservationRecord>>;

    /// Lists assignments under a reservation's full resource path.
    async fn list_assignments(&self, parent: &str, page_token: Option<String>) -> anyhow::Result<Page<Assignment>>;
}

#[async_trait]
pub trait HierarchyService: Send + Sync {
    /// Lists folders directly beneath `parent` (`folders/..` or `organizations/..`).
    async fn list_child_folders(&self, parent: &str, page_token: Option<String>) -> anyhow::Result<Page<Folder>>;

    /// Lists projects directly beneath `parent`.
    async fn list_child_accounts(&self, parent: &str, page_token: Option<String>) -> anyhow::Result<Page<Account>>;
}

#[async_trait]
pub trait WorkloadService: Send + Sync {
    /// Lists running jobs from all users in `account`.
    async fn list_running_workloads(&self, account: &str, page_token: Option<String>) -> anyhow::Result<Page<WorkloadRef>>;

    async fn get_workload_detail(&self, account: &str, workload: &WorkloadRef) -> anyhow::Result<WorkloadDetail>;
}

/// Builds upstream clients. Called once per pipeline run so each run gets fresh credentials.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn reservation_service(&self) -> Result<Arc<dyn ReservationService>>;
    async fn hierarchy_service(&self) -> Result<Arc<dyn HierarchyService>>;
    async fn workload_service(&self) -> Result<Arc<dyn WorkloadService>>;
}

struct Cursor<F, T> {
    fetch: F,
    buffer: VecDeque<T>,
    next_page_token: Option<String>,
    exhausted: bool,
}

/// Drives a page-fetching closure until the listing is exhausted.
///
/// The closure receives the page token for the next request (`None` for the first page). An error
/// is yielded once and ends the stream, so items already yielded stay with the caller.
pub fn paginate<'a, T, F, Fut>(fetch: F) -> BoxStream<'a, anyhow::Result<T>>
where
    T: Send + 'a,
    F: FnMut(Option<String>) -> Fut + Send + 'a,
    Fut: Future<Output = anyhow::Result<Page<T>>> + Send + 'a,
{
    let cursor = Cursor {
        fetch,
        buffer: VecDeque::new(),
        next_page_token: None,
        exhausted: false,
    };

    stream::unfold(cursor, |mut cursor| async move {
        loop {
            if let Some(item) = cursor.buffer.pop_front() {
                return Some((Ok(item), cursor));
            }
            if cursor.exhausted {
                return None;
            }
            match (cursor.fetch)(cursor.next_page_token.take()).await {
                Ok(page) => {
                    cursor.buffer.extend(page.items);
                    cursor.next_page_token = page.next_page_token.filter(|token| !token.is_empty());
                    cursor.exhausted = cursor.next_page_token.is_none();
                }
                Err(e) => {
                    cursor.exhausted = true;
                    return Some((Err(e), cursor));
                }
            }
        }
    })
    .boxed()
}

pub fn reservations(service: Arc<dyn ReservationService>, parent: String) -> BoxStream<'static, anyhow::Result<ReservationRecord>> {
    paginate(move |token| {
        let service = service.clone();
        let parent = parent.clone();
        async move { service.list_reservations(&parent, token).await }
    })
}

pub fn assignments(service: Arc<dyn ReservationService>, parent: String) -> BoxStream<'static, anyhow::Result<Assignment>> {
    paginate(move |token| {
        let service = service.clone();
        let parent = parent.clone();
        async move { service.list_assignments(&parent, token).await }
    })
}

pub fn child_folders(service: Arc<dyn HierarchyService>, parent: String) -> BoxStream<'static, anyhow::Result<Folder>> {
    paginate(move |token| {
        let service = service.clone();
        let parent = parent.clone();
        async move { service.list_child_folders(&parent, token).await }
    })
}

pub fn child_accounts(service: Arc<dyn HierarchyService>, parent: String) -> BoxStream<'static, anyhow::Result<Account>> {
    paginate(move |token| {
        let service = service.clone();
        let parent = parent.clone();
        async move { service.list_child_accounts(&parent, token).await }
    })
}

pub fn running_workloads(service: Arc<dyn WorkloadService>, account: String) -> BoxStream<'static, anyhow::Result<WorkloadRef>> {
    paginate(move |token| {
        let service = service.clone();
        let account = account.clone();
        async move { service.list_running_workloads(&account, token).await }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_paginate_follows_tokens() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let items: Vec<u32> = paginate(move |token| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(match token.as_deref() {
                    None => Page {
                        items: vec![1, 2],
                        next_page_token: Some("a".to_string()),
                    },
                    Some("a") => Page {
                        items: vec![],
                        next_page_token: Some("b".to_string()),
                    },
                    Some("b") => Page::last(vec![3]),
                    Some(other) => anyhow::bail!("unexpected token {other}"),
                })
            }
        })
        .try_collect()
        .await
        .unwrap();

        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_paginate_empty_token_ends_listing() {
        let items: Vec<u32> = paginate(|_| async {
            Ok(Page {
                items: vec![7],
                next_page_token: Some(String::new()),
            })
        })
        .try_collect()
        .await
        .unwrap();

        assert_eq!(items, vec![7]);
    }

    #[tokio::test]
    async fn test_paginate_error_ends_stream_after_partial_results() {
        let results: Vec<anyhow::Result<u32>> = paginate(|token| async move {
            match token {
                None => Ok(Page {
                    items: vec![1, 2],
                    next_page_token: Some("next".to_string()),
                }),
                Some(_) => Err(anyhow::anyhow!("quota exceeded")),
            }
        })
        .collect()
        .await;

        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().unwrap(), 1);
        assert_eq!(*results[1].as_ref().unwrap(), 2);
        assert!(results[2].as_ref().unwrap_err().to_string().contains("quota exceeded"));
    }
}
