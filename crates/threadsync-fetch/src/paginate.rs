//! Throttled, paginated fetching for one query.

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use threadsync_cache::{CacheError, CachePrefix, CacheStore, Entity};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{FetchError, FetchSession, Page, PageToken, QueryKey, QueueLease};

/// Upper bound on pages re-fetched by a manual refresh.
pub const MAX_REFETCH_PAGES: usize = 3;

type FetchPageFn<T, E> =
    Arc<dyn Fn(PageToken, CancellationToken) -> BoxFuture<'static, Result<Page<T>, E>> + Send + Sync>;

type PageSink<T> = Box<dyn Fn(&[T]) -> Result<(), CacheError> + Send + Sync>;

/// A page together with the token it was fetched with.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage<T> {
    pub token: PageToken,
    pub page: Page<T>,
}

/// Fetches the pages of one query through the session's throttle queue.
///
/// Every request is enqueued on the queue leased for the query's canonical
/// key, so views showing the same query share one rate limit.
pub struct PaginatedFetcher<T, E> {
    key: String,
    session: Arc<FetchSession>,
    lease: Option<QueueLease>,
    fetch_page: FetchPageFn<T, E>,
    sink: Option<PageSink<T>>,
    pages: Vec<FetchedPage<T>>,
    cancel: CancellationToken,
}

impl<T, E> PaginatedFetcher<T, E>
where
    T: Send + Sync + 'static,
    E: Send + 'static,
{
    /// Create a controller for `query`. Must be called from within a Tokio
    /// runtime, since it may start the query's throttle queue.
    pub fn new<F, Fut>(session: &Arc<FetchSession>, query: &QueryKey, fetch_page: F) -> Self
    where
        F: Fn(PageToken, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Page<T>, E>> + Send + 'static,
    {
        let key = query.canonical();
        let lease = session.lease(&key);
        Self {
            key,
            session: Arc::clone(session),
            lease: Some(lease),
            fetch_page: Arc::new(move |token, cancel| fetch_page(token, cancel).boxed()),
            sink: None,
            pages: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Seed the controller with pages restored from an earlier session.
    pub fn with_pages(mut self, pages: Vec<FetchedPage<T>>) -> Self {
        self.pages = pages;
        self
    }

    /// Write every fetched page's items into `store` under `prefix`.
    pub fn cache_into(mut self, store: Arc<CacheStore<T>>, prefix: CachePrefix) -> Self
    where
        T: Entity,
    {
        self.sink = Some(Box::new(move |items: &[T]| {
            store.cache_many(&prefix, items.iter().cloned())
        }));
        self
    }

    /// Canonical query key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pages(&self) -> &[FetchedPage<T>] {
        &self.pages
    }

    /// Items of all pages, in feed order.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.pages.iter().flat_map(|fetched| fetched.page.items.iter())
    }

    /// Whether another page can be fetched. True before the first fetch.
    pub fn has_next_page(&self) -> bool {
        self.pages
            .last()
            .is_none_or(|fetched| fetched.page.next_page.is_some())
    }

    pub fn is_warm(&self) -> bool {
        self.session.is_warm(&self.key)
    }

    /// Refresh on mount or focus, unless this query was already fetched in
    /// the session. Returns whether a refetch ran.
    #[tracing::instrument(skip_all, fields(key = %self.key))]
    pub async fn auto_refetch(&mut self) -> Result<bool, FetchError<E>> {
        if self.is_warm() {
            trace!("query warm, skipping automatic refetch");
            return Ok(false);
        }
        self.refetch().await?;
        Ok(true)
    }

    /// Re-fetch the first pages from the start of the feed.
    ///
    /// Cached pages beyond [`MAX_REFETCH_PAGES`] are dropped first; the kept
    /// ones are pre-approved on the queue so the refresh is not throttled.
    /// Credits left over when the feed ends early or a fetch fails are
    /// withdrawn again. Returns the number of pages held afterwards.
    #[tracing::instrument(skip_all, fields(key = %self.key))]
    pub async fn refetch(&mut self) -> Result<usize, FetchError<E>> {
        let kept = self.pages.len().clamp(1, MAX_REFETCH_PAGES);
        if self.pages.len() > kept {
            debug!(dropped = self.pages.len() - kept, kept, "truncating cached pages");
            self.pages.truncate(kept);
        }
        self.lease()?.pre_approve(kept);

        let mut attempted = 0;
        let refreshed = self.refill(kept, &mut attempted).await;

        let unused = kept - attempted;
        if unused > 0 {
            if let Some(lease) = &self.lease {
                lease.revoke(unused);
            }
        }

        self.pages = refreshed?;
        debug!(pages = self.pages.len(), "refetch complete");
        Ok(self.pages.len())
    }

    /// Fetch up to `count` pages from the start, counting each request.
    async fn refill(
        &self,
        count: usize,
        attempted: &mut usize,
    ) -> Result<Vec<FetchedPage<T>>, FetchError<E>> {
        let mut refreshed = Vec::with_capacity(count);
        let mut token = PageToken::Initial;
        for _ in 0..count {
            *attempted += 1;
            let page = self.fetch_one(token.clone(), false).await?;
            let next = page.next_token();
            refreshed.push(FetchedPage { token, page });
            match next {
                Some(next) => token = next,
                None => break,
            }
        }
        Ok(refreshed)
    }

    /// Fetch the page after the last one held, bypassing the interval.
    ///
    /// Returns `Ok(None)` when the last page has no successor.
    pub async fn fetch_next_page(&mut self) -> Result<Option<&Page<T>>, FetchError<E>> {
        let token = match self.pages.last() {
            None => PageToken::Initial,
            Some(last) => match last.page.next_token() {
                Some(token) => token,
                None => {
                    trace!(key = %self.key, "no next page");
                    return Ok(None);
                }
            },
        };

        let page = self.fetch_one(token.clone(), true).await?;
        self.pages.push(FetchedPage { token, page });
        debug!(key = %self.key, pages = self.pages.len(), "next page fetched");
        Ok(self.pages.last().map(|fetched| &fetched.page))
    }

    /// Cancel in-flight fetches and give up the queue lease.
    pub fn teardown(&mut self) {
        self.cancel.cancel();
        if self.lease.take().is_some() {
            debug!(key = %self.key, "paginated fetcher torn down");
        }
    }

    fn lease(&self) -> Result<&QueueLease, FetchError<E>> {
        self.lease.as_ref().ok_or(FetchError::Cancelled)
    }

    async fn fetch_one(&self, token: PageToken, flush: bool) -> Result<Page<T>, FetchError<E>> {
        let lease = self.lease()?;
        if self.cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let fetch = Arc::clone(&self.fetch_page);
        let cancel = self.cancel.child_token();
        let pending = lease.enqueue(move || fetch(token, cancel));
        if flush {
            lease.flush();
        }

        let page = tokio::select! {
            _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
            result = pending => result?,
        };

        if let Some(sink) = &self.sink {
            sink(&page.items)?;
        }
        self.session.mark_warm(&self.key);
        Ok(page)
    }
}

impl<T, E> Drop for PaginatedFetcher<T, E> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
