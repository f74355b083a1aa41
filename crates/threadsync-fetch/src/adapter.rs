//! Normalized backend contract.
//!
//! Each backend dialect (Lemmy v3/v4, PieFed, mbin) is mapped onto this
//! trait by its own adapter; everything above it only sees normalized
//! entities and [`BackendError`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use threadsync_cache::{Comment, Community, EntityKind, Person, Post, Vote};
use tokio_util::sync::CancellationToken;

use crate::{BackendError, FetchSession, Page, PageToken, PaginatedFetcher, QueryKey};

/// Filters for a post feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostQuery {
    /// Restrict to one community (federation id); `None` for the front page.
    pub community_ap_id: Option<String>,
    pub sort: Option<String>,
    pub saved_only: bool,
}

impl PostQuery {
    pub fn query_key(&self) -> QueryKey {
        QueryKey::new(EntityKind::Post)
            .with("community", self.community_ap_id.clone())
            .with("sort", self.sort.clone())
            .with("saved_only", self.saved_only)
    }
}

/// Filters for the comments of one post.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentQuery {
    pub post_ap_id: String,
    /// Only the subtree below this comment path.
    pub parent_path: Option<String>,
    pub max_depth: Option<u32>,
    pub sort: Option<String>,
}

impl CommentQuery {
    pub fn query_key(&self) -> QueryKey {
        QueryKey::new(EntityKind::Comment)
            .with("post", self.post_ap_id.clone())
            .with("parent", self.parent_path.clone())
            .with("max_depth", self.max_depth)
            .with("sort", self.sort.clone())
    }
}

/// Filters for a community listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityQuery {
    pub search: Option<String>,
    pub subscribed_only: bool,
}

impl CommunityQuery {
    pub fn query_key(&self) -> QueryKey {
        QueryKey::new(EntityKind::Community)
            .with("search", self.search.clone())
            .with("subscribed_only", self.subscribed_only)
    }
}

/// A federated backend, normalized.
///
/// Mutations return the authoritative entity as the instance reports it
/// after the change. Reads receive the fetcher's cancellation token and
/// should abort the underlying request once it fires.
#[async_trait]
pub trait ThreadiverseAdapter: Send + Sync {
    async fn get_posts(
        &self,
        query: &PostQuery,
        page: &PageToken,
        cancel: &CancellationToken,
    ) -> Result<Page<Post>, BackendError>;

    async fn get_comments(
        &self,
        query: &CommentQuery,
        page: &PageToken,
        cancel: &CancellationToken,
    ) -> Result<Page<Comment>, BackendError>;

    async fn get_communities(
        &self,
        query: &CommunityQuery,
        page: &PageToken,
        cancel: &CancellationToken,
    ) -> Result<Page<Community>, BackendError>;

    async fn like_post(&self, post: &Post, vote: Vote) -> Result<Post, BackendError>;

    async fn save_post(&self, post: &Post, saved: bool) -> Result<Post, BackendError>;

    async fn delete_post(&self, post: &Post, deleted: bool) -> Result<Post, BackendError>;

    async fn mark_post_read(&self, post: &Post, read: bool) -> Result<Post, BackendError>;

    async fn hide_post(&self, post: &Post, hidden: bool) -> Result<Post, BackendError>;

    async fn like_comment(&self, comment: &Comment, vote: Vote) -> Result<Comment, BackendError>;

    async fn save_comment(&self, comment: &Comment, saved: bool) -> Result<Comment, BackendError>;

    async fn delete_comment(&self, comment: &Comment, deleted: bool) -> Result<Comment, BackendError>;

    /// Reply to a post, or to `parent` within it.
    async fn create_comment(
        &self,
        post: &Post,
        parent: Option<&Comment>,
        content: &str,
    ) -> Result<Comment, BackendError>;

    async fn follow_community(&self, community: &Community, follow: bool) -> Result<Community, BackendError>;

    async fn block_community(&self, community: &Community, blocked: bool) -> Result<Community, BackendError>;

    async fn block_person(&self, person: &Person, blocked: bool) -> Result<Person, BackendError>;
}

/// Drive a backend read, dropping it as soon as `cancel` fires.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    read: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(BackendError::Cancelled),
        result = read => result,
    }
}

/// Paginated controller over an adapter's post feed.
pub fn posts_fetcher(
    session: &Arc<FetchSession>,
    adapter: Arc<dyn ThreadiverseAdapter>,
    query: PostQuery,
) -> PaginatedFetcher<Post, BackendError> {
    let key = query.query_key();
    let query = Arc::new(query);
    PaginatedFetcher::new(session, &key, move |token, cancel| {
        let adapter = Arc::clone(&adapter);
        let query = Arc::clone(&query);
        async move { until_cancelled(&cancel, adapter.get_posts(&query, &token, &cancel)).await }
    })
}

/// Paginated controller over the comments of one post.
pub fn comments_fetcher(
    session: &Arc<FetchSession>,
    adapter: Arc<dyn ThreadiverseAdapter>,
    query: CommentQuery,
) -> PaginatedFetcher<Comment, BackendError> {
    let key = query.query_key();
    let query = Arc::new(query);
    PaginatedFetcher::new(session, &key, move |token, cancel| {
        let adapter = Arc::clone(&adapter);
        let query = Arc::clone(&query);
        async move { until_cancelled(&cancel, adapter.get_comments(&query, &token, &cancel)).await }
    })
}

/// Paginated controller over a community listing.
pub fn communities_fetcher(
    session: &Arc<FetchSession>,
    adapter: Arc<dyn ThreadiverseAdapter>,
    query: CommunityQuery,
) -> PaginatedFetcher<Community, BackendError> {
    let key = query.query_key();
    let query = Arc::new(query);
    PaginatedFetcher::new(session, &key, move |token, cancel| {
        let adapter = Arc::clone(&adapter);
        let query = Arc::clone(&query);
        async move { until_cancelled(&cancel, adapter.get_communities(&query, &token, &cancel)).await }
    })
}
