//! Optimistic user actions.
//!
//! Every action follows the same flow: write the requested value into the
//! entity's overlay so the UI reflects it at once, call the backend, then
//! either store the authoritative result or roll the overlay back. In both
//! cases the overlay field set by the action ends up cleared.

use std::future::Future;
use std::sync::Arc;

use threadsync_cache::{
    CachePrefix, CacheStore, Comment, Community, Entity, Person, Post, Subscription, Vote,
};
use tracing::{debug, warn};

use crate::{ActionError, BackendError, ThreadiverseAdapter};

/// Patch, call, reconcile.
async fn optimistic<T, Fut>(
    store: &Arc<CacheStore<T>>,
    prefix: &CachePrefix,
    natural_key: &str,
    action: &'static str,
    apply: impl FnOnce(&mut T::Overlay),
    clear: impl Fn(&mut T::Overlay),
    request: Fut,
) -> Result<T, ActionError>
where
    T: Entity,
    Fut: Future<Output = Result<T, BackendError>>,
{
    store.patch_overlay(natural_key, prefix, apply)?;

    match request.await {
        Ok(mut authoritative) => {
            clear(authoritative.overlay_mut());
            let cached = store.cache_one(prefix, authoritative.clone());
            // Incoming unset fields carry over, so clear the stored one too,
            // even when persisting the result failed.
            let cleared = store.patch_overlay(authoritative.natural_key(), prefix, &clear);
            cached.and(cleared)?;
            debug!(kind = %T::KIND, action, key = natural_key, "optimistic action confirmed");
            Ok(authoritative)
        }
        Err(err) => {
            if let Err(cache_err) = store.patch_overlay(natural_key, prefix, &clear) {
                warn!(kind = %T::KIND, action, error = %cache_err, "failed to roll back overlay");
            }
            warn!(kind = %T::KIND, action, key = natural_key, error = %err, "optimistic action rolled back");
            Err(err.into())
        }
    }
}

/// Post actions against one backend and cache namespace.
pub struct PostActions {
    adapter: Arc<dyn ThreadiverseAdapter>,
    store: Arc<CacheStore<Post>>,
    prefix: CachePrefix,
}

impl PostActions {
    pub fn new(
        adapter: Arc<dyn ThreadiverseAdapter>,
        store: Arc<CacheStore<Post>>,
        prefix: CachePrefix,
    ) -> Self {
        Self {
            adapter,
            store,
            prefix,
        }
    }

    pub async fn vote(&self, post: &Post, vote: Vote) -> Result<Post, ActionError> {
        optimistic(
            &self.store,
            &self.prefix,
            &post.ap_id,
            "vote",
            |o| o.my_vote = Some(vote),
            |o| o.my_vote = None,
            self.adapter.like_post(post, vote),
        )
        .await
    }

    pub async fn save(&self, post: &Post, saved: bool) -> Result<Post, ActionError> {
        optimistic(
            &self.store,
            &self.prefix,
            &post.ap_id,
            "save",
            |o| o.saved = Some(saved),
            |o| o.saved = None,
            self.adapter.save_post(post, saved),
        )
        .await
    }

    pub async fn delete(&self, post: &Post, deleted: bool) -> Result<Post, ActionError> {
        optimistic(
            &self.store,
            &self.prefix,
            &post.ap_id,
            "delete",
            |o| o.deleted = Some(deleted),
            |o| o.deleted = None,
            self.adapter.delete_post(post, deleted),
        )
        .await
    }

    pub async fn mark_read(&self, post: &Post, read: bool) -> Result<Post, ActionError> {
        optimistic(
            &self.store,
            &self.prefix,
            &post.ap_id,
            "mark_read",
            |o| o.read = Some(read),
            |o| o.read = None,
            self.adapter.mark_post_read(post, read),
        )
        .await
    }

    pub async fn hide(&self, post: &Post, hidden: bool) -> Result<Post, ActionError> {
        optimistic(
            &self.store,
            &self.prefix,
            &post.ap_id,
            "hide",
            |o| o.hidden = Some(hidden),
            |o| o.hidden = None,
            self.adapter.hide_post(post, hidden),
        )
        .await
    }
}

/// Comment actions against one backend and cache namespace.
pub struct CommentActions {
    adapter: Arc<dyn ThreadiverseAdapter>,
    store: Arc<CacheStore<Comment>>,
    prefix: CachePrefix,
}

impl CommentActions {
    pub fn new(
        adapter: Arc<dyn ThreadiverseAdapter>,
        store: Arc<CacheStore<Comment>>,
        prefix: CachePrefix,
    ) -> Self {
        Self {
            adapter,
            store,
            prefix,
        }
    }

    pub async fn vote(&self, comment: &Comment, vote: Vote) -> Result<Comment, ActionError> {
        optimistic(
            &self.store,
            &self.prefix,
            &comment.path,
            "vote",
            |o| o.my_vote = Some(vote),
            |o| o.my_vote = None,
            self.adapter.like_comment(comment, vote),
        )
        .await
    }

    pub async fn save(&self, comment: &Comment, saved: bool) -> Result<Comment, ActionError> {
        optimistic(
            &self.store,
            &self.prefix,
            &comment.path,
            "save",
            |o| o.saved = Some(saved),
            |o| o.saved = None,
            self.adapter.save_comment(comment, saved),
        )
        .await
    }

    pub async fn delete(&self, comment: &Comment, deleted: bool) -> Result<Comment, ActionError> {
        optimistic(
            &self.store,
            &self.prefix,
            &comment.path,
            "delete",
            |o| o.deleted = Some(deleted),
            |o| o.deleted = None,
            self.adapter.delete_comment(comment, deleted),
        )
        .await
    }

    /// Post a reply and cache it. Nothing is shown before the backend
    /// assigns the new comment its path.
    pub async fn reply(
        &self,
        post: &Post,
        parent: Option<&Comment>,
        content: &str,
    ) -> Result<Comment, ActionError> {
        let comment = self.adapter.create_comment(post, parent, content).await?;
        self.store.cache_one(&self.prefix, comment.clone())?;
        debug!(path = %comment.path, "reply created");
        Ok(comment)
    }
}

/// Community actions against one backend and cache namespace.
pub struct CommunityActions {
    adapter: Arc<dyn ThreadiverseAdapter>,
    store: Arc<CacheStore<Community>>,
    prefix: CachePrefix,
}

impl CommunityActions {
    pub fn new(
        adapter: Arc<dyn ThreadiverseAdapter>,
        store: Arc<CacheStore<Community>>,
        prefix: CachePrefix,
    ) -> Self {
        Self {
            adapter,
            store,
            prefix,
        }
    }

    /// Follow or unfollow. A follow shows as pending until confirmed.
    pub async fn subscribe(&self, community: &Community, follow: bool) -> Result<Community, ActionError> {
        let shown = if follow {
            Subscription::Pending
        } else {
            Subscription::NotSubscribed
        };
        optimistic(
            &self.store,
            &self.prefix,
            &community.ap_id,
            "subscribe",
            |o| o.subscribed = Some(shown),
            |o| o.subscribed = None,
            self.adapter.follow_community(community, follow),
        )
        .await
    }

    pub async fn block(&self, community: &Community, blocked: bool) -> Result<Community, ActionError> {
        optimistic(
            &self.store,
            &self.prefix,
            &community.ap_id,
            "block",
            |o| o.blocked = Some(blocked),
            |o| o.blocked = None,
            self.adapter.block_community(community, blocked),
        )
        .await
    }
}

/// Person actions against one backend and cache namespace.
pub struct PersonActions {
    adapter: Arc<dyn ThreadiverseAdapter>,
    store: Arc<CacheStore<Person>>,
    prefix: CachePrefix,
}

impl PersonActions {
    pub fn new(
        adapter: Arc<dyn ThreadiverseAdapter>,
        store: Arc<CacheStore<Person>>,
        prefix: CachePrefix,
    ) -> Self {
        Self {
            adapter,
            store,
            prefix,
        }
    }

    pub async fn block(&self, person: &Person, blocked: bool) -> Result<Person, ActionError> {
        optimistic(
            &self.store,
            &self.prefix,
            &person.ap_id,
            "block_person",
            |o| o.blocked = Some(blocked),
            |o| o.blocked = None,
            self.adapter.block_person(person, blocked),
        )
        .await
    }
}
