//! Normalized entity types shared by every backend dialect.
//!
//! Each entity carries its authoritative fields plus an `optimistic` overlay.
//! Overlay fields are `None` unless a user action is in flight; readers use
//! the `effective_*` accessors, which prefer the overlay.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The entity kinds that get their own cache store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Post,
    Comment,
    Community,
    Person,
}

impl EntityKind {
    /// All kinds, in a stable order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Post,
        EntityKind::Comment,
        EntityKind::Community,
        EntityKind::Person,
    ];

    /// Plural name used for blob keys and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Post => "posts",
            EntityKind::Comment => "comments",
            EntityKind::Community => "communities",
            EntityKind::Person => "persons",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optimistic fields layered over an entity's authoritative data.
pub trait Overlay:
    Clone + Default + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Keep every field set on `self`; take unset fields from `previous`.
    fn carry_over(&mut self, previous: &Self);

    /// True when no action is in flight for this entity.
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A cacheable normalized entity.
pub trait Entity: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Overlay: Overlay;

    const KIND: EntityKind;

    /// Stable federation identifier, unique across instances.
    fn natural_key(&self) -> &str;

    fn overlay(&self) -> &Self::Overlay;

    fn overlay_mut(&mut self) -> &mut Self::Overlay;
}

/// A user's vote on a post or comment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Vote {
    Down,
    #[default]
    Neutral,
    Up,
}

impl Vote {
    pub fn score(self) -> i64 {
        i8::from(self) as i64
    }
}

impl From<Vote> for i8 {
    fn from(vote: Vote) -> Self {
        match vote {
            Vote::Down => -1,
            Vote::Neutral => 0,
            Vote::Up => 1,
        }
    }
}

impl TryFrom<i8> for Vote {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Vote::Down),
            0 => Ok(Vote::Neutral),
            1 => Ok(Vote::Up),
            other => Err(format!("invalid vote value {other}, expected -1, 0 or 1")),
        }
    }
}

/// Follow state of a community.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subscription {
    #[default]
    NotSubscribed,
    /// Remote instance has not confirmed the follow yet.
    Pending,
    Subscribed,
}

// =========================================================================
// Post
// =========================================================================

/// A post in a community feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Backend-local numeric id.
    pub id: i64,
    /// Federation identifier (ActivityPub id).
    pub ap_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub community_ap_id: String,
    pub creator_ap_id: String,
    pub published: DateTime<Utc>,
    pub score: i64,
    pub upvotes: i64,
    pub downvotes: i64,
    pub comment_count: u32,
    #[serde(default)]
    pub my_vote: Vote,
    #[serde(default)]
    pub saved: bool,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub optimistic: PostOverlay,
}

/// In-flight post actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub my_vote: Option<Vote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
}

impl Overlay for PostOverlay {
    fn carry_over(&mut self, previous: &Self) {
        self.my_vote = self.my_vote.or(previous.my_vote);
        self.saved = self.saved.or(previous.saved);
        self.deleted = self.deleted.or(previous.deleted);
        self.read = self.read.or(previous.read);
        self.hidden = self.hidden.or(previous.hidden);
    }
}

impl Entity for Post {
    type Overlay = PostOverlay;

    const KIND: EntityKind = EntityKind::Post;

    fn natural_key(&self) -> &str {
        &self.ap_id
    }

    fn overlay(&self) -> &PostOverlay {
        &self.optimistic
    }

    fn overlay_mut(&mut self) -> &mut PostOverlay {
        &mut self.optimistic
    }
}

impl Post {
    pub fn effective_vote(&self) -> Vote {
        self.optimistic.my_vote.unwrap_or(self.my_vote)
    }

    /// Score as displayed, adjusted by an in-flight vote.
    pub fn effective_score(&self) -> i64 {
        self.score - self.my_vote.score() + self.effective_vote().score()
    }

    pub fn effective_saved(&self) -> bool {
        self.optimistic.saved.unwrap_or(self.saved)
    }

    pub fn effective_deleted(&self) -> bool {
        self.optimistic.deleted.unwrap_or(self.deleted)
    }

    pub fn effective_read(&self) -> bool {
        self.optimistic.read.unwrap_or(self.read)
    }

    pub fn effective_hidden(&self) -> bool {
        self.optimistic.hidden.unwrap_or(self.hidden)
    }
}

// =========================================================================
// Comment
// =========================================================================

/// A comment, addressed by its materialized path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub ap_id: String,
    pub post_ap_id: String,
    pub creator_ap_id: String,
    /// Dot-separated ancestor chain rooted at `0`, e.g. `0.12.34`.
    pub path: String,
    pub content: String,
    pub published: DateTime<Utc>,
    pub score: i64,
    pub upvotes: i64,
    pub downvotes: i64,
    /// Total descendants, not just direct replies.
    pub child_count: u32,
    #[serde(default)]
    pub my_vote: Vote,
    #[serde(default)]
    pub saved: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub optimistic: CommentOverlay,
}

/// In-flight comment actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub my_vote: Option<Vote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

impl Overlay for CommentOverlay {
    fn carry_over(&mut self, previous: &Self) {
        self.my_vote = self.my_vote.or(previous.my_vote);
        self.saved = self.saved.or(previous.saved);
        self.deleted = self.deleted.or(previous.deleted);
    }
}

impl Entity for Comment {
    type Overlay = CommentOverlay;

    const KIND: EntityKind = EntityKind::Comment;

    fn natural_key(&self) -> &str {
        &self.path
    }

    fn overlay(&self) -> &CommentOverlay {
        &self.optimistic
    }

    fn overlay_mut(&mut self) -> &mut CommentOverlay {
        &mut self.optimistic
    }
}

impl Comment {
    pub fn effective_vote(&self) -> Vote {
        self.optimistic.my_vote.unwrap_or(self.my_vote)
    }

    pub fn effective_score(&self) -> i64 {
        self.score - self.my_vote.score() + self.effective_vote().score()
    }

    pub fn effective_saved(&self) -> bool {
        self.optimistic.saved.unwrap_or(self.saved)
    }

    pub fn effective_deleted(&self) -> bool {
        self.optimistic.deleted.unwrap_or(self.deleted)
    }
}

// =========================================================================
// Community
// =========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: i64,
    pub ap_id: String,
    pub name: String,
    pub title: String,
    pub subscribers: u64,
    #[serde(default)]
    pub subscribed: Subscription,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub optimistic: CommunityOverlay,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribed: Option<Subscription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<bool>,
}

impl Overlay for CommunityOverlay {
    fn carry_over(&mut self, previous: &Self) {
        self.subscribed = self.subscribed.or(previous.subscribed);
        self.blocked = self.blocked.or(previous.blocked);
    }
}

impl Entity for Community {
    type Overlay = CommunityOverlay;

    const KIND: EntityKind = EntityKind::Community;

    fn natural_key(&self) -> &str {
        &self.ap_id
    }

    fn overlay(&self) -> &CommunityOverlay {
        &self.optimistic
    }

    fn overlay_mut(&mut self) -> &mut CommunityOverlay {
        &mut self.optimistic
    }
}

impl Community {
    pub fn effective_subscription(&self) -> Subscription {
        self.optimistic.subscribed.unwrap_or(self.subscribed)
    }

    pub fn effective_blocked(&self) -> bool {
        self.optimistic.blocked.unwrap_or(self.blocked)
    }
}

// =========================================================================
// Person
// =========================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    pub ap_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot_account: bool,
    pub post_count: u64,
    pub comment_count: u64,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub optimistic: PersonOverlay,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<bool>,
}

impl Overlay for PersonOverlay {
    fn carry_over(&mut self, previous: &Self) {
        self.blocked = self.blocked.or(previous.blocked);
    }
}

impl Entity for Person {
    type Overlay = PersonOverlay;

    const KIND: EntityKind = EntityKind::Person;

    fn natural_key(&self) -> &str {
        &self.ap_id
    }

    fn overlay(&self) -> &PersonOverlay {
        &self.optimistic
    }

    fn overlay_mut(&mut self) -> &mut PersonOverlay {
        &mut self.optimistic
    }
}

impl Person {
    pub fn effective_blocked(&self) -> bool {
        self.optimistic.blocked.unwrap_or(self.blocked)
    }
}
