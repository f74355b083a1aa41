//! Normalized entity cache for threadiverse (Lemmy, PieFed, mbin) clients.
//!
//! This crate holds the client-side state that outlives a single screen:
//! entities fetched from a federated backend, the optimistic overlays that
//! user actions place on top of them, and the pure comment-thread builder.
//!
//! ## Features
//!
//! - **Cache**: Generic [`CacheStore`] per entity kind with an overlay-preserving merge
//! - **Prefix**: Namespacing of cache keys per instance and login state
//! - **Blob**: Durable key-value persistence of each store's full map
//! - **Comment tree**: Nested thread reconstruction from materialized paths

pub mod blob;
pub mod cache;
pub mod comment_tree;
mod error;
mod lock;
mod prefix;
mod types;

pub use blob::{BlobStore, FileBlobStore, MemoryBlobStore};
pub use cache::{CacheConfig, CacheEvent, CacheRecord, CacheStore, MAX_CACHE_AGE_SECS};
pub use comment_tree::{CommentId, CommentTree, CommentTreeNode, ThreadComment, build_comment_tree};
pub use error::CacheError;
pub use prefix::CachePrefix;
pub use types::*;
