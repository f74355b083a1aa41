//! Throttled fetching and optimistic actions for threadiverse clients.
//!
//! This crate sits between the UI and a normalized backend adapter:
//! - Rate-limits repeated fetches per query with [`ThrottleQueue`]
//! - Paginates queries with [`PaginatedFetcher`], writing pages into the cache
//! - Applies user actions optimistically over [`threadsync_cache`] stores
//! - Scopes warm queries and queues to a [`FetchSession`]

mod actions;
mod adapter;
mod error;
mod lock;
mod page;
mod paginate;
mod registry;
mod session;
mod throttle;

pub use actions::{CommentActions, CommunityActions, PersonActions, PostActions};
pub use adapter::{
    CommentQuery, CommunityQuery, PostQuery, ThreadiverseAdapter, comments_fetcher,
    communities_fetcher, posts_fetcher,
};
pub use error::{ActionError, BackendError, FetchError, ThrottleError};
pub use page::{INIT_PAGE_TOKEN, Page, PageToken, QueryKey};
pub use paginate::{FetchedPage, MAX_REFETCH_PAGES, PaginatedFetcher};
pub use registry::{QueueLease, QueueRegistry};
pub use session::FetchSession;
pub use throttle::{DEFAULT_INTERVAL, DEFAULT_TICK, Enqueued, QueueState, ThrottleConfig, ThrottleQueue};
