//! Pages, page tokens, and query identity.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use threadsync_cache::EntityKind;

/// Token standing for "first page" in cached page lists.
pub const INIT_PAGE_TOKEN: &str = "__init__";

/// Where a page fetch starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageToken {
    /// The first page. Never sent to the backend.
    Initial,
    /// A backend-issued cursor.
    Cursor(String),
}

impl PageToken {
    /// Parse a stored token, mapping [`INIT_PAGE_TOKEN`] back to `Initial`.
    pub fn parse(token: &str) -> Self {
        if token == INIT_PAGE_TOKEN {
            PageToken::Initial
        } else {
            PageToken::Cursor(token.to_string())
        }
    }

    /// Value to pass to the backend's cursor parameter, if any.
    pub fn as_backend_param(&self) -> Option<&str> {
        match self {
            PageToken::Initial => None,
            PageToken::Cursor(cursor) => Some(cursor),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PageToken::Initial => INIT_PAGE_TOKEN,
            PageToken::Cursor(cursor) => cursor,
        }
    }

    pub fn is_initial(&self) -> bool {
        matches!(self, PageToken::Initial)
    }
}

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor of the following page; `None` on the last page.
    #[serde(default)]
    pub next_page: Option<String>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next_page: Option<String>) -> Self {
        Self { items, next_page }
    }

    pub fn next_token(&self) -> Option<PageToken> {
        self.next_page.clone().map(PageToken::Cursor)
    }
}

/// Identity of a paginated query, independent of the page being fetched.
///
/// Two keys are the same query exactly when their canonical forms match;
/// parameter insertion order does not matter.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryKey {
    kind: EntityKind,
    params: BTreeMap<String, Value>,
}

impl QueryKey {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter. `null` values are dropped so that an absent
    /// optional filter and an explicit `None` are the same query.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        if !value.is_null() {
            self.params.insert(name.into(), value);
        }
        self
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Stable serialized form, used as the queue and warm-key identity.
    pub fn canonical(&self) -> String {
        json!({
            "kind": self.kind,
            "params": self.params,
        })
        .to_string()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}
