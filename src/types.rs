use crate::cache::EntityCache;
use crate::error::FetchError;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadingStatus {
    Loading,
    Ready,
    Error,
}

impl Display for LoadingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Opaque pagination cursor. Views never look inside; they only hand it back to the getter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new<S: Into<String>>(link: S) -> Self {
        Self(link.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContinuationToken {
    fn from(link: &str) -> Self {
        Self::new(link)
    }
}

impl From<String> for ContinuationToken {
    fn from(link: String) -> Self {
        Self(link)
    }
}

/// One page of a list.
#[derive(Debug, Clone, PartialEq)]
pub struct ListResponse<E> {
    pub items:     Vec<E>,
    pub next_link: Option<ContinuationToken>,
}

impl<E> ListResponse<E> {
    pub fn new(items: Vec<E>, next_link: Option<ContinuationToken>) -> Self {
        Self { items, next_link }
    }

    pub fn last_page(items: Vec<E>) -> Self {
        Self { items, next_link: None }
    }

    pub fn empty() -> Self {
        Self {
            items:     Vec::new(),
            next_link: None,
        }
    }
}

/// Live content of an [`EntityCache`] at some point in time.
pub type ItemMap<E> = Arc<HashMap<String, Arc<E>>>;

/// Resolves the cache a view must work with for the given params.
pub type CacheAccessor<E, P> = Arc<dyn Fn(&P) -> Arc<EntityCache<E>> + Send + Sync + 'static>;

/// Decides whether a fetch error is to be surfaced. Returning `false` makes the view act as if the request succeeded.
pub type ErrorHook = Arc<dyn Fn(&FetchError) -> bool + Send + Sync + 'static>;
