//! # entity-views
//!
//! Reactive entity cache with de-duplicated, paginated and polled views over remote collections.
//!
//! Think of it as the data layer between a UI and a REST API: the UI looks at views, views pull data through getters
//! and keep it in shared caches, and every view sharing a cache sees every change made through it.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - Remote, key-indexed collections of records; e.g., pools, jobs, or files of a cloud service.
//! - Records are fetched one by one or a page at a time, following continuation tokens.
//! - Several parts of an application look at the same records and must agree on their content.
//!
//! It operates on the following principles:
//!
//! - Records are immutable snapshots. A change is a replacement of the snapshot in the cache.
//! - Caches are explicit objects, passed to views through cache accessors. A [`CacheRegistry`] groups the caches of
//!   one scope so they can be cleared together.
//! - Views never hold records, only keys. What a view shows is always resolved against the live cache content.
//! - Notifications are delivered synchronously, after the state change is complete, and are never re-entrant.
//! - Network I/O is behind the [`EntityGetter`] and [`ListGetter`] traits and runs on tokio.
//!
//! # Views
//!
//! [`EntityView`] shows a single record. [`ListView`] shows a paginated list. Both share the mechanics implemented by
//! [`ViewCore`]:
//!
//! - at most one request in flight per view, concurrent requests are joined;
//! - params changes abort the outstanding request and discard its response;
//! - a status stream (`Loading`, `Ready`, `Error`) and an error stream, with an optional hook to silence errors;
//! - polling with a single timer per view, keyed by the current query.
//!
//! ```ignore
//! let cache = EntityCache::<Job>::new();
//! let view = ListView::<Job, JobParams>::builder()
//!     .cache(fixed_cache(&cache))
//!     .getter(Arc::new(JobListGetter::new(client)))
//!     .initial_options(ListOptions::new().with_filter(Filter::prop("state").eq("active")))
//!     .build()?;
//! view.set_params(JobParams { pool_id: "pool-1".into() });
//! let _sub = view.items().subscribe(|jobs| render(jobs));
//! view.fetch_next(false).wait().await?;
//! view.start_poll(Duration::from_secs(10), false);
//! ```

pub mod cache;
pub mod entity_view;
pub mod error;
pub mod filter;
pub mod list_view;
pub mod observable;
pub mod options;
pub mod poll;
pub mod query_cache;
pub mod registry;
pub mod traits;
pub mod types;
pub mod view;

#[doc(inline)]
pub use cache::CacheConfig;
#[doc(inline)]
pub use cache::EntityCache;
#[doc(inline)]
pub use entity_view::EntityView;
#[doc(inline)]
pub use error::FetchError;
#[doc(inline)]
pub use error::ViewError;
#[doc(inline)]
pub use list_view::ListView;
#[doc(inline)]
pub use observable::Subscription;
#[doc(inline)]
pub use registry::CacheRegistry;
#[doc(inline)]
pub use traits::EntityGetter;
#[doc(inline)]
pub use traits::ListGetter;
#[doc(inline)]
pub use view::ViewCore;

pub mod prelude {
    pub use crate::cache::CacheConfig;
    pub use crate::cache::EntityCache;
    pub use crate::entity_view::EntityView;
    pub use crate::error::FetchError;
    pub use crate::error::ViewError;
    pub use crate::filter::Filter;
    pub use crate::list_view::ListView;
    pub use crate::observable::BehaviorSubject;
    pub use crate::observable::Dispatcher;
    pub use crate::observable::Subject;
    pub use crate::observable::Subscription;
    pub use crate::options::ListOptions;
    pub use crate::registry::fixed_cache;
    pub use crate::registry::CacheRegistry;
    pub use crate::registry::TargetedDataCache;
    pub use crate::traits::Entity;
    pub use crate::traits::EntityGetter;
    pub use crate::traits::ListGetter;
    pub use crate::traits::ViewParams;
    pub use crate::types::*;
    pub use crate::view::FetchHandle;
    pub use crate::view::GenericView;
}
