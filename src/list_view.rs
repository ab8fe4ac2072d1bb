use fieldx::fxstruct;
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::instrument;
use tracing::warn;

use crate::error::FetchError;
use crate::error::Result;
use crate::error::ViewError;
use crate::observable::BehaviorSubject;
use crate::observable::Subscription;
use crate::options::ListOptions;
use crate::query_cache::merge_keys;
use crate::traits::Entity;
use crate::traits::ListGetter;
use crate::traits::ViewParams;
use crate::types::CacheAccessor;
use crate::types::ContinuationToken;
use crate::types::ListResponse;
use crate::view::params_fields;
use crate::view::FetchHandle;
use crate::view::GenericView;
use crate::view::ViewCore;

type PageRequest<E> = Pin<Box<dyn Future<Output = std::result::Result<ListResponse<E>, FetchError>> + Send>>;

#[derive(Debug, Default)]
struct ListState {
    // Keys confirmed by the server, in response order.
    item_keys:      IndexSet<String>,
    // Keys shown ahead of the confirmed ones.
    prepend:        IndexSet<String>,
    next_link:      Option<ContinuationToken>,
    options:        ListOptions,
    poll_fetch_all: bool,
}

/// A paginated view of a remote collection.
///
/// The view only keeps keys; the entities themselves live in the cache. [`items`](Self::items) is recomputed
/// whenever the keys or the cache content change:
///
/// 1. fixed keys not confirmed by the server come first, then the confirmed keys in response order;
/// 2. the list is cut at `maxItems`, if set;
/// 3. every key is resolved against the cache. A fixed key absent from the cache is rendered as a placeholder built
///    out of the view params;
/// 4. fixed keys not confirmed by the server are checked against the active filter, the confirmed ones are trusted.
///
/// Equal consecutive lists are not re-emitted.
///
/// ```ignore
/// let view = ListView::<Job, JobParams>::builder()
///     .cache(fixed_cache(&cache))
///     .getter(Arc::new(JobListGetter::new(client)))
///     .initial_options(ListOptions::new().with_max_items(50))
///     .build()?;
/// ```
#[fxstruct(sync, rc, no_new, default(off), builder(post_build, opt_in))]
pub struct ListView<E, P>
where
    E: Entity,
    P: ViewParams,
{
    #[fieldx(builder(vis(pub(crate)), required))]
    core:            Arc<ViewCore<E, P>>,
    #[fieldx(builder(vis(pub), required))]
    getter:          Arc<dyn ListGetter<E, P>>,
    /// Options the view starts with.
    #[fieldx(get(clone), builder(vis(pub)), default(ListOptions::default()))]
    initial_options: ListOptions,
    #[fieldx(default(BehaviorSubject::new(Arc::new(Vec::new()))))]
    items:           BehaviorSubject<Arc<Vec<Arc<E>>>>,
    #[fieldx(default(BehaviorSubject::new(true)))]
    has_more:        BehaviorSubject<bool>,
    #[fieldx(default(Mutex::new(ListState::default())))]
    state:           Mutex<ListState>,
    #[fieldx(default(Mutex::new(Vec::new())))]
    subs:            Mutex<Vec<Subscription>>,
}

impl<E, P> ListViewBuilder<E, P>
where
    E: Entity,
    P: ViewParams,
{
    /// Resolves the cache for the given params.
    pub fn cache(self, accessor: CacheAccessor<E, P>) -> Self {
        self.core(ViewCore::new(accessor))
    }
}

impl<E, P> Debug for ListView<E, P>
where
    E: Entity,
    P: ViewParams,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListView")
            .field("core", &self.core)
            .field("state", &*self.state.lock())
            .field("has_more", &self.has_more.value())
            .finish()
    }
}

impl<E, P> ListView<E, P>
where
    E: Entity,
    P: ViewParams,
{
    fn post_build(mut self) -> Self {
        let options = self.initial_options();
        self.core.set_options_key(options.signature());
        self.state.get_mut().options = options;

        let view = self.myself_downgrade();
        let deleted_sub = self.core.deleted().subscribe(move |key: &String| {
            if let Some(view) = view.upgrade() {
                view.on_deleted(key);
            }
        });
        let view = self.myself_downgrade();
        let cleared_sub = self.core.cache_cleared().subscribe(move |_: &()| {
            if let Some(view) = view.upgrade() {
                view.on_cache_cleared();
            }
        });
        let view = self.myself_downgrade();
        let items_sub = self.core.cache_items().subscribe(move |_| {
            if let Some(view) = view.upgrade() {
                view.recompute();
            }
        });

        self.subs.get_mut().extend([deleted_sub, cleared_sub, items_sub]);
        self
    }

    /// The visible list.
    pub fn items(&self) -> &BehaviorSubject<Arc<Vec<Arc<E>>>> {
        &self.items
    }

    /// `false` once the last page is loaded or a page failed to load.
    pub fn has_more(&self) -> &BehaviorSubject<bool> {
        &self.has_more
    }

    pub fn options(&self) -> ListOptions {
        self.state.lock().options.clone()
    }

    /// Confirmed keys, in response order.
    pub fn item_keys(&self) -> Vec<String> {
        self.state.lock().item_keys.iter().cloned().collect()
    }

    pub fn next_link(&self) -> Option<ContinuationToken> {
        self.state.lock().next_link.clone()
    }

    /// Load the next page. Without a continuation token the first page is requested; unless `force_new` is set,
    /// the last known result of the query is shown meanwhile.
    ///
    /// Once there are no more pages this is a no-op.
    pub fn fetch_next(&self, force_new: bool) -> FetchHandle {
        if self.core.is_disposed() {
            return FetchHandle::resolved(Err(ViewError::Disposed));
        }
        if !self.has_more.value() {
            return FetchHandle::resolved(Ok(()));
        }

        let params = self.core.params();
        let (options, token) = {
            let state = self.state.lock();
            (state.options.clone(), state.next_link.clone())
        };
        let getter = Arc::clone(&self.getter);
        let loaded = self.myself_downgrade();
        let first_page = token.is_none();

        let request: PageRequest<E> = match token {
            None => {
                if !force_new {
                    self.load_from_cache(&params, &options);
                }
                Box::pin(async move { getter.fetch(&params, &options, force_new).await })
            }
            Some(token) => Box::pin(async move { getter.fetch_next(&params, &options, &token).await }),
        };

        self.core.fetch_data(
            request,
            move |response: ListResponse<E>| {
                if let Some(view) = loaded.upgrade() {
                    view.on_page(response, first_page);
                }
            },
            self.failure_handler(),
        )
    }

    /// Load every page in one go. The result replaces whatever the view had.
    pub fn fetch_all(&self) -> FetchHandle {
        if self.core.is_disposed() {
            return FetchHandle::resolved(Err(ViewError::Disposed));
        }

        let params = self.core.params();
        let options = self.options();
        let getter = Arc::clone(&self.getter);
        let loaded = self.myself_downgrade();

        self.core.fetch_data(
            async move { getter.fetch_all(&params, &options).await },
            move |items: Vec<E>| {
                if let Some(view) = loaded.upgrade() {
                    view.on_all(items);
                }
            },
            self.failure_handler(),
        )
    }

    /// Forget the last known result of the query and load the first page again. With `clear_existing` unset the
    /// current items stay visible until the response arrives.
    pub fn refresh(&self, clear_existing: bool) -> FetchHandle {
        self.reset_query(clear_existing);
        self.fetch_next(true)
    }

    /// Same as [`refresh`](Self::refresh) but every page is loaded.
    pub fn refresh_all(&self, clear_existing: bool) -> FetchHandle {
        self.reset_query(clear_existing);
        self.fetch_all()
    }

    /// Replace the options. The outstanding request is aborted and pagination starts over.
    pub fn set_options(&self, options: ListOptions, clear_items: bool) {
        if self.core.is_disposed() {
            return;
        }

        self.core.set_options_key(options.signature());
        self.core.abort_fetch();
        {
            let mut state = self.state.lock();
            state.options = options;
            state.next_link = None;
            if clear_items {
                state.item_keys.clear();
            }
        }
        self.recompute();
        self.has_more.next_if_changed(true);
    }

    /// Override some of the options, keep the rest.
    pub fn patch_options(&self, options: &ListOptions, clear_items: bool) {
        let merged = self.options().merge(options);
        self.set_options(merged, clear_items);
    }

    /// Keys to always show ahead of the fetched ones, e.g. items just created locally and not indexed by the server
    /// yet.
    pub fn set_fixed_keys<I>(&self, keys: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.state.lock().prepend = keys.into_iter().map(Into::into).collect();
        self.recompute();
    }

    /// Show an item obtained elsewhere, typically one just created, without reloading the list. The item is put
    /// into the cache and, unless the list has it already, its key goes to the top of the list and is recorded in
    /// the query's last known result.
    ///
    /// The returned task resolves to the key of the item. Fails right away with [`ViewError::Disposed`] on a disposed
    /// view and with [`ViewError::Aborted`] when called outside of a tokio runtime.
    pub fn load_new_item<Fut>(&self, item: Fut) -> Result<JoinHandle<Result<String>>>
    where
        Fut: Future<Output = std::result::Result<E, FetchError>> + Send + 'static,
    {
        if self.core.is_disposed() {
            return Err(ViewError::Disposed);
        }
        let Ok(runtime) = Handle::try_current()
        else {
            warn!("No async runtime to load a new item for {} on", self.core.signature());
            return Err(ViewError::Aborted);
        };

        let view = self.myself_downgrade();
        Ok(runtime.spawn(async move {
            let entity = item.await.inspect_err(|err| error!("Error loading new item into list view: {err}"))?;
            let view = view.upgrade().ok_or(ViewError::Disposed)?;
            if view.core.is_disposed() {
                return Err(ViewError::Disposed);
            }
            Ok::<_, ViewError>(view.add_item(entity))
        }))
    }

    /// Refresh the list every `interval`, loading either the first page or every page. Returns `false` if the view
    /// is polling already or there is no tokio runtime to run the poll on.
    pub fn start_poll(&self, interval: Duration, fetch_all: bool) -> bool {
        let view = self.myself_downgrade();
        let started = self.core.start_poll(interval, move || {
            if let Some(view) = view.upgrade() {
                let _ = view.poll_refresh();
            }
        });
        // The first tick is one interval away.
        if started {
            self.state.lock().poll_fetch_all = fetch_all;
        }
        started
    }

    fn failure_handler(&self) -> impl FnOnce(&FetchError) + Send + 'static {
        let view = self.myself_downgrade();
        move |err: &FetchError| {
            if let Some(view) = view.upgrade() {
                view.on_failed(err);
            }
        }
    }

    fn add_item(&self, entity: E) -> String {
        let cache = self.core.cache();
        let key = cache.put(entity);
        let added = {
            let mut state = self.state.lock();
            if state.item_keys.contains(&key) {
                false
            }
            else {
                state.item_keys.shift_insert(0, key.clone());
                true
            }
        };

        if added {
            debug!("[{}] new item '{key}' added on top", cache.name());
            cache.query_cache().add_key(&self.core.signature(), &key);
            self.recompute();
        }
        key
    }

    fn reset_query(&self, clear_existing: bool) {
        self.core.cache().query_cache().remove(&self.core.signature());
        self.set_options(self.options(), clear_existing);
    }

    fn load_from_cache(&self, params: &P, options: &ListOptions) {
        let cache = self.core.cache();
        let keys = match cache.query_cache().get_keys(&self.core.signature()) {
            Some(list) => Some(list.merged()),
            None => self
                .getter
                .fetch_from_cache(params, options)
                .map(|response| cache.put_many(response.items).into_iter().collect()),
        };

        if let Some(keys) = keys {
            debug!("[{}] serving {} keys from query cache", cache.name(), keys.len());
            self.state.lock().item_keys = keys;
            self.recompute();
        }
    }

    #[instrument(level = "trace", skip(self, response), fields(items = response.items.len()))]
    fn on_page(&self, response: ListResponse<E>, first_page: bool) {
        let cache = self.core.cache();
        let signature = self.core.signature();
        let ListResponse { items, next_link } = response;
        let keys = cache.put_many(items);

        {
            let mut state = self.state.lock();
            if first_page {
                state.item_keys = keys.iter().cloned().collect();
            }
            else {
                state.item_keys.extend(keys.iter().cloned());
            }
            state.next_link = next_link.clone();
        }

        let has_more = next_link.is_some();
        if first_page {
            cache.query_cache().set_keys(&signature, keys, next_link);
        }
        else {
            cache.query_cache().append_keys(&signature, keys, next_link);
        }

        self.recompute();
        self.has_more.next_if_changed(has_more);
    }

    fn on_all(&self, items: Vec<E>) {
        let cache = self.core.cache();
        let keys = cache.put_many(items);

        {
            let mut state = self.state.lock();
            state.item_keys = keys.iter().cloned().collect();
            state.next_link = None;
        }
        cache.query_cache().set_keys(&self.core.signature(), keys, None);

        self.recompute();
        self.has_more.next_if_changed(false);
    }

    fn on_failed(&self, err: &FetchError) {
        error!("Error loading list view page for {}: {err}", self.core.signature());
        self.state.lock().next_link = None;
        self.has_more.next_if_changed(false);
    }

    fn on_deleted(&self, key: &str) {
        let removed = self.state.lock().item_keys.shift_remove(key);
        if removed {
            self.recompute();
        }
    }

    fn on_cache_cleared(&self) {
        debug!("Cache cleared, reloading {}", self.core.signature());
        self.core.abort_fetch();
        {
            let mut state = self.state.lock();
            state.item_keys.clear();
            state.next_link = None;
        }
        self.recompute();
        self.has_more.next_if_changed(true);
        let _ = self.fetch_next(false);
    }

    fn placeholder(params: &P, unique_field: &str, key: &str) -> Option<Arc<E>> {
        let mut fields = params_fields(params);
        fields.insert(unique_field.to_string(), Value::String(key.to_string()));
        E::from_fields(fields).map(Arc::new)
    }

    fn recompute(&self) {
        if self.core.is_disposed() {
            return;
        }

        let (keys, prepend, options) = {
            let state = self.state.lock();
            (state.item_keys.clone(), state.prepend.clone(), state.options.clone())
        };
        let params = self.core.params();
        let cache = self.core.cache();
        let snapshot = cache.items().value();

        let merged = merge_keys(&prepend, &keys);
        let limit = options.max_items().unwrap_or(usize::MAX);

        let items = merged
            .iter()
            .take(limit)
            .filter_map(|key| {
                let unconfirmed = !keys.contains(key);
                let item = snapshot
                    .get(key)
                    .cloned()
                    .or_else(|| unconfirmed.then(|| Self::placeholder(&params, cache.unique_field(), key)).flatten())?;
                match options.filter() {
                    Some(filter) if unconfirmed && !filter.matches(&*item) => None,
                    _ => Some(item),
                }
            })
            .collect::<Vec<_>>();

        self.items.next_if_changed(Arc::new(items));
    }
}

impl<E, P> GenericView<E, P> for ListView<E, P>
where
    E: Entity,
    P: ViewParams,
{
    fn core(&self) -> &Arc<ViewCore<E, P>> {
        &self.core
    }

    fn set_params(&self, params: P) {
        self.core.set_params(params);
        {
            let mut state = self.state.lock();
            state.item_keys.clear();
            state.next_link = None;
        }
        self.recompute();
        self.has_more.next_if_changed(true);
    }

    fn poll_refresh(&self) -> FetchHandle {
        if self.state.lock().poll_fetch_all {
            self.refresh_all(false)
        }
        else {
            self.refresh(false)
        }
    }

    fn dispose(&self) {
        self.core.dispose();
        let subs = std::mem::take(&mut *self.subs.lock());
        drop(subs);
        self.items.complete();
        self.has_more.complete();
    }
}
