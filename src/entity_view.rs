use fieldx::fxstruct;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::EntityCache;
use crate::error::FetchError;
use crate::error::ViewError;
use crate::observable::BehaviorSubject;
use crate::observable::Subscription;
use crate::traits::Entity;
use crate::traits::EntityGetter;
use crate::traits::ViewParams;
use crate::types::CacheAccessor;
use crate::types::ItemMap;
use crate::view::params_field;
use crate::view::FetchHandle;
use crate::view::GenericView;
use crate::view::ViewCore;

#[derive(Debug, Default)]
struct ItemKeys {
    // The key the view currently shows.
    current: Option<String>,
    // The key of the last successful network load.
    loaded:  Option<String>,
}

/// A view of a single entity.
///
/// The entity is looked up in the cache first and then refreshed from the network. Once loaded, the view keeps
/// following the cache: any `put` of the same key is reflected in [`item`](Self::item) without a request.
///
/// A "not found" response is interpreted depending on history. If the entity was never loaded for the current params
/// the view simply has no data. If it was, the entity is considered deleted and is removed from the cache, which
/// notifies every view sharing it.
///
/// ```ignore
/// let view = EntityView::<Job, JobParams>::builder()
///     .cache(fixed_cache(&cache))
///     .getter(Arc::new(JobGetter::new(client)))
///     .build()?;
/// ```
#[fxstruct(sync, rc, no_new, default(off), builder(post_build, opt_in))]
pub struct EntityView<E, P>
where
    E: Entity,
    P: ViewParams,
{
    #[fieldx(builder(vis(pub(crate)), required))]
    core:   Arc<ViewCore<E, P>>,
    #[fieldx(builder(vis(pub), required))]
    getter: Arc<dyn EntityGetter<E, P>>,
    #[fieldx(default(BehaviorSubject::new(None)))]
    item:   BehaviorSubject<Option<Arc<E>>>,
    #[fieldx(default(Mutex::new(ItemKeys::default())))]
    keys:   Mutex<ItemKeys>,
    #[fieldx(default(Mutex::new(Vec::new())))]
    subs:   Mutex<Vec<Subscription>>,
}

impl<E, P> EntityViewBuilder<E, P>
where
    E: Entity,
    P: ViewParams,
{
    /// Resolves the cache for the given params.
    pub fn cache(self, accessor: CacheAccessor<E, P>) -> Self {
        self.core(ViewCore::new(accessor))
    }
}

impl<E, P> Debug for EntityView<E, P>
where
    E: Entity,
    P: ViewParams,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityView")
            .field("core", &self.core)
            .field("keys", &*self.keys.lock())
            .finish()
    }
}

impl<E, P> EntityView<E, P>
where
    E: Entity,
    P: ViewParams,
{
    fn post_build(mut self) -> Self {
        let view = self.myself_downgrade();
        let items_sub = self.core.cache_items().subscribe(move |items: &ItemMap<E>| {
            if let Some(view) = view.upgrade() {
                view.on_cache_items(items);
            }
        });
        self.subs.get_mut().push(items_sub);
        self
    }

    /// The entity, or `None` while there is nothing to show.
    pub fn item(&self) -> &BehaviorSubject<Option<Arc<E>>> {
        &self.item
    }

    /// Key of the entity the view shows.
    pub fn item_key(&self) -> Option<String> {
        self.keys.lock().current.clone()
    }

    /// Show the cached entity right away, if there is one, and refresh it from the network.
    pub fn fetch(&self) -> FetchHandle {
        if self.core.is_disposed() {
            return FetchHandle::resolved(Err(ViewError::Disposed));
        }

        let params = self.core.params();
        self.load_from_cache(&params, &self.core.cache());

        let getter = Arc::clone(&self.getter);
        let loaded = self.myself_downgrade();
        let failed = self.myself_downgrade();
        self.core.fetch_data(
            async move { getter.fetch(&params).await },
            move |entity: E| {
                if let Some(view) = loaded.upgrade() {
                    view.on_loaded(entity);
                }
            },
            move |err: &FetchError| {
                if let Some(view) = failed.upgrade() {
                    view.on_failed(err);
                }
            },
        )
    }

    #[inline]
    pub fn refresh(&self) -> FetchHandle {
        self.fetch()
    }

    /// Refresh the entity every `interval`. Returns `false` if the view is polling already or there is no tokio runtime
    /// to run the poll on.
    pub fn start_poll(&self, interval: Duration) -> bool {
        let view = self.myself_downgrade();
        self.core.start_poll(interval, move || {
            if let Some(view) = view.upgrade() {
                let _ = view.refresh();
            }
        })
    }

    fn load_from_cache(&self, params: &P, cache: &EntityCache<E>) {
        let key = match self.getter.fetch_from_cache(params) {
            Some(entity) => Some(cache.put(entity)),
            None => params_field(params, cache.unique_field()).filter(|key| cache.has(key)),
        };

        if let Some(key) = key {
            debug!("[{}] serving '{key}' from cache", cache.name());
            self.show(key, cache);
        }
    }

    fn show(&self, key: String, cache: &EntityCache<E>) {
        let item = cache.get(&key);
        self.keys.lock().current = Some(key);
        self.item.next_if_changed(item);
    }

    fn on_loaded(&self, entity: E) {
        let cache = self.core.cache();
        // The response is authoritative about the key, the params may carry it in a different form.
        let key = cache.put(entity);
        self.keys.lock().loaded = Some(key.clone());
        self.show(key, &cache);
    }

    fn on_failed(&self, err: &FetchError) {
        if !err.is_not_found() {
            return;
        }

        let cache = self.core.cache();
        let deleted = {
            let mut keys = self.keys.lock();
            let key = keys
                .current
                .clone()
                .or_else(|| params_field(&self.core.params(), cache.unique_field()));
            match (key, keys.loaded.take()) {
                (Some(key), Some(loaded)) if key == loaded => Some(key),
                (_, loaded) => {
                    keys.loaded = loaded;
                    None
                }
            }
        };

        match deleted {
            Some(key) => {
                debug!("[{}] '{key}' is gone", cache.name());
                cache.delete_by_key(&key);
                self.item.next_if_changed(None);
            }
            None => debug!("[{}] nothing found for {}", cache.name(), self.core.signature()),
        }
    }

    fn on_cache_items(&self, items: &ItemMap<E>) {
        let key = self.keys.lock().current.clone();
        if let Some(key) = key {
            self.item.next_if_changed(items.get(&key).cloned());
        }
    }
}

impl<E, P> GenericView<E, P> for EntityView<E, P>
where
    E: Entity,
    P: ViewParams,
{
    fn core(&self) -> &Arc<ViewCore<E, P>> {
        &self.core
    }

    fn set_params(&self, params: P) {
        self.core.set_params(params);
        *self.keys.lock() = ItemKeys::default();
        self.item.next_if_changed(None);
    }

    fn poll_refresh(&self) -> FetchHandle {
        self.refresh()
    }

    fn dispose(&self) {
        self.core.dispose();
        let subs = std::mem::take(&mut *self.subs.lock());
        drop(subs);
        self.item.complete();
    }
}
