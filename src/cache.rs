use fieldx::fxstruct;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::observable::BehaviorSubject;
use crate::observable::Dispatcher;
use crate::observable::Subject;
use crate::poll::PollService;
use crate::query_cache::QueryCache;
use crate::registry::CacheRegistry;
use crate::registry::ManagedCache;
use crate::traits::Entity;
use crate::types::ItemMap;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Settings of an [`EntityCache`].
///
/// ```ignore
/// let config = CacheConfig::builder()
///     .unique_field("url")
///     .name("files")
///     .query_capacity(20)
///     .build()?;
/// let cache = EntityCache::<File>::with_config(config);
/// ```
#[derive(Debug, Clone)]
#[fxstruct(sync, no_new, default(off), builder)]
pub struct CacheConfig {
    /// Entity attribute holding the identity of a record.
    #[fieldx(get, builder(into), default(String::from("id")))]
    unique_field: String,

    /// Cache name. Most useful for debugging and logging.
    #[fieldx(get, builder(into), default(String::from("entities")))]
    name: String,

    /// How many distinct queries remember their key sets.
    #[fieldx(get(copy), default(100))]
    query_capacity: u64,

    /// How long a remembered query result may be served.
    #[fieldx(get(copy), default(Duration::from_secs(300)))]
    query_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            unique_field:   String::from("id"),
            name:           String::from("entities"),
            query_capacity: 100,
            query_ttl:      Duration::from_secs(300),
        }
    }
}

/// Keyed store of entity snapshots shared by any number of views.
///
/// Every mutation fully updates the store before a single notification goes out, so observers never see a torn state.
/// All streams of a cache share one [`Dispatcher`]: a mutation made from within an observer has its notifications
/// queued behind every notification of the mutation that triggered it.
///
/// Streams:
///
/// - [`items`](Self::items): the whole mapping, re-emitted on every effective change;
/// - [`updated`](Self::updated): key of every inserted or replaced snapshot;
/// - [`deleted`](Self::deleted): key of every removed snapshot;
/// - [`cleared`](Self::cleared): one event per [`clear`](Self::clear), regardless of how many records were dropped.
pub struct EntityCache<E>
where
    E: Entity,
{
    id:           u64,
    config:       CacheConfig,
    dispatcher:   Dispatcher,
    items:        BehaviorSubject<ItemMap<E>>,
    updated:      Subject<String>,
    deleted:      Subject<String>,
    cleared:      Subject<()>,
    query_cache:  QueryCache,
    poll_service: Arc<PollService>,
    registry:     Mutex<Option<Weak<CacheRegistry>>>,
}

impl<E> Debug for EntityCache<E>
where
    E: Entity,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("id", &self.id)
            .field("name", self.config.name())
            .field("len", &self.len())
            .finish()
    }
}

impl<E> Default for EntityCache<E>
where
    E: Entity,
{
    fn default() -> Self {
        Self::with_config(CacheConfig::default())
    }
}

impl CacheConfig {
    /// Copy of this configuration under another name.
    pub fn renamed<S: Into<String>>(&self, name: S) -> Self {
        let mut config = self.clone();
        config.name = name.into();
        config
    }
}

impl<E> EntityCache<E>
where
    E: Entity,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let query_cache = QueryCache::new(config.name(), config.query_capacity(), config.query_ttl());
        let dispatcher = Dispatcher::new();
        Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            config,
            items: BehaviorSubject::with_dispatcher(Arc::new(HashMap::new()), &dispatcher),
            updated: Subject::with_dispatcher(&dispatcher),
            deleted: Subject::with_dispatcher(&dispatcher),
            cleared: Subject::with_dispatcher(&dispatcher),
            dispatcher,
            query_cache,
            poll_service: PollService::new(),
            registry: Mutex::new(None),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.config.name()
    }

    #[inline]
    pub fn unique_field(&self) -> &str {
        self.config.unique_field()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn items(&self) -> &BehaviorSubject<ItemMap<E>> {
        &self.items
    }

    pub fn updated(&self) -> &Subject<String> {
        &self.updated
    }

    pub fn deleted(&self) -> &Subject<String> {
        &self.deleted
    }

    pub fn cleared(&self) -> &Subject<()> {
        &self.cleared
    }

    /// The dispatcher shared by all streams of this cache.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.query_cache
    }

    pub fn poll_service(&self) -> &Arc<PollService> {
        &self.poll_service
    }

    /// Identity of the entity as seen by this cache.
    pub fn key_of(&self, entity: &E) -> String {
        entity.field(self.unique_field()).unwrap_or_else(|| {
            warn!(
                "[{}] entity has no '{}' attribute: {entity:?}",
                self.name(),
                self.unique_field()
            );
            String::new()
        })
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<Arc<E>> {
        self.items.value().get(key).cloned()
    }

    #[inline]
    pub fn has(&self, key: &str) -> bool {
        self.items.value().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.items.value().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.value().is_empty()
    }

    /// Insert or replace a snapshot. Returns the key of the entity.
    ///
    /// Storing a snapshot equal to the current one is not a change and doesn't notify anybody.
    pub fn put(&self, entity: E) -> String {
        let key = self.key_of(&entity);
        self.dispatcher.batch(|| {
            let changed = self.items.update(|current| {
                if current.get(&key).is_some_and(|existing| **existing == entity) {
                    return None;
                }
                let mut next = (**current).clone();
                next.insert(key.clone(), Arc::new(entity));
                Some(Arc::new(next))
            });
            if changed {
                self.updated.next(key.clone());
            }
        });
        key
    }

    /// Same as [`put`](Self::put) but only the comma-separated attributes in `select` are taken from `entity` when a
    /// snapshot for its key already exists.
    pub fn put_with_select(&self, entity: E, select: &str) -> String {
        self.put(self.merge_selected(entity, select))
    }

    /// Bulk version of [`put_with_select`](Self::put_with_select). Every entity is merged against the snapshot stored
    /// before the call.
    pub fn put_many_with_select<I>(&self, entities: I, select: &str) -> Vec<String>
    where
        I: IntoIterator<Item = E>,
    {
        let merged = entities
            .into_iter()
            .map(|entity| self.merge_selected(entity, select))
            .collect::<Vec<_>>();
        self.put_many(merged)
    }

    fn merge_selected(&self, entity: E, select: &str) -> E {
        let key = self.key_of(&entity);
        let merged = self.get(&key).and_then(|existing| {
            let mut fields = existing.fields();
            let update = entity.fields();
            for attr in select.split(',').map(str::trim).filter(|a| !a.is_empty()) {
                fields.insert(attr.to_string(), update.get(attr).cloned().unwrap_or(Value::Null));
            }
            E::from_fields(fields)
        });
        merged.unwrap_or(entity)
    }

    /// Bulk version of [`put`](Self::put) with a single `items` notification. Returns keys in input order.
    #[instrument(level = "trace", skip(self, entities), fields(cache = self.name()))]
    pub fn put_many<I>(&self, entities: I) -> Vec<String>
    where
        I: IntoIterator<Item = E>,
    {
        let keyed = entities
            .into_iter()
            .map(|entity| (self.key_of(&entity), entity))
            .collect::<Vec<_>>();
        let keys = keyed.iter().map(|(key, _)| key.clone()).collect::<Vec<_>>();

        self.dispatcher.batch(|| {
            let mut changed_keys = Vec::new();
            self.items.update(|current| {
                let mut next = (**current).clone();
                for (key, entity) in keyed {
                    if !next.get(&key).is_some_and(|existing| **existing == entity) {
                        next.insert(key.clone(), Arc::new(entity));
                        changed_keys.push(key);
                    }
                }
                (!changed_keys.is_empty()).then(|| Arc::new(next))
            });
            for key in changed_keys {
                self.updated.next(key);
            }
        });
        keys
    }

    pub fn delete(&self, entity: &E) -> bool {
        self.delete_by_key(&self.key_of(entity))
    }

    /// Remove a snapshot. The key is dropped from all remembered queries too. Returns `false` and stays silent if
    /// the key is not in the cache.
    pub fn delete_by_key(&self, key: &str) -> bool {
        self.query_cache.delete_key(key);

        self.dispatcher.batch(|| {
            let removed = self.items.update(|current| {
                current.contains_key(key).then(|| {
                    let mut next = (**current).clone();
                    next.remove(key);
                    Arc::new(next)
                })
            });
            if removed {
                debug!("[{}] DELETE({key})", self.name());
                self.deleted.next(key.to_string());
            }
            removed
        })
    }

    /// Drop everything, remembered queries included. Emits one `cleared` event.
    pub fn clear(&self) {
        debug!("[{}] CLEAR", self.name());
        self.query_cache.clear();
        self.dispatcher.batch(|| {
            self.items.next(Arc::new(HashMap::new()));
            self.cleared.next(());
        });
    }

    /// Clear the cache and detach it from its registry.
    pub fn dispose(&self) {
        self.clear();
        let registry = self.registry.lock().take();
        if let Some(registry) = registry.and_then(|r| r.upgrade()) {
            registry.unregister(self.id);
        }
    }

    pub(crate) fn set_registry(&self, registry: Weak<CacheRegistry>) {
        *self.registry.lock() = Some(registry);
    }
}

impl<E> ManagedCache for EntityCache<E>
where
    E: Entity,
{
    fn cache_id(&self) -> u64 {
        self.id
    }

    fn cache_name(&self) -> &str {
        self.name()
    }

    fn clear(&self) {
        EntityCache::clear(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde::Serialize;

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    #[serde(default)]
    struct Node {
        id:    String,
        state: String,
        name:  String,
    }

    impl Entity for Node {}

    fn node(id: &str, state: &str) -> Node {
        Node {
            id:    id.into(),
            state: state.into(),
            name:  format!("node-{id}"),
        }
    }

    fn record<T: Clone + Send + Sync + 'static>(subject: &Subject<T>) -> (Arc<Mutex<Vec<T>>>, crate::Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = subject.subscribe(move |v: &T| sink.lock().push(v.clone()));
        (seen, sub)
    }

    #[test]
    fn put_replaces_and_notifies() {
        let cache = EntityCache::<Node>::new();
        let (updated, _sub) = record(cache.updated());

        assert_eq!(cache.put(node("1", "idle")), "1");
        cache.put(node("1", "running"));
        // Same content: not a change.
        cache.put(node("1", "running"));

        assert_eq!(cache.get("1").unwrap().state, "running");
        assert_eq!(cache.len(), 1);
        assert_eq!(*updated.lock(), vec!["1", "1"]);
    }

    #[test]
    fn delete_by_key_notifies_only_when_present() {
        let cache = EntityCache::<Node>::new();
        let (deleted, _sub) = record(cache.deleted());
        cache.put(node("1", "idle"));

        assert!(!cache.delete_by_key("2"));
        assert!(cache.delete_by_key("1"));
        assert!(!cache.delete_by_key("1"));

        assert_eq!(*deleted.lock(), vec!["1"]);
        assert!(cache.get("1").is_none());
    }

    #[test]
    fn clear_emits_single_event() {
        let cache = EntityCache::<Node>::new();
        cache.put_many([node("1", "a"), node("2", "b"), node("3", "c")]);
        cache.query_cache().set_keys("q", ["1".to_string()], None);
        let (cleared, _c) = record(cache.cleared());
        let (deleted, _d) = record(cache.deleted());

        cache.clear();

        assert_eq!(cleared.lock().len(), 1);
        assert!(deleted.lock().is_empty());
        assert!(cache.is_empty());
        assert!(cache.query_cache().get_keys("q").is_none());
    }

    #[test]
    fn put_many_emits_items_once() {
        let cache = EntityCache::<Node>::new();
        let emissions = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&emissions);
        let _sub = cache.items().subscribe_changes(move |_| *sink.lock() += 1);

        let keys = cache.put_many([node("2", "a"), node("1", "b")]);

        assert_eq!(keys, vec!["2", "1"]);
        assert_eq!(*emissions.lock(), 1);
    }

    #[test]
    fn observers_see_complete_state() {
        let cache = EntityCache::<Node>::new();
        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        let weak = Arc::downgrade(&cache);
        let _sub = cache.deleted().subscribe(move |key: &String| {
            let cache = weak.upgrade().unwrap();
            *sink.lock() = Some((cache.has(key), cache.len()));
        });
        cache.put_many([node("1", "a"), node("2", "b")]);
        cache.delete_by_key("1");

        assert_eq!(*observed.lock(), Some((false, 1)));
    }

    #[test]
    fn reentrant_put_is_deferred() {
        let cache = EntityCache::<Node>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&cache);
        let log = Arc::clone(&order);
        let _first = cache.updated().subscribe(move |key: &String| {
            log.lock().push(format!("a:{key}"));
            if key == "1" {
                weak.upgrade().unwrap().put(node("2", "spawned"));
            }
        });
        let log = Arc::clone(&order);
        let _second = cache.updated().subscribe(move |key: &String| log.lock().push(format!("b:{key}")));

        cache.put(node("1", "x"));

        assert_eq!(*order.lock(), vec!["a:1", "b:1", "a:2", "b:2"]);
        assert!(cache.has("2"));
    }

    #[test]
    fn select_merges_listed_attributes() {
        let cache = EntityCache::<Node>::new();
        cache.put(node("1", "idle"));

        let update = Node {
            id:    "1".into(),
            state: "running".into(),
            name:  "renamed".into(),
        };
        cache.put_with_select(update, "id, state");

        let stored = cache.get("1").unwrap();
        assert_eq!(stored.state, "running");
        assert_eq!(stored.name, "node-1");
    }

    #[test]
    fn nested_put_waits_for_outer_notifications() {
        let cache = EntityCache::<Node>::new();
        let (updated, _updated) = record(cache.updated());

        let weak = Arc::downgrade(&cache);
        let _items = cache.items().subscribe_changes(move |items: &ItemMap<Node>| {
            if items.contains_key("1") && !items.contains_key("2") {
                if let Some(cache) = weak.upgrade() {
                    cache.put(node("2", "spawned"));
                }
            }
        });

        cache.put(node("1", "x"));

        assert_eq!(*updated.lock(), vec!["1", "2"]);
        assert!(cache.has("2"));
    }

    #[test]
    fn nested_delete_waits_for_outer_notifications() {
        let cache = EntityCache::<Node>::new();
        cache.put_many([node("1", "a"), node("2", "b")]);
        let order = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&cache);
        let log = Arc::clone(&order);
        let _deleted = cache.deleted().subscribe(move |key: &String| {
            log.lock().push(format!("deleted:{key}"));
            if let Some(cache) = weak.upgrade() {
                cache.delete_by_key("2");
            }
        });
        let log = Arc::clone(&order);
        let _items = cache
            .items()
            .subscribe_changes(move |items: &ItemMap<Node>| log.lock().push(format!("items:{}", items.len())));

        cache.delete_by_key("1");

        assert_eq!(*order.lock(), vec!["items:1", "deleted:1", "items:0", "deleted:2"]);
    }

    #[test]
    fn select_merges_every_listed_entity() {
        let cache = EntityCache::<Node>::new();
        cache.put_many([node("1", "idle"), node("2", "idle")]);
        let (updated, _sub) = record(cache.updated());

        let renamed = |id: &str| Node {
            id:    id.into(),
            state: "running".into(),
            name:  "renamed".into(),
        };
        let keys = cache.put_many_with_select([renamed("2"), renamed("3")], "state");

        assert_eq!(keys, vec!["2", "3"]);
        assert_eq!(*updated.lock(), vec!["2", "3"]);
        let merged = cache.get("2").unwrap();
        assert_eq!((merged.state.as_str(), merged.name.as_str()), ("running", "node-2"));
        // Unknown keys are stored as given.
        assert_eq!(cache.get("3").unwrap().name, "renamed");
        assert_eq!(cache.get("1").unwrap().state, "idle");
    }

    #[test]
    fn delete_evicts_from_queries() {
        let cache = EntityCache::<Node>::new();
        cache.put_many([node("1", "a"), node("2", "b")]);
        cache.query_cache().set_keys("q", ["1", "2"].map(String::from), None);

        cache.delete_by_key("1");

        let keys = cache.query_cache().get_keys("q").unwrap();
        assert_eq!(keys.keys().iter().collect::<Vec<_>>(), vec!["2"]);
    }

    #[test]
    fn config_builder_defaults() {
        let config = CacheConfig::builder().unique_field("url").build().expect("config");
        assert_eq!(config.unique_field(), "url");
        assert_eq!(config.name(), "entities");
        assert_eq!(config.query_capacity(), 100);
    }
}
