use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Weak;
use tracing::debug;

use crate::cache::CacheConfig;
use crate::cache::EntityCache;
use crate::traits::Entity;
use crate::types::CacheAccessor;

/// Type-erased face of an [`EntityCache`] as seen by a [`CacheRegistry`].
pub trait ManagedCache: Send + Sync + 'static {
    fn cache_id(&self) -> u64;
    fn cache_name(&self) -> &str;
    fn clear(&self);
}

/// Tracks every cache of one logical scope (e.g. one account) so they can be invalidated together.
///
/// The registry holds weak references only; a cache nobody uses anymore silently drops out.
#[derive(Default)]
pub struct CacheRegistry {
    caches: Mutex<HashMap<u64, Weak<dyn ManagedCache>>>,
}

impl Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry").field("caches", &self.len()).finish()
    }
}

impl CacheRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a cache and register it.
    pub fn create_cache<E: Entity>(self: &Arc<Self>, config: CacheConfig) -> Arc<EntityCache<E>> {
        let cache = Arc::new(EntityCache::with_config(config));
        self.register(&cache);
        cache
    }

    pub fn register<E: Entity>(self: &Arc<Self>, cache: &Arc<EntityCache<E>>) {
        cache.set_registry(Arc::downgrade(self));
        let managed: Arc<dyn ManagedCache> = cache.clone();
        self.caches.lock().insert(cache.id(), Arc::downgrade(&managed));
    }

    pub fn unregister(&self, id: u64) -> bool {
        self.caches.lock().remove(&id).is_some()
    }

    /// Number of live registered caches.
    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear every registered cache but those listed.
    pub fn clear_all(&self, except: &[u64]) {
        for cache in self.live() {
            if !except.contains(&cache.cache_id()) {
                debug!("Clearing cache '{}' (#{})", cache.cache_name(), cache.cache_id());
                cache.clear();
            }
        }
    }

    /// Clear every registered cache and forget about them.
    pub fn dispose_all(&self) {
        let caches = self.live();
        self.caches.lock().clear();
        for cache in caches {
            cache.clear();
        }
    }

    // Also prunes dead entries. Caches are collected before any of them is touched so no lock is held while they
    // notify their observers.
    fn live(&self) -> Vec<Arc<dyn ManagedCache>> {
        let mut caches = self.caches.lock();
        caches.retain(|_, weak| weak.strong_count() > 0);
        caches.values().filter_map(Weak::upgrade).collect()
    }
}

/// A family of caches partitioned by a derived key, e.g. one file cache per pool.
pub struct TargetedDataCache<E>
where
    E: Entity,
{
    config:   CacheConfig,
    registry: Option<Arc<CacheRegistry>>,
    caches:   Mutex<HashMap<String, Arc<EntityCache<E>>>>,
}

impl<E> Debug for TargetedDataCache<E>
where
    E: Entity,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetedDataCache")
            .field("name", self.config.name())
            .field("targets", &self.caches.lock().len())
            .finish()
    }
}

impl<E> TargetedDataCache<E>
where
    E: Entity,
{
    pub fn new(config: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: None,
            caches: Mutex::new(HashMap::new()),
        })
    }

    /// Caches created by this family are registered with `registry`.
    pub fn with_registry(config: CacheConfig, registry: &Arc<CacheRegistry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Some(Arc::clone(registry)),
            caches: Mutex::new(HashMap::new()),
        })
    }

    /// The cache for the target, created on first use.
    pub fn get_cache(&self, target: &str) -> Arc<EntityCache<E>> {
        let mut caches = self.caches.lock();
        if let Some(cache) = caches.get(target) {
            return Arc::clone(cache);
        }

        let config = self.config.renamed(format!("{}[{target}]", self.config.name()));
        let cache = Arc::new(EntityCache::with_config(config));
        if let Some(registry) = &self.registry {
            registry.register(&cache);
        }
        caches.insert(target.to_string(), Arc::clone(&cache));
        cache
    }

    pub fn targets(&self) -> Vec<String> {
        self.caches.lock().keys().cloned().collect()
    }

    /// Produce a cache accessor that picks the target out of view params.
    pub fn accessor<P, F>(self: &Arc<Self>, target_of: F) -> CacheAccessor<E, P>
    where
        P: 'static,
        F: Fn(&P) -> String + Send + Sync + 'static,
    {
        let family = Arc::clone(self);
        Arc::new(move |params: &P| family.get_cache(&target_of(params)))
    }

    /// Dispose every cache of the family.
    pub fn dispose(&self) {
        let caches = std::mem::take(&mut *self.caches.lock());
        for cache in caches.into_values() {
            cache.dispose();
        }
    }
}

/// Accessor which always resolves to the same cache.
pub fn fixed_cache<E, P>(cache: &Arc<EntityCache<E>>) -> CacheAccessor<E, P>
where
    E: Entity,
    P: 'static,
{
    let cache = Arc::clone(cache);
    Arc::new(move |_: &P| Arc::clone(&cache))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde::Serialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct File {
        url: String,
    }

    impl Entity for File {}

    fn file(url: &str) -> File {
        File { url: url.into() }
    }

    fn file_config() -> CacheConfig {
        CacheConfig::builder()
            .unique_field("url")
            .name("files")
            .build()
            .expect("cache config")
    }

    #[test]
    fn clear_all_honors_exceptions() {
        let registry = CacheRegistry::new();
        let first = registry.create_cache::<File>(file_config());
        let second = registry.create_cache::<File>(file_config());
        first.put(file("a"));
        second.put(file("b"));

        registry.clear_all(&[second.id()]);

        assert!(first.is_empty());
        assert!(second.has("b"));
    }

    #[test]
    fn dropped_and_disposed_caches_leave() {
        let registry = CacheRegistry::new();
        let first = registry.create_cache::<File>(file_config());
        let second = registry.create_cache::<File>(file_config());
        assert_eq!(registry.len(), 2);

        drop(first);
        assert_eq!(registry.len(), 1);

        second.dispose();
        assert!(registry.is_empty());
    }

    #[test]
    fn dispose_all_clears_everything() {
        let registry = CacheRegistry::new();
        let cache = registry.create_cache::<File>(file_config());
        cache.put(file("a"));

        registry.dispose_all();

        assert!(cache.is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn targeted_caches_are_partitioned() {
        let registry = CacheRegistry::new();
        let files = TargetedDataCache::<File>::with_registry(file_config(), &registry);
        let accessor = files.accessor(|pool: &String| pool.clone());

        let pool_a = accessor(&"a".to_string());
        let pool_b = accessor(&"b".to_string());
        pool_a.put(file("x"));

        assert!(Arc::ptr_eq(&pool_a, &accessor(&"a".to_string())));
        assert!(!pool_b.has("x"));
        assert_eq!(pool_a.name(), "files[a]");
        assert_eq!(registry.len(), 2);

        files.dispose();
        assert!(pool_a.is_empty());
        assert!(files.targets().is_empty());
    }
}
