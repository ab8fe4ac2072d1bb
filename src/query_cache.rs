use indexmap::IndexSet;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use crate::types::ContinuationToken;

/// The last known result of one query.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedKeyList {
    keys:       IndexSet<String>,
    prepended:  IndexSet<String>,
    next_link:  Option<ContinuationToken>,
    created_at: Instant,
}

impl CachedKeyList {
    fn new(keys: IndexSet<String>, next_link: Option<ContinuationToken>) -> Self {
        Self {
            keys,
            prepended: IndexSet::new(),
            next_link,
            created_at: Instant::now(),
        }
    }

    /// Keys confirmed by the server, in response order.
    pub fn keys(&self) -> &IndexSet<String> {
        &self.keys
    }

    /// Keys added locally, not yet confirmed by the server.
    pub fn prepended(&self) -> &IndexSet<String> {
        &self.prepended
    }

    pub fn next_link(&self) -> Option<&ContinuationToken> {
        self.next_link.as_ref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Prepended keys which are not confirmed yet, in prepend order, followed by the confirmed keys.
    pub fn merged(&self) -> IndexSet<String> {
        merge_keys(&self.prepended, &self.keys)
    }
}

/// Merge an optimistic key set ahead of a confirmed one. A key present in both keeps its confirmed position.
pub fn merge_keys(prepended: &IndexSet<String>, confirmed: &IndexSet<String>) -> IndexSet<String> {
    prepended
        .iter()
        .filter(|k| !confirmed.contains(*k))
        .chain(confirmed.iter())
        .cloned()
        .collect()
}

/// Per-query key sets of one [`EntityCache`](crate::cache::EntityCache).
///
/// Queries are identified by their signature, a string derived from view params and list options. The number of
/// remembered queries is bounded and each entry expires after a while; views fall back to the network then.
pub struct QueryCache {
    queries: Cache<String, Arc<CachedKeyList>>,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("queries", &self.queries.entry_count())
            .finish()
    }
}

impl QueryCache {
    pub fn new(name: &str, capacity: u64, ttl: Duration) -> Self {
        Self {
            queries: Cache::builder()
                .name(name)
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get_keys(&self, signature: &str) -> Option<Arc<CachedKeyList>> {
        self.queries.get(signature)
    }

    /// Replace the key set of a query.
    pub fn set_keys<I>(&self, signature: &str, keys: I, next_link: Option<ContinuationToken>)
    where
        I: IntoIterator<Item = String>,
    {
        self.queries.insert(
            signature.to_string(),
            Arc::new(CachedKeyList::new(keys.into_iter().collect(), next_link)),
        );
    }

    /// Extend a query's key set, keeping first-seen order. Creates the query if it is not known yet.
    pub fn append_keys<I>(&self, signature: &str, keys: I, next_link: Option<ContinuationToken>)
    where
        I: IntoIterator<Item = String>,
    {
        let updated = match self.queries.get(signature) {
            Some(existing) => {
                let mut list = (*existing).clone();
                list.keys.extend(keys);
                list.next_link = next_link;
                list
            }
            None => CachedKeyList::new(keys.into_iter().collect(), next_link),
        };
        self.queries.insert(signature.to_string(), Arc::new(updated));
    }

    /// Record a locally known key ahead of a query's result. It only becomes part of the confirmed set when the server
    /// returns it.
    pub fn add_key(&self, signature: &str, key: &str) {
        let mut list = self
            .queries
            .get(signature)
            .map(|existing| (*existing).clone())
            .unwrap_or_else(|| CachedKeyList::new(IndexSet::new(), None));
        if list.keys.contains(key) {
            return;
        }
        list.prepended.shift_insert(0, key.to_string());
        self.queries.insert(signature.to_string(), Arc::new(list));
    }

    /// Drop a key from every query.
    pub fn delete_key(&self, key: &str) {
        let affected = self
            .queries
            .iter()
            .filter(|(_, list)| list.keys.contains(key) || list.prepended.contains(key))
            .collect::<Vec<_>>();

        for (signature, list) in affected {
            let mut list = (*list).clone();
            list.keys.shift_remove(key);
            list.prepended.shift_remove(key);
            self.queries.insert((*signature).clone(), Arc::new(list));
        }
    }

    pub fn remove(&self, signature: &str) {
        self.queries.invalidate(signature);
    }

    pub fn clear(&self) {
        self.queries.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(list: &IndexSet<String>) -> Vec<&str> {
        list.iter().map(String::as_str).collect()
    }

    fn query_cache() -> QueryCache {
        QueryCache::new("test", 10, Duration::from_secs(60))
    }

    #[test]
    fn append_skips_known_keys() {
        let qc = query_cache();
        qc.set_keys("q", ["a", "b", "c"].map(String::from), Some("t2".into()));
        qc.append_keys("q", ["c", "d"].map(String::from), None);

        let list = qc.get_keys("q").expect("query is cached");
        assert_eq!(keys(list.keys()), vec!["a", "b", "c", "d"]);
        assert_eq!(list.next_link(), None);
    }

    #[test]
    fn set_replaces() {
        let qc = query_cache();
        qc.set_keys("q", ["a", "b"].map(String::from), None);
        qc.set_keys("q", ["c"].map(String::from), None);

        assert_eq!(keys(qc.get_keys("q").unwrap().keys()), vec!["c"]);
    }

    #[test]
    fn prepended_keys_come_first() {
        let qc = query_cache();
        qc.set_keys("q", ["a", "b"].map(String::from), None);
        qc.add_key("q", "x");
        qc.add_key("q", "y");
        // Already confirmed, nothing to prepend.
        qc.add_key("q", "b");

        let list = qc.get_keys("q").unwrap();
        assert_eq!(keys(&list.merged()), vec!["y", "x", "a", "b"]);

        // Once the server confirms a prepended key it keeps the confirmed position.
        qc.append_keys("q", ["x".to_string()], None);
        let list = qc.get_keys("q").unwrap();
        assert_eq!(keys(&list.merged()), vec!["y", "a", "b", "x"]);
    }

    #[test]
    fn delete_key_affects_every_query() {
        let qc = query_cache();
        qc.set_keys("q1", ["a", "b"].map(String::from), None);
        qc.set_keys("q2", ["b", "c"].map(String::from), None);
        qc.delete_key("b");

        assert_eq!(keys(qc.get_keys("q1").unwrap().keys()), vec!["a"]);
        assert_eq!(keys(qc.get_keys("q2").unwrap().keys()), vec!["c"]);
    }

    #[test]
    fn clear_and_remove() {
        let qc = query_cache();
        qc.set_keys("q1", ["a".to_string()], None);
        qc.set_keys("q2", ["b".to_string()], None);
        qc.remove("q1");
        assert!(qc.get_keys("q1").is_none());
        assert!(qc.get_keys("q2").is_some());

        qc.clear();
        assert!(qc.get_keys("q2").is_none());
    }

    #[test]
    fn capacity_bounds_remembered_queries() {
        let qc = QueryCache::new("test", 2, Duration::from_secs(60));
        for n in 0..5 {
            qc.set_keys(&format!("q{n}"), [format!("k{n}")], None);
        }
        qc.queries.run_pending_tasks();

        assert!(qc.queries.entry_count() <= 2);
        let remembered = (0..5).filter(|n| qc.get_keys(&format!("q{n}")).is_some()).count();
        assert!(remembered <= 2, "{remembered} queries remembered");
    }

    #[test]
    fn remembered_queries_expire() {
        let qc = QueryCache::new("test", 10, Duration::from_millis(50));
        qc.set_keys("q", ["a".to_string()], None);
        assert!(qc.get_keys("q").is_some());

        std::thread::sleep(Duration::from_millis(120));

        assert!(qc.get_keys("q").is_none());
        qc.queries.run_pending_tasks();
        assert_eq!(qc.queries.entry_count(), 0);
    }
}
