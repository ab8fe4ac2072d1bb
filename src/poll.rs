use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::warn;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Registry of recurring refresh timers, keyed by query signature.
///
/// Every poll owns its timer. The key only tells which query a poll refreshes and can be changed without touching the
/// timer.
#[derive(Debug, Default)]
pub struct PollService {
    polls:   Mutex<HashMap<String, HashSet<u64>>>,
    next_id: AtomicU64,
}

impl PollService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Call `callback` every `interval`, starting one interval from now.
    ///
    /// The timer runs until the returned handle is stopped or dropped. Returns `None` when called outside of a tokio
    /// runtime.
    pub fn start_poll<K, F>(self: &Arc<Self>, key: K, interval: Duration, callback: F) -> Option<PollHandle>
    where
        K: Into<String>,
        F: Fn() + Send + Sync + 'static,
    {
        let key = key.into();
        let Ok(runtime) = Handle::try_current()
        else {
            warn!("No async runtime to run the poll for '{key}' on");
            return None;
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let interval = interval.max(MIN_INTERVAL);

        self.polls.lock().entry(key.clone()).or_default().insert(id);
        debug!("Starting poll #{id} for '{key}' every {interval:?}");

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                callback();
            }
        });

        Some(PollHandle {
            id,
            interval,
            key: Mutex::new(key),
            service: Arc::downgrade(self),
            task: task.abort_handle(),
        })
    }

    /// Number of polls currently registered under the key.
    pub fn poll_count(&self, key: &str) -> usize {
        self.polls.lock().get(key).map_or(0, HashSet::len)
    }

    pub fn active_polls(&self) -> usize {
        self.polls.lock().values().map(HashSet::len).sum()
    }

    fn unregister(&self, key: &str, id: u64) {
        let mut polls = self.polls.lock();
        if let Some(ids) = polls.get_mut(key) {
            ids.remove(&id);
            if ids.is_empty() {
                polls.remove(key);
            }
        }
    }

    fn move_poll(&self, from: &str, to: &str, id: u64) {
        self.unregister(from, id);
        self.polls.lock().entry(to.to_string()).or_default().insert(id);
    }
}

/// A running poll.
#[derive(Debug)]
pub struct PollHandle {
    id:       u64,
    interval: Duration,
    key:      Mutex<String>,
    service:  Weak<PollService>,
    task:     AbortHandle,
}

impl PollHandle {
    pub fn key(&self) -> String {
        self.key.lock().clone()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Re-file the poll under another key. The timer keeps ticking on its schedule.
    pub fn update_key<K: Into<String>>(&self, key: K) {
        let key = key.into();
        let mut current = self.key.lock();
        if *current == key {
            return;
        }
        if let Some(service) = self.service.upgrade() {
            service.move_poll(&current, &key, self.id);
        }
        debug!("Poll #{} retargeted from '{}' to '{key}'", self.id, *current);
        *current = key;
    }

    pub fn stop(&self) {
        if self.task.is_finished() {
            return;
        }
        self.task.abort();
        if let Some(service) = self.service.upgrade() {
            service.unregister(&self.key.lock(), self.id);
        }
        debug!("Poll #{} stopped", self.id);
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_every_interval() {
        let service = PollService::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);
        let handle = service
            .start_poll("q", Duration::from_millis(100), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("runtime");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0, "first tick is one interval away");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        handle.stop();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(service.active_polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn update_key_retargets_same_timer() {
        let service = PollService::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);
        let handle = service
            .start_poll("old", Duration::from_millis(100), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("runtime");

        handle.update_key("new");
        assert_eq!(service.poll_count("old"), 0);
        assert_eq!(service.poll_count("new"), 1);
        assert_eq!(service.active_polls(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        drop(handle);
        assert_eq!(service.active_polls(), 0);
    }

    #[test]
    fn no_runtime_no_poll() {
        let service = PollService::new();
        assert!(service.start_poll("q", Duration::from_millis(100), || ()).is_none());
        assert_eq!(service.active_polls(), 0);
    }
}
