//! Minimal publish/subscribe primitives the cache and the views are built upon.
//!
//! Two flavors are provided:
//!
//! - [`Subject`] delivers discrete events. Nothing is replayed to late subscribers.
//! - [`BehaviorSubject`] holds a current value. Every new subscriber immediately receives it.
//!
//! Delivery is synchronous, but never re-entrant. Every subject delivers through a [`Dispatcher`]; subjects may share
//! one. If an observer emits into any subject of a dispatcher that is currently delivering (directly or through a chain
//! of other subjects), the value is queued and delivered by the outermost emitter once the current round of observers
//! returns. Observers therefore always see values in emission order and never observe a partially delivered
//! notification.
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;
type Job = Box<dyn FnOnce() + Send + 'static>;

struct Observers<T> {
    next_id: u64,
    list:    Vec<(u64, Callback<T>)>,
}

#[derive(Default)]
struct DispatchQueue {
    jobs:     VecDeque<Job>,
    draining: bool,
}

// Resets the queue if an observer panics so the dispatcher stays usable.
struct DrainGuard<'a> {
    queue: &'a Mutex<DispatchQueue>,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut queue = self.queue.lock();
            queue.jobs.clear();
            queue.draining = false;
        }
    }
}

/// Delivery queue of one or more subjects.
///
/// Subjects sharing a dispatcher deliver strictly in emission order across all of them. Use [`batch`](Self::batch)
/// to make a group of emissions look atomic to observers: nothing is delivered until the closure returns.
#[derive(Clone, Default)]
pub struct Dispatcher {
    queue: Arc<Mutex<DispatchQueue>>,
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.queue.lock();
        f.debug_struct("Dispatcher")
            .field("queued", &queue.jobs.len())
            .field("draining", &queue.draining)
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with delivery held back. Everything emitted through this dispatcher while `f` runs is delivered after
    /// it returns, in emission order. If a delivery is already in progress up the stack, `f` just runs and its
    /// emissions join the current queue.
    pub fn batch<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        if !self.claim() {
            return f();
        }
        let mut guard = DrainGuard {
            queue: &self.queue,
            armed: true,
        };
        let result = f();
        self.drain(&mut guard);
        result
    }

    #[inline]
    pub fn is_draining(&self) -> bool {
        self.queue.lock().draining
    }

    // Returns `true` if the caller is now responsible for draining the queue.
    fn claim(&self) -> bool {
        let mut queue = self.queue.lock();
        !std::mem::replace(&mut queue.draining, true)
    }

    // Same as `claim`, with a job queued first.
    fn push(&self, job: Job) -> bool {
        let mut queue = self.queue.lock();
        queue.jobs.push_back(job);
        !std::mem::replace(&mut queue.draining, true)
    }

    fn run(&self) {
        let mut guard = DrainGuard {
            queue: &self.queue,
            armed: true,
        };
        self.drain(&mut guard);
    }

    fn drain(&self, guard: &mut DrainGuard<'_>) {
        loop {
            let job = {
                let mut queue = self.queue.lock();
                match queue.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        queue.draining = false;
                        guard.armed = false;
                        return;
                    }
                }
            };
            job();
        }
    }
}

struct SubjectInner<T> {
    observers:  Mutex<Observers<T>>,
    dispatcher: Dispatcher,
    completed:  AtomicBool,
}

impl<T> SubjectInner<T> {
    fn remove(&self, id: u64) {
        let removed = {
            let mut observers = self.observers.lock();
            observers
                .list
                .iter()
                .position(|(oid, _)| *oid == id)
                .map(|idx| observers.list.remove(idx))
        };
        // The callback may own resources whose drop re-enters the subject. Release it outside of the lock.
        drop(removed);
    }

    fn snapshot(&self) -> Vec<Callback<T>> {
        self.observers.lock().list.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }
}

/// Event stream without replay.
pub struct Subject<T> {
    inner: Arc<SubjectInner<T>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Subject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subject")
            .field("observers", &self.inner.observers.lock().list.len())
            .field("completed", &self.inner.completed.load(Ordering::Acquire))
            .finish()
    }
}

impl<T> Default for Subject<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subject<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_dispatcher(&Dispatcher::new())
    }

    /// Subject delivering through a shared dispatcher.
    pub fn with_dispatcher(dispatcher: &Dispatcher) -> Self {
        Self {
            inner: Arc::new(SubjectInner {
                observers:  Mutex::new(Observers {
                    next_id: 0,
                    list:    Vec::new(),
                }),
                dispatcher: dispatcher.clone(),
                completed:  AtomicBool::new(false),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Register an observer. It stays registered until the returned [`Subscription`] is dropped or the subject
    /// completes.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        if self.is_completed() {
            return Subscription::empty();
        }

        let id = {
            let mut observers = self.inner.observers.lock();
            let id = observers.next_id;
            observers.next_id += 1;
            observers.list.push((id, Arc::new(observer)));
            id
        };

        let weak: Weak<SubjectInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(id);
            }
        })
    }

    /// Adapt the subject into an async stream. The stream ends when the subject completes.
    ///
    /// The returned stream keeps its registration alive for as long as it exists.
    pub fn stream(&self) -> SubjectStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |value: &T| {
            let _ = tx.send(value.clone());
        });
        SubjectStream::new(rx, subscription)
    }

    /// Emit a value to all current observers.
    pub fn next(&self, value: T) {
        if self.enqueue(value) {
            self.inner.dispatcher.run();
        }
    }

    // Returns `true` if the caller is now responsible for draining the dispatcher.
    fn enqueue(&self, value: T) -> bool {
        if self.is_completed() {
            return false;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.push(Box::new(move || {
            for observer in inner.snapshot() {
                observer(&value);
            }
        }))
    }

    /// Stop delivering values and release all observers. Streams created with [`Subject::stream`] terminate.
    pub fn complete(&self) {
        if self.inner.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let released = std::mem::take(&mut self.inner.observers.lock().list);
        drop(released);
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().list.len()
    }
}

/// A value holder which notifies about every change and replays the current value to new subscribers.
pub struct BehaviorSubject<T> {
    value:   RwLock<T>,
    changes: Subject<T>,
}

impl<T> Debug for BehaviorSubject<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorSubject").field("value", &*self.value.read()).finish()
    }
}

impl<T> BehaviorSubject<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(initial: T) -> Self {
        Self::with_dispatcher(initial, &Dispatcher::new())
    }

    /// Value holder delivering through a shared dispatcher.
    pub fn with_dispatcher(initial: T, dispatcher: &Dispatcher) -> Self {
        Self {
            value:   RwLock::new(initial),
            changes: Subject::with_dispatcher(dispatcher),
        }
    }

    #[inline]
    pub fn value(&self) -> T {
        self.value.read().clone()
    }

    /// Store a new value and notify observers. The value is stored before any observer is called.
    pub fn next(&self, value: T) {
        self.update(|_| Some(value));
    }

    /// Compute the next value out of the current one and notify observers. Returning `None` leaves the value as is
    /// and notifies nobody. Returns `true` if a new value was stored.
    ///
    /// Concurrent updates are serialized and observers receive their results in the order they were stored.
    /// `f` runs under the subject's lock and must not touch the subject.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> Option<T>,
    {
        if self.changes.is_completed() {
            return false;
        }
        let must_drain = {
            let mut current = self.value.write();
            let Some(value) = f(&current)
            else {
                return false;
            };
            *current = value.clone();
            self.changes.enqueue(value)
        };
        if must_drain {
            self.changes.dispatcher().run();
        }
        true
    }

    /// Register an observer. It is called with the current value before this method returns.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let observer = Arc::new(observer);
        let subscription = {
            let observer = Arc::clone(&observer);
            self.changes.subscribe(move |value| observer(value))
        };
        if !self.changes.is_completed() {
            observer(&self.value());
        }
        subscription
    }

    /// Register an observer which only sees values emitted after this call.
    pub fn subscribe_changes<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.changes.subscribe(observer)
    }

    /// Async stream starting with the current value.
    pub fn stream(&self) -> SubjectStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.changes.is_completed() {
            let _ = tx.send(self.value());
        }
        let subscription = self.changes.subscribe(move |value: &T| {
            let _ = tx.send(value.clone());
        });
        SubjectStream::new(rx, subscription)
    }

    pub fn complete(&self) {
        self.changes.complete();
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.changes.is_completed()
    }

    pub fn observer_count(&self) -> usize {
        self.changes.observer_count()
    }
}

impl<T> BehaviorSubject<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Same as [`next`](Self::next) but structurally equal values are swallowed.
    ///
    /// Returns `true` if the value was emitted.
    pub fn next_if_changed(&self, value: T) -> bool {
        self.update(|current| (*current != value).then_some(value))
    }
}

/// Registration handle. Dropping it unsubscribes the observer.
#[must_use = "dropping a Subscription immediately unsubscribes the observer"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Subscription {
    fn new<F>(unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub(crate) fn empty() -> Self {
        Self { unsubscribe: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }

    /// Keep the observer registered for the lifetime of the subject.
    pub fn detach(mut self) {
        self.unsubscribe.take();
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Stream of values emitted by a subject.
pub struct SubjectStream<T> {
    inner:         UnboundedReceiverStream<T>,
    _subscription: Subscription,
}

impl<T> SubjectStream<T> {
    fn new(rx: mpsc::UnboundedReceiver<T>, subscription: Subscription) -> Self {
        Self {
            inner:         UnboundedReceiverStream::new(rx),
            _subscription: subscription,
        }
    }
}

impl<T> tokio_stream::Stream for SubjectStream<T> {
    type Item = T;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.inner).poll_next(cx)
    }
}
