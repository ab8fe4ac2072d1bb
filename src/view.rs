//! Plumbing shared by [`EntityView`](crate::entity_view::EntityView) and [`ListView`](crate::list_view::ListView).
//!
//! A view goes through a simple status cycle: it is `Loading` while a request is in flight and either `Ready` or
//! `Error` once the request settles. There is never more than one request in flight per view: asking for data while a
//! request is outstanding joins it. Changing params aborts the outstanding request; its response, should it still
//! arrive, is discarded.
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde_json::Map;
use serde_json::Value;
use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::warn;

use crate::cache::EntityCache;
use crate::error::FetchError;
use crate::error::Result;
use crate::error::ViewError;
use crate::observable::BehaviorSubject;
use crate::observable::Subject;
use crate::observable::Subscription;
use crate::poll::PollHandle;
use crate::traits::Entity;
use crate::traits::ViewParams;
use crate::types::CacheAccessor;
use crate::types::ErrorHook;
use crate::types::ItemMap;
use crate::types::LoadingStatus;

/// Attributes of view params, if they serialize into an object.
pub(crate) fn params_fields<P: ViewParams>(params: &P) -> Map<String, Value> {
    match serde_json::to_value(params) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// String form of a params attribute, rendered the way [`Entity::field`] renders entity attributes.
pub(crate) fn params_field<P: ViewParams>(params: &P, name: &str) -> Option<String> {
    match params_fields(params).remove(name)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Completion handle of a view request.
///
/// Every caller joining the same in-flight request gets a handle to the same outcome. Awaiting a handle is optional;
/// the request runs regardless.
#[derive(Debug, Clone)]
pub struct FetchHandle {
    rx: watch::Receiver<Option<Result<()>>>,
}

impl FetchHandle {
    /// A handle for an outcome known upfront.
    pub fn resolved(outcome: Result<()>) -> Self {
        let (_tx, rx) = watch::channel(Some(outcome));
        Self { rx }
    }

    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Outcome of the request, if it has settled.
    pub fn outcome(&self) -> Option<Result<()>> {
        (*self.rx.borrow()).clone()
    }

    /// Wait for the request to settle.
    ///
    /// Yields [`ViewError::Aborted`] if the request was superseded or the view went away.
    pub async fn wait(mut self) -> Result<()> {
        loop {
            let current = (*self.rx.borrow_and_update()).clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                return (*self.rx.borrow()).clone().unwrap_or(Err(ViewError::Aborted));
            }
        }
    }
}

struct InFlight {
    generation: u64,
    tx:         watch::Sender<Option<Result<()>>>,
    task:       Option<AbortHandle>,
}

impl InFlight {
    fn handle(&self) -> FetchHandle {
        FetchHandle { rx: self.tx.subscribe() }
    }

    fn abort(self) {
        if let Some(task) = self.task {
            task.abort();
        }
        self.tx.send_replace(Some(Err(ViewError::Aborted)));
    }
}

struct CoreState<E, P>
where
    E: Entity,
{
    params:          P,
    cache:           Arc<EntityCache<E>>,
    cache_subs:      Vec<Subscription>,
    options_key:     String,
    in_flight:       Option<InFlight>,
    next_generation: u64,
    poll:            Option<PollHandle>,
}

impl<E, P> CoreState<E, P>
where
    E: Entity,
    P: ViewParams,
{
    fn signature(&self) -> String {
        let params = serde_json::to_string(&self.params).unwrap_or_default();
        format!("{params}|{}", self.options_key)
    }
}

/// State and streams common to all views.
///
/// Streams:
///
/// - [`status`](Self::status): the request status, replayed to new subscribers;
/// - [`new_data_status`](Self::new_data_status): `Loading` only while data for new params is being loaded, follows
///   `status` otherwise;
/// - [`error`](Self::error): the last surfaced error, reset when a new request starts;
/// - [`deleted`](Self::deleted): keys removed from the bound cache;
/// - [`cache_cleared`](Self::cache_cleared): the bound cache was cleared;
/// - [`cache_items`](Self::cache_items): the bound cache content changed.
pub struct ViewCore<E, P>
where
    E: Entity,
    P: ViewParams,
{
    cache_accessor:  CacheAccessor<E, P>,
    on_error:        RwLock<Option<ErrorHook>>,
    status:          BehaviorSubject<LoadingStatus>,
    new_data_status: BehaviorSubject<LoadingStatus>,
    error:           BehaviorSubject<Option<FetchError>>,
    deleted:         Subject<String>,
    cache_cleared:   Subject<()>,
    cache_items:     Subject<ItemMap<E>>,
    state:           Mutex<CoreState<E, P>>,
    disposed:        AtomicBool,
}

impl<E, P> Debug for ViewCore<E, P>
where
    E: Entity,
    P: ViewParams,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewCore")
            .field("signature", &self.signature())
            .field("status", &self.status.value())
            .field("in_flight", &self.query_in_progress())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl<E, P> ViewCore<E, P>
where
    E: Entity,
    P: ViewParams,
{
    /// A core bound to the cache of default params.
    pub fn new(cache_accessor: CacheAccessor<E, P>) -> Arc<Self> {
        let params = P::default();
        let cache = cache_accessor(&params);

        let core = Arc::new(Self {
            cache_accessor,
            on_error: RwLock::new(None),
            status: BehaviorSubject::new(LoadingStatus::Loading),
            new_data_status: BehaviorSubject::new(LoadingStatus::Loading),
            error: BehaviorSubject::new(None),
            deleted: Subject::new(),
            cache_cleared: Subject::new(),
            cache_items: Subject::new(),
            state: Mutex::new(CoreState {
                params,
                cache: Arc::clone(&cache),
                cache_subs: Vec::new(),
                options_key: String::new(),
                in_flight: None,
                next_generation: 0,
                poll: None,
            }),
            disposed: AtomicBool::new(false),
        });

        let subs = core.bind(&cache);
        core.state.lock().cache_subs = subs;
        core
    }

    fn bind(&self, cache: &EntityCache<E>) -> Vec<Subscription> {
        let deleted = self.deleted.clone();
        let cleared = self.cache_cleared.clone();
        let items = self.cache_items.clone();
        vec![
            cache.deleted().subscribe(move |key: &String| deleted.next(key.clone())),
            cache.cleared().subscribe(move |_: &()| cleared.next(())),
            cache
                .items()
                .subscribe_changes(move |map: &ItemMap<E>| items.next(Arc::clone(map))),
        ]
    }

    pub fn status(&self) -> &BehaviorSubject<LoadingStatus> {
        &self.status
    }

    pub fn new_data_status(&self) -> &BehaviorSubject<LoadingStatus> {
        &self.new_data_status
    }

    pub fn error(&self) -> &BehaviorSubject<Option<FetchError>> {
        &self.error
    }

    pub fn deleted(&self) -> &Subject<String> {
        &self.deleted
    }

    pub fn cache_cleared(&self) -> &Subject<()> {
        &self.cache_cleared
    }

    pub fn cache_items(&self) -> &Subject<ItemMap<E>> {
        &self.cache_items
    }

    pub fn params(&self) -> P {
        self.state.lock().params.clone()
    }

    pub fn cache(&self) -> Arc<EntityCache<E>> {
        Arc::clone(&self.state.lock().cache)
    }

    /// The key of the current query: serialized params and options.
    pub fn signature(&self) -> String {
        self.state.lock().signature()
    }

    pub fn set_on_error(&self, hook: Option<ErrorHook>) {
        *self.on_error.write() = hook;
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn query_in_progress(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }

    /// Switch to new params. The cache is re-resolved, the outstanding request is aborted, and the view goes back to
    /// `Loading` until the next request settles.
    pub fn set_params(&self, params: P) {
        if self.is_disposed() {
            return;
        }

        let cache = (self.cache_accessor)(&params);
        let rebind = !Arc::ptr_eq(&cache, &self.state.lock().cache);
        let new_subs = if rebind { self.bind(&cache) } else { Vec::new() };

        let old_subs = {
            let mut state = self.state.lock();
            state.params = params;
            state.cache = cache;
            let old_subs = if rebind {
                std::mem::replace(&mut state.cache_subs, new_subs)
            }
            else {
                Vec::new()
            };
            let signature = state.signature();
            if let Some(poll) = &state.poll {
                poll.update_key(signature);
            }
            old_subs
        };
        drop(old_subs);

        self.new_data_status.next_if_changed(LoadingStatus::Loading);
        self.abort_fetch();
        self.set_status(LoadingStatus::Loading);
    }

    /// Change the options part of the query signature. Retargets the poll, if any.
    pub fn set_options_key(&self, options_key: String) {
        let mut state = self.state.lock();
        state.options_key = options_key;
        let signature = state.signature();
        if let Some(poll) = &state.poll {
            poll.update_key(signature);
        }
    }

    pub fn set_status(&self, status: LoadingStatus) {
        if status == LoadingStatus::Loading {
            self.error.next_if_changed(None);
        }
        self.status.next_if_changed(status);
        if status != LoadingStatus::Loading && self.new_data_status.value() == LoadingStatus::Loading {
            self.new_data_status.next(status);
        }
    }

    /// Run a request unless one is in flight already, in which case the outstanding one is joined and `get_data` is
    /// dropped without being polled.
    ///
    /// `on_success` receives the data before the view turns `Ready`. `on_failure` is only called for errors that are
    /// surfaced, i.e. not vetoed by the error hook. A response arriving after the request was aborted is discarded
    /// without calling either.
    pub fn fetch_data<T, Fut, S, F>(self: &Arc<Self>, get_data: Fut, on_success: S, on_failure: F) -> FetchHandle
    where
        T: Send + 'static,
        Fut: Future<Output = std::result::Result<T, FetchError>> + Send + 'static,
        S: FnOnce(T) + Send + 'static,
        F: FnOnce(&FetchError) + Send + 'static,
    {
        if self.is_disposed() {
            return FetchHandle::resolved(Err(ViewError::Disposed));
        }

        let (generation, handle) = {
            let mut state = self.state.lock();
            if let Some(in_flight) = &state.in_flight {
                debug!("Joining in-flight request #{}", in_flight.generation);
                return in_flight.handle();
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            let (tx, rx) = watch::channel(None);
            state.in_flight = Some(InFlight {
                generation,
                tx,
                task: None,
            });
            (generation, FetchHandle { rx })
        };

        debug!("Issuing request #{generation} for {}", self.signature());
        self.set_status(LoadingStatus::Loading);

        let Ok(runtime) = Handle::try_current()
        else {
            warn!("No async runtime to run request #{generation} on");
            self.abort_generation(generation);
            return handle;
        };

        let core = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            let result = get_data.await;
            if let Some(core) = core.upgrade() {
                core.settle(generation, result, on_success, on_failure);
            }
        });

        let mut state = self.state.lock();
        match state.in_flight.as_mut() {
            Some(in_flight) if in_flight.generation == generation => in_flight.task = Some(task.abort_handle()),
            // Aborted while we were setting up.
            _ => task.abort(),
        }

        handle
    }

    fn settle<T, S, F>(&self, generation: u64, result: std::result::Result<T, FetchError>, on_success: S, on_failure: F)
    where
        S: FnOnce(T),
        F: FnOnce(&FetchError),
    {
        let in_flight = {
            let mut state = self.state.lock();
            if state.in_flight.as_ref().is_some_and(|f| f.generation == generation) {
                state.in_flight.take()
            }
            else {
                None
            }
        };

        let Some(in_flight) = in_flight
        else {
            debug!("Discarding stale response of request #{generation}");
            return;
        };

        let outcome = match result {
            Ok(data) => {
                on_success(data);
                self.set_status(LoadingStatus::Ready);
                Ok(())
            }
            Err(err) => {
                let hook = self.on_error.read().clone();
                if hook.is_none_or(|hook| hook(&err)) {
                    debug!("Request #{generation} failed: {err}");
                    self.error.next(Some(err.clone()));
                    self.set_status(LoadingStatus::Error);
                    on_failure(&err);
                    Err(ViewError::Fetch(err))
                }
                else {
                    debug!("Request #{generation} failed, error ignored: {err}");
                    self.set_status(LoadingStatus::Ready);
                    Ok(())
                }
            }
        };

        in_flight.tx.send_replace(Some(outcome));
    }

    /// Abort the outstanding request, if any. Its waiters get [`ViewError::Aborted`].
    pub fn abort_fetch(&self) -> bool {
        let in_flight = self.state.lock().in_flight.take();
        match in_flight {
            Some(in_flight) => {
                debug!("Aborting request #{}", in_flight.generation);
                in_flight.abort();
                true
            }
            None => false,
        }
    }

    fn abort_generation(&self, generation: u64) {
        let in_flight = {
            let mut state = self.state.lock();
            if state.in_flight.as_ref().is_some_and(|f| f.generation == generation) {
                state.in_flight.take()
            }
            else {
                None
            }
        };
        if let Some(in_flight) = in_flight {
            in_flight.abort();
        }
    }

    /// Register the view's poll with the poll service of the bound cache. A view polls at most once; if a poll is
    /// running already this is a no-op and `false` is returned.
    ///
    /// Ticks falling on an outstanding request are skipped. Outside of a tokio runtime nothing is started and `false`
    /// is returned.
    pub fn start_poll<F>(self: &Arc<Self>, interval: Duration, on_tick: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_disposed() {
            return false;
        }

        let (signature, cache) = {
            let state = self.state.lock();
            if state.poll.is_some() {
                return false;
            }
            (state.signature(), Arc::clone(&state.cache))
        };

        let core = Arc::downgrade(self);
        let callback = move || {
            let Some(core) = core.upgrade()
            else {
                return;
            };
            if core.query_in_progress() {
                debug!("Poll tick skipped, request in flight for {}", core.signature());
                return;
            }
            on_tick();
        };

        let Some(poll) = cache.poll_service().start_poll(signature, interval, callback)
        else {
            return false;
        };

        let mut state = self.state.lock();
        if state.poll.is_some() || self.is_disposed() {
            // Somebody else got here first. Dropping the handle stops the new timer.
            return false;
        }
        poll.update_key(state.signature());
        state.poll = Some(poll);
        true
    }

    pub fn stop_poll(&self) {
        let poll = self.state.lock().poll.take();
        drop(poll);
    }

    pub fn is_polling(&self) -> bool {
        self.state.lock().poll.as_ref().is_some_and(PollHandle::is_active)
    }

    /// Key the poll is currently registered under.
    pub fn poll_key(&self) -> Option<String> {
        self.state.lock().poll.as_ref().map(PollHandle::key)
    }

    /// Abort the outstanding request, stop polling, detach from the cache, and complete every stream. Calling it
    /// again does nothing.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.abort_fetch();
        let (subs, poll) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.cache_subs), state.poll.take())
        };
        drop(subs);
        drop(poll);

        self.status.complete();
        self.new_data_status.complete();
        self.error.complete();
        self.deleted.complete();
        self.cache_cleared.complete();
        self.cache_items.complete();
        debug!("View disposed");
    }
}

/// Operations available on every view.
pub trait GenericView<E, P>: Send + Sync
where
    E: Entity,
    P: ViewParams,
{
    fn core(&self) -> &Arc<ViewCore<E, P>>;

    /// Switch the view to new params. Nothing is fetched until asked to.
    fn set_params(&self, params: P);

    /// What a poll tick does.
    fn poll_refresh(&self) -> FetchHandle;

    fn params(&self) -> P {
        self.core().params()
    }

    fn cache(&self) -> Arc<EntityCache<E>> {
        self.core().cache()
    }

    fn status(&self) -> &BehaviorSubject<LoadingStatus> {
        self.core().status()
    }

    fn new_data_status(&self) -> &BehaviorSubject<LoadingStatus> {
        self.core().new_data_status()
    }

    fn error(&self) -> &BehaviorSubject<Option<FetchError>> {
        self.core().error()
    }

    /// Keys deleted from the view's cache.
    fn deleted(&self) -> &Subject<String> {
        self.core().deleted()
    }

    /// Install an error filter. Returning `false` from it makes the view act as if the failed request succeeded.
    fn set_on_error<H>(&self, hook: H)
    where
        H: Fn(&FetchError) -> bool + Send + Sync + 'static,
        Self: Sized,
    {
        self.core().set_on_error(Some(Arc::new(hook)));
    }

    fn query_in_progress(&self) -> bool {
        self.core().query_in_progress()
    }

    fn abort_fetch(&self) -> bool {
        self.core().abort_fetch()
    }

    fn stop_poll(&self) {
        self.core().stop_poll();
    }

    fn is_polling(&self) -> bool {
        self.core().is_polling()
    }

    fn is_disposed(&self) -> bool {
        self.core().is_disposed()
    }

    fn dispose(&self) {
        self.core().dispose();
    }
}
