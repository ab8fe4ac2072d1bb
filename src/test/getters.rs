use async_trait::async_trait;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::FetchError;
use crate::options::ListOptions;
use crate::traits::Entity;
use crate::traits::EntityGetter;
use crate::traits::ListGetter;
use crate::traits::ViewParams;
use crate::types::ContinuationToken;
use crate::types::ListResponse;

type EntityResponder<E, P> = Box<dyn Fn(&P, usize) -> Result<E, FetchError> + Send + Sync>;
type PageResponder<E, P> =
    Box<dyn Fn(&P, &ListOptions, Option<&ContinuationToken>) -> Result<ListResponse<E>, FetchError> + Send + Sync>;

/// Holds requests back until the test lets them through.
#[derive(Debug)]
pub struct Gate {
    permits: Semaphore,
}

impl Gate {
    /// Lets everything through.
    pub fn open() -> Self {
        Self {
            permits: Semaphore::new(Semaphore::MAX_PERMITS),
        }
    }

    /// Holds every request until [`release`](Self::release)d.
    pub fn closed() -> Self {
        Self {
            permits: Semaphore::new(0),
        }
    }

    /// Let `count` more requests through.
    pub fn release(&self, count: usize) {
        self.permits.add_permits(count);
    }

    async fn pass(&self) {
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

/// An [`EntityGetter`] answering with whatever the responder closure returns. The closure receives the params and
/// the index of the call.
pub struct FakeEntityGetter<E, P> {
    responder: EntityResponder<E, P>,
    cached:    Option<Box<dyn Fn(&P) -> Option<E> + Send + Sync>>,
    gate:      Gate,
    calls:     AtomicUsize,
}

impl<E, P> FakeEntityGetter<E, P>
where
    E: Entity,
    P: ViewParams,
{
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&P, usize) -> Result<E, FetchError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            cached:    None,
            gate:      Gate::open(),
            calls:     AtomicUsize::new(0),
        }
    }

    pub fn gated(mut self) -> Self {
        self.gate = Gate::closed();
        self
    }

    pub fn with_cached<F>(mut self, cached: F) -> Self
    where
        F: Fn(&P) -> Option<E> + Send + Sync + 'static,
    {
        self.cached = Some(Box::new(cached));
        self
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    /// How many times `fetch` was called.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<E, P> EntityGetter<E, P> for FakeEntityGetter<E, P>
where
    E: Entity,
    P: ViewParams,
{
    async fn fetch(&self, params: &P) -> Result<E, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate.pass().await;
        (self.responder)(params, call)
    }

    fn fetch_from_cache(&self, params: &P) -> Option<E> {
        self.cached.as_ref().and_then(|cached| cached(params))
    }
}

/// A [`ListGetter`] answering with whatever the responder closure returns for the params, options, and continuation
/// token of a request. `fetch_all` follows the tokens.
pub struct FakeListGetter<E, P> {
    responder: PageResponder<E, P>,
    gate:      Gate,
    calls:     AtomicUsize,
}

impl<E, P> FakeListGetter<E, P>
where
    E: Entity,
    P: ViewParams,
{
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&P, &ListOptions, Option<&ContinuationToken>) -> Result<ListResponse<E>, FetchError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            responder: Box::new(responder),
            gate:      Gate::open(),
            calls:     AtomicUsize::new(0),
        }
    }

    /// Serve fixed pages. Page `n` links to `"page-{n+1}"`; the last page has no link.
    pub fn pages(pages: Vec<Vec<E>>) -> Self {
        Self::new(move |_, _, token| {
            let index = match token {
                None => 0,
                Some(token) => token
                    .as_str()
                    .strip_prefix("page-")
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or_else(|| FetchError::Transport(format!("bad token {token}")))?,
            };
            let items = pages.get(index).cloned().unwrap_or_default();
            let next_link = (index + 1 < pages.len()).then(|| ContinuationToken::new(format!("page-{}", index + 1)));
            Ok(ListResponse::new(items, next_link))
        })
    }

    pub fn gated(mut self) -> Self {
        self.gate = Gate::closed();
        self
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    /// How many pages were requested.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn respond(
        &self,
        params: &P,
        options: &ListOptions,
        token: Option<&ContinuationToken>,
    ) -> Result<ListResponse<E>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate.pass().await;
        (self.responder)(params, options, token)
    }
}

#[async_trait]
impl<E, P> ListGetter<E, P> for FakeListGetter<E, P>
where
    E: Entity,
    P: ViewParams,
{
    async fn fetch(&self, params: &P, options: &ListOptions, _force_new: bool) -> Result<ListResponse<E>, FetchError> {
        self.respond(params, options, None).await
    }

    async fn fetch_next(
        &self,
        params: &P,
        options: &ListOptions,
        token: &ContinuationToken,
    ) -> Result<ListResponse<E>, FetchError> {
        self.respond(params, options, Some(token)).await
    }
}
