use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use std::fmt::Debug;

use crate::error::FetchError;
use crate::options::ListOptions;
use crate::types::ContinuationToken;
use crate::types::ListResponse;

/// An immutable snapshot of a remote resource.
///
/// The default method implementations go through `serde_json` and are good enough for most records. Override them
/// where field access is hot.
pub trait Entity: Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// String form of the named attribute. Non-string scalars are rendered as JSON; `null` and missing attributes
    /// yield `None`.
    fn field(&self, name: &str) -> Option<String> {
        match serde_json::to_value(self).ok()?.get(name)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// All attributes of the record.
    fn fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Build a record out of a set of attributes. Used to render placeholders for keys known only locally.
    fn from_fields(fields: Map<String, Value>) -> Option<Self> {
        serde_json::from_value(Value::Object(fields)).ok()
    }
}

/// Parameters identifying what a view is looking at; e.g. a pool ID, or a pool/node pair.
///
/// Their JSON form is part of the query signature.
pub trait ViewParams: Debug + Clone + PartialEq + Default + Serialize + Send + Sync + 'static {}

impl<T> ViewParams for T where T: Debug + Clone + PartialEq + Default + Serialize + Send + Sync + 'static {}

/// Loads a single entity.
#[async_trait]
pub trait EntityGetter<E, P>: Send + Sync + 'static
where
    E: Entity,
    P: ViewParams,
{
    async fn fetch(&self, params: &P) -> Result<E, FetchError>;

    /// Fast path, must not do any I/O.
    fn fetch_from_cache(&self, _params: &P) -> Option<E> {
        None
    }
}

/// Loads pages of a list.
#[async_trait]
pub trait ListGetter<E, P>: Send + Sync + 'static
where
    E: Entity,
    P: ViewParams,
{
    /// Fetch the first page.
    async fn fetch(&self, params: &P, options: &ListOptions, force_new: bool) -> Result<ListResponse<E>, FetchError>;

    /// Fetch the page the token points at.
    async fn fetch_next(
        &self,
        params: &P,
        options: &ListOptions,
        token: &ContinuationToken,
    ) -> Result<ListResponse<E>, FetchError>;

    /// Fetch every page. The default implementation follows continuation tokens until exhausted.
    async fn fetch_all(&self, params: &P, options: &ListOptions) -> Result<Vec<E>, FetchError> {
        let mut response = self.fetch(params, options, true).await?;
        let mut items = std::mem::take(&mut response.items);
        while let Some(token) = response.next_link.take() {
            response = self.fetch_next(params, options, &token).await?;
            items.append(&mut response.items);
        }
        Ok(items)
    }

    /// Fast path for the first page, must not do any I/O.
    fn fetch_from_cache(&self, _params: &P, _options: &ListOptions) -> Option<ListResponse<E>> {
        None
    }
}
