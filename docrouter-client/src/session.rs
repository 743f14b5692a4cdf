use crate::executor::{ExecuteOptions, OperationKind};
use crate::lazy::{Decoder, Lazy, LazyBatchQueue, MissingSlot, OnEval};
use crate::router::DatabaseRouter;
use docrouter_core::{Method, Operation, OperationSpec, RouterError, SessionId};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One unit of work against a database.
///
/// Eager calls go straight through the router. Lazy calls accumulate in the
/// session's own queue until the first handle is forced or
/// [`Session::execute_all_pending_lazy_operations`] runs.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    router: Arc<DatabaseRouter>,
    lazy: LazyBatchQueue,
    eager_requests: u64,
}

impl Session {
    pub fn new(router: Arc<DatabaseRouter>) -> Self {
        let lazy = LazyBatchQueue::new(Arc::clone(router.executor()));
        Self {
            id: SessionId::new(),
            router,
            lazy,
            eager_requests: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn router(&self) -> &Arc<DatabaseRouter> {
        &self.router
    }

    /// Round trips made by this session, counting one per lazy flush
    pub fn number_of_requests(&self) -> u64 {
        self.eager_requests + self.lazy.flush_count()
    }

    /// Lazy operations waiting for the next flush
    pub fn pending_lazy_operations(&self) -> usize {
        self.lazy.len()
    }

    /// Load one document; a missing document yields `None`
    pub async fn load<T: DeserializeOwned>(&mut self, id: &str) -> Result<Option<T>, RouterError> {
        match self.send(document_spec(Method::Get, id)?, OperationKind::Read).await {
            Ok(Value::Null) => Ok(None),
            Ok(value) => Ok(Some(serde_json::from_value(value)?)),
            Err(RouterError::Application(err)) if err.status == 404 => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn put<B: Serialize>(&mut self, id: &str, body: &B) -> Result<Value, RouterError> {
        let spec = document_spec(Method::Put, id)?.with_body(serde_json::to_value(body)?);
        self.send(spec, OperationKind::Write).await
    }

    pub async fn delete(&mut self, id: &str) -> Result<(), RouterError> {
        let spec = document_spec(Method::Delete, id)?;
        self.send(spec, OperationKind::Write).await.map(|_| ())
    }

    /// Deferred [`Session::load`]; a null or not-found slot decodes to `None`
    pub fn load_lazily<T>(&mut self, id: &str) -> Result<Lazy<Option<T>>, RouterError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let decoder: Decoder<Option<T>> = Box::new(|value: Value| -> Result<Option<T>, RouterError> {
            match value {
                Value::Null => Ok(None),
                value => Ok(Some(serde_json::from_value(value)?)),
            }
        });
        self.lazy
            .enqueue_with(document_spec(Method::Get, id)?, MissingSlot::Null, decoder, None)
    }

    /// Deferred index query; `on_eval` sees the decoded results once
    pub fn query_lazily<T>(
        &mut self,
        index: &str,
        query: &str,
        on_eval: Option<OnEval<Vec<T>>>,
    ) -> Result<Lazy<Vec<T>>, RouterError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let decoder: Decoder<Vec<T>> = Box::new(|mut value: Value| -> Result<Vec<T>, RouterError> {
            let results = value
                .get_mut("results")
                .map(Value::take)
                .ok_or_else(|| RouterError::Decode("query response has no results".to_string()))?;
            Ok(serde_json::from_value(results)?)
        });
        self.lazy.enqueue(query_spec(index, query, false)?, decoder, on_eval)
    }

    /// Deferred count of the documents matching `query`
    pub fn count_lazily(&mut self, index: &str, query: &str) -> Result<Lazy<u64>, RouterError> {
        let decoder: Decoder<u64> = Box::new(|value: Value| {
            value
                .get("total_results")
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    RouterError::Decode("query response has no total_results".to_string())
                })
        });
        self.lazy.enqueue(query_spec(index, query, true)?, decoder, None)
    }

    /// Flush every pending lazy operation in one round trip
    pub async fn execute_all_pending_lazy_operations(&mut self) -> Result<usize, RouterError> {
        self.lazy.flush().await
    }

    pub async fn execute_all_pending_lazy_operations_with(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<usize, RouterError> {
        self.lazy.flush_with(Some(cancel)).await
    }

    pub async fn force<T>(&mut self, handle: &Lazy<T>) -> Result<T, RouterError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.lazy.force(handle).await
    }

    pub fn abandon_pending_lazy_operations(&mut self) -> usize {
        self.lazy.abandon()
    }

    async fn send(&mut self, spec: OperationSpec, kind: OperationKind) -> Result<Value, RouterError> {
        self.eager_requests += 1;
        debug!(session = %self.id, "{}", spec);
        self.router
            .execute_with(&Operation::Single(spec), kind, &ExecuteOptions::default())
            .await?
            .into_value()
    }
}

/// Base that request targets are resolved against; only path and query are kept
const TARGET_BASE: &str = "http://docrouter.invalid/";

fn document_spec(method: Method, id: &str) -> Result<OperationSpec, RouterError> {
    let (path, query) = request_target(&["docs"], &[("id", id)])?;
    Ok(OperationSpec::new(method, path).with_query(query))
}

fn query_spec(index: &str, query: &str, count_only: bool) -> Result<OperationSpec, RouterError> {
    let mut params = vec![("query", query)];
    if count_only {
        params.push(("page_size", "0"));
    }
    let (path, query) = request_target(&["indexes", index], &params)?;
    Ok(OperationSpec::get(path).with_query(query))
}

/// Encoded path and query; `/` inside a segment still separates segments
fn request_target(
    segments: &[&str],
    params: &[(&str, &str)],
) -> Result<(String, String), RouterError> {
    let mut url =
        Url::parse(TARGET_BASE).map_err(|err| RouterError::invalid_operation(err.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| RouterError::invalid_operation("request target cannot carry a path"))?
        .clear()
        .extend(segments.iter().flat_map(|segment| segment.split('/')));
    url.query_pairs_mut().extend_pairs(params);
    Ok((
        url.path().to_string(),
        url.query().unwrap_or_default().to_string(),
    ))
}
