//! Deferred read operations collapsed into one composite request.
//!
//! A [`LazyBatchQueue`] belongs to a single unit of work. Mutation takes
//! `&mut self`, so enqueueing and flushing from several tasks at once is
//! ruled out by the borrow checker rather than by a lock.

use crate::executor::{ExecuteOptions, OperationKind, RequestExecutor};
use docrouter_core::codec::check_cardinality;
use docrouter_core::{IdAllocator, Operation, OperationId, OperationSpec, Reply, RouterError};
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Turns one raw result slot into a typed value
pub type Decoder<T> = Box<dyn FnOnce(Value) -> Result<T, RouterError> + Send>;

/// Runs once with the decoded value; an error fails only its own slot
pub type OnEval<T> = Box<dyn FnOnce(&T) -> anyhow::Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LazyState {
    Queued,
    Flushing,
    Fulfilled,
    Failed,
}

impl LazyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LazyState::Queued,
            1 => LazyState::Flushing,
            2 => LazyState::Fulfilled,
            _ => LazyState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LazyState::Fulfilled | LazyState::Failed)
    }
}

/// Single-assignment result cell shared between a handle and its pending operation
#[derive(Debug)]
struct LazyCell<T> {
    state: AtomicU8,
    value: OnceLock<Result<T, RouterError>>,
}

impl<T> LazyCell<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(LazyState::Queued as u8),
            value: OnceLock::new(),
        }
    }

    fn mark_flushing(&self) {
        let _ = self.state.compare_exchange(
            LazyState::Queued as u8,
            LazyState::Flushing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn resolve(&self, result: Result<T, RouterError>) {
        let terminal = if result.is_ok() {
            LazyState::Fulfilled
        } else {
            LazyState::Failed
        };
        if self.value.set(result).is_ok() {
            self.state.store(terminal as u8, Ordering::SeqCst);
        }
    }
}

/// What a not-found error slot resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingSlot {
    /// Fail the handle with [`RouterError::BatchItem`]
    #[default]
    Fail,
    /// Hand `null` to the decoder, as a lookup of an absent document
    Null,
}

/// Caller-visible handle to a deferred value
#[derive(Debug)]
pub struct Lazy<T> {
    id: OperationId,
    cell: Arc<LazyCell<T>>,
}

impl<T> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Lazy<T> {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn state(&self) -> LazyState {
        LazyState::from_u8(self.cell.state.load(Ordering::SeqCst))
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.value.get().is_some()
    }

    /// Resolved outcome without triggering a flush
    pub fn peek(&self) -> Option<&Result<T, RouterError>> {
        self.cell.value.get()
    }
}

/// Type-erased completion side of a pending operation
trait Fulfillment: Send {
    fn mark_flushing(&self);
    fn complete(self: Box<Self>, index: usize, raw: Result<Value, RouterError>);
    fn fail(self: Box<Self>, err: RouterError);
}

struct TypedFulfillment<T> {
    cell: Arc<LazyCell<T>>,
    decoder: Decoder<T>,
    on_eval: Option<OnEval<T>>,
}

impl<T: Send + Sync + 'static> Fulfillment for TypedFulfillment<T> {
    fn mark_flushing(&self) {
        self.cell.mark_flushing();
    }

    fn complete(self: Box<Self>, index: usize, raw: Result<Value, RouterError>) {
        let TypedFulfillment {
            cell,
            decoder,
            on_eval,
        } = *self;

        let result = raw
            .and_then(|value| {
                decoder(value).map_err(|err| match err {
                    RouterError::BatchItem { .. } => err,
                    other => RouterError::batch_item(index, other.to_string()),
                })
            })
            .and_then(|decoded| match on_eval {
                Some(callback) => callback(&decoded).map(|()| decoded).map_err(|err| {
                    RouterError::batch_item(index, format!("on_eval callback failed: {err}"))
                }),
                None => Ok(decoded),
            });

        cell.resolve(result);
    }

    fn fail(self: Box<Self>, err: RouterError) {
        self.cell.resolve(Err(err));
    }
}

/// Queued descriptor plus the means to resolve its handle.
///
/// Dropping it unresolved resolves the handle to [`RouterError::Cancelled`].
struct PendingLazyOperation {
    id: OperationId,
    spec: OperationSpec,
    missing: MissingSlot,
    fulfillment: Option<Box<dyn Fulfillment>>,
}

impl PendingLazyOperation {
    fn mark_flushing(&self) {
        if let Some(fulfillment) = &self.fulfillment {
            fulfillment.mark_flushing();
        }
    }

    fn complete(mut self, index: usize, raw: Result<Value, RouterError>) {
        if let Some(fulfillment) = self.fulfillment.take() {
            fulfillment.complete(index, raw);
        }
    }

    fn fail(mut self, err: RouterError) {
        if let Some(fulfillment) = self.fulfillment.take() {
            fulfillment.fail(err);
        }
    }
}

impl Drop for PendingLazyOperation {
    fn drop(&mut self) {
        if let Some(fulfillment) = self.fulfillment.take() {
            debug!(operation = %self.id, "Pending lazy operation dropped unresolved");
            fulfillment.fail(RouterError::Cancelled);
        }
    }
}

/// Accumulates lazy reads for one session and flushes them as one batch
pub struct LazyBatchQueue {
    executor: Arc<RequestExecutor>,
    pending: Vec<PendingLazyOperation>,
    ids: IdAllocator,
    cycle: u64,
    flushes: u64,
}

impl std::fmt::Debug for LazyBatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyBatchQueue")
            .field("pending", &self.pending.len())
            .field("cycle", &self.cycle)
            .field("flushes", &self.flushes)
            .finish()
    }
}

impl LazyBatchQueue {
    pub fn new(executor: Arc<RequestExecutor>) -> Self {
        Self {
            executor,
            pending: Vec::new(),
            ids: IdAllocator::new(),
            cycle: 0,
            flushes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Accumulation cycle, bumped by every flush that dispatches
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Composite requests dispatched by this queue
    pub fn flush_count(&self) -> u64 {
        self.flushes
    }

    /// Record a read for the next flush. No I/O happens here.
    pub fn enqueue<T>(
        &mut self,
        spec: OperationSpec,
        decoder: Decoder<T>,
        on_eval: Option<OnEval<T>>,
    ) -> Result<Lazy<T>, RouterError>
    where
        T: Send + Sync + 'static,
    {
        self.enqueue_with(spec, MissingSlot::Fail, decoder, on_eval)
    }

    /// [`LazyBatchQueue::enqueue`] choosing how a not-found slot resolves
    pub fn enqueue_with<T>(
        &mut self,
        spec: OperationSpec,
        missing: MissingSlot,
        decoder: Decoder<T>,
        on_eval: Option<OnEval<T>>,
    ) -> Result<Lazy<T>, RouterError>
    where
        T: Send + Sync + 'static,
    {
        if !spec.is_read_only() {
            return Err(RouterError::invalid_operation(format!(
                "lazy operations must be read-only, got {}",
                spec
            )));
        }

        let id = self.ids.next_operation_id();
        let cell = Arc::new(LazyCell::new());
        self.pending.push(PendingLazyOperation {
            id,
            spec,
            missing,
            fulfillment: Some(Box::new(TypedFulfillment {
                cell: Arc::clone(&cell),
                decoder,
                on_eval,
            })),
        });

        debug!(operation = %id, queued = self.pending.len(), "Enqueued lazy operation");
        Ok(Lazy { id, cell })
    }

    /// Value of `handle`, flushing the queue first if it is still pending.
    ///
    /// Already-resolved handles return their cached outcome with no I/O.
    pub async fn force<T>(&mut self, handle: &Lazy<T>) -> Result<T, RouterError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.force_with(handle, None).await
    }

    pub async fn force_with<T>(
        &mut self,
        handle: &Lazy<T>,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, RouterError>
    where
        T: Clone + Send + Sync + 'static,
    {
        if let Some(result) = handle.peek() {
            return result.clone();
        }
        if !self.pending.iter().any(|op| op.id == handle.id) {
            return Err(RouterError::invalid_operation(format!(
                "lazy operation {} is not pending in this queue",
                handle.id
            )));
        }

        let flushed = self.flush_with(cancel).await;
        match handle.peek() {
            Some(result) => result.clone(),
            // cancelled before dispatch; the handle is still queued
            None => Err(flushed.err().unwrap_or(RouterError::Cancelled)),
        }
    }

    pub async fn flush(&mut self) -> Result<usize, RouterError> {
        self.flush_with(None).await
    }

    /// Send every queued operation as one composite read and resolve each handle.
    ///
    /// Returns the number of operations flushed. A batch-level failure resolves
    /// every handle in the batch to that failure and is also returned here.
    pub async fn flush_with(
        &mut self,
        cancel: Option<&CancellationToken>,
    ) -> Result<usize, RouterError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(RouterError::Cancelled);
        }

        let batch = std::mem::take(&mut self.pending);
        self.cycle += 1;
        self.flushes += 1;
        for op in &batch {
            op.mark_flushing();
        }

        let items: Vec<OperationSpec> = batch.iter().map(|op| op.spec.clone()).collect();
        let count = items.len();
        debug!(cycle = self.cycle, count, "Flushing lazy operations");

        let options = ExecuteOptions {
            policy: None,
            cancel: cancel.cloned(),
        };
        let outcome = self
            .executor
            .execute_with(&Operation::Batch(items), OperationKind::Read, &options)
            .await
            .and_then(Reply::into_batch)
            .and_then(|slots| check_cardinality(&slots, count).map(|()| slots));

        match outcome {
            Ok(slots) => {
                for (index, (op, slot)) in batch.into_iter().zip(slots).enumerate() {
                    let raw = match op.missing {
                        MissingSlot::Null if slot.is_not_found() => Ok(Value::Null),
                        _ => slot.into_result(index),
                    };
                    op.complete(index, raw);
                }
                Ok(count)
            }
            Err(err) => {
                warn!(cycle = self.cycle, count, "Lazy batch failed: {}", err);
                for op in batch {
                    op.fail(err.clone());
                }
                Err(err)
            }
        }
    }

    /// Resolve every queued handle to [`RouterError::Abandoned`] without I/O
    pub fn abandon(&mut self) -> usize {
        let abandoned = self.pending.len();
        for op in self.pending.drain(..) {
            op.fail(RouterError::Abandoned);
        }
        if abandoned > 0 {
            debug!(abandoned, "Abandoned pending lazy operations");
        }
        abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending<T: Send + Sync + 'static>(
        id: u64,
        decoder: Decoder<T>,
        on_eval: Option<OnEval<T>>,
    ) -> (PendingLazyOperation, Lazy<T>) {
        let id = OperationId::new(id);
        let cell = Arc::new(LazyCell::new());
        let op = PendingLazyOperation {
            id,
            spec: OperationSpec::get("/docs").with_query("id=users/1"),
            missing: MissingSlot::Fail,
            fulfillment: Some(Box::new(TypedFulfillment {
                cell: Arc::clone(&cell),
                decoder,
                on_eval,
            })),
        };
        (op, Lazy { id, cell })
    }

    fn as_i64() -> Decoder<i64> {
        Box::new(|value: Value| {
            value
                .as_i64()
                .ok_or_else(|| RouterError::Decode(format!("not a number: {value}")))
        })
    }

    #[test]
    fn test_complete_decodes_value() {
        let (op, handle) = pending(1, as_i64(), None);
        assert_eq!(handle.state(), LazyState::Queued);

        op.mark_flushing();
        assert_eq!(handle.state(), LazyState::Flushing);

        op.complete(0, Ok(json!(42)));
        assert_eq!(handle.state(), LazyState::Fulfilled);
        assert_eq!(handle.peek().unwrap().as_ref().unwrap(), &42);
    }

    #[test]
    fn test_decode_failure_is_batch_item() {
        let (op, handle) = pending(1, as_i64(), None);
        op.complete(3, Ok(json!("nope")));

        assert_eq!(handle.state(), LazyState::Failed);
        match handle.peek().unwrap() {
            Err(RouterError::BatchItem { index, .. }) => assert_eq!(*index, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_on_eval_runs_once_and_can_fail_its_slot() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (op, handle) = pending(
            1,
            as_i64(),
            Some(Box::new(move |value: &i64| {
                sink.lock().unwrap().push(*value);
                Ok(())
            })),
        );
        op.complete(0, Ok(json!(7)));
        assert_eq!(*seen.lock().unwrap(), vec![7]);
        assert!(handle.peek().unwrap().is_ok());

        let (op, handle) = pending(
            2,
            as_i64(),
            Some(Box::new(|_: &i64| Err(anyhow::anyhow!("rejected")))),
        );
        op.complete(1, Ok(json!(7)));
        assert!(matches!(
            handle.peek().unwrap(),
            Err(RouterError::BatchItem { index: 1, .. })
        ));
    }

    #[test]
    fn test_dropped_operation_resolves_cancelled() {
        let (op, handle) = pending(1, as_i64(), None);
        drop(op);
        assert_eq!(handle.state(), LazyState::Failed);
        assert!(matches!(handle.peek(), Some(Err(RouterError::Cancelled))));
    }

    #[test]
    fn test_first_resolution_wins() {
        let (op, handle) = pending(1, as_i64(), None);
        op.fail(RouterError::Abandoned);

        handle.cell.resolve(Ok(5));
        assert!(matches!(handle.peek(), Some(Err(RouterError::Abandoned))));
        assert_eq!(handle.state(), LazyState::Failed);
    }

    #[test]
    fn test_handle_clones_share_cell() {
        let (op, handle) = pending(9, as_i64(), None);
        let copy = handle.clone();
        op.complete(0, Ok(json!(1)));
        assert!(copy.is_resolved());
        assert_eq!(copy.id(), OperationId::new(9));
        assert!(copy.state().is_terminal());
    }
}
