//! # Composable Asynchronous Results
//!
//! [`AsyncResult`] is the promise-like value used to chain and combine stage
//! outcomes. It is ephemeral and in-memory: the persisted record state stays
//! authoritative, while `AsyncResult` carries resolution to registered
//! continuations.
//!
//! Guarantees:
//! - exactly one of success, failure, or cancellation is delivered to each
//!   registered continuation, exactly once
//! - continuations registered after resolution still fire (no missed wakeup)
//! - continuations fire in registration order for a single resolution event
//! - cancellation propagates downstream through composed chains

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::ServiceError;

/// Resolved outcome of an asynchronous unit of work
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    Failure(ServiceError),
    Canceled,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// The success value, if any
    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    /// The failure cause, if any
    pub fn failure(&self) -> Option<&ServiceError> {
        match self {
            Self::Failure(error) => Some(error),
            _ => None,
        }
    }
}

type Continuation<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

struct Inner<T> {
    outcome: Option<Outcome<T>>,
    continuations: Vec<Continuation<T>>,
}

/// A composable future-like value holding either a pending continuation list
/// or a resolved outcome.
///
/// Clones share the same underlying cell; resolving any clone resolves all.
pub struct AsyncResult<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AsyncResult")
            .field("outcome", &inner.outcome)
            .field("continuations", &inner.continuations.len())
            .finish()
    }
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for AsyncResult<T> {
    fn default() -> Self {
        Self::pending()
    }
}

impl<T: Clone + Send + 'static> AsyncResult<T> {
    /// Create an unresolved result
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                outcome: None,
                continuations: Vec::new(),
            })),
        }
    }

    /// Construct an already-successful result
    pub fn new_completed(value: T) -> Self {
        let result = Self::pending();
        result.complete(value);
        result
    }

    /// Construct an already-failed result
    pub fn new_failed(error: ServiceError) -> Self {
        let result = Self::pending();
        result.fail(error);
        result
    }

    /// Construct an already-canceled result
    pub fn new_canceled() -> Self {
        let result = Self::pending();
        result.cancel();
        result
    }

    /// Resolve with a success value. Returns false if already resolved.
    pub fn complete(&self, value: T) -> bool {
        self.resolve(Outcome::Success(value))
    }

    /// Resolve with a failure. Returns false if already resolved.
    pub fn fail(&self, error: ServiceError) -> bool {
        self.resolve(Outcome::Failure(error))
    }

    /// Resolve as canceled. Returns false if already resolved.
    pub fn cancel(&self) -> bool {
        self.resolve(Outcome::Canceled)
    }

    fn resolve(&self, outcome: Outcome<T>) -> bool {
        let pending = {
            let mut inner = self.inner.lock();
            if inner.outcome.is_some() {
                return false;
            }
            inner.outcome = Some(outcome.clone());
            std::mem::take(&mut inner.continuations)
        };

        // Continuations run outside the lock, in registration order.
        for continuation in pending {
            continuation(outcome.clone());
        }
        true
    }

    /// Register a continuation fired exactly once with the resolved outcome.
    ///
    /// If the result is already resolved the continuation fires immediately
    /// on the calling thread.
    pub fn when_resolved(&self, f: impl FnOnce(Outcome<T>) + Send + 'static) {
        let immediate = {
            let mut inner = self.inner.lock();
            match &inner.outcome {
                Some(outcome) => Some((f, outcome.clone())),
                None => {
                    inner.continuations.push(Box::new(f));
                    None
                }
            }
        };

        if let Some((f, outcome)) = immediate {
            f(outcome);
        }
    }

    /// Peek at the outcome without registering a continuation
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.inner.lock().outcome.clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    /// Transform a successful value; failures and cancellation pass through
    pub fn then_apply<U, F>(&self, f: F) -> AsyncResult<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let next = AsyncResult::pending();
        let downstream = next.clone();
        self.when_resolved(move |outcome| match outcome {
            Outcome::Success(value) => {
                downstream.complete(f(value));
            }
            Outcome::Failure(error) => {
                downstream.fail(error);
            }
            Outcome::Canceled => {
                downstream.cancel();
            }
        });
        next
    }

    /// Chain to a dependent result; failures and cancellation short-circuit
    /// and the chained function is never invoked.
    pub fn then_compose<U, F>(&self, f: F) -> AsyncResult<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> AsyncResult<U> + Send + 'static,
    {
        let next = AsyncResult::pending();
        let downstream = next.clone();
        self.when_resolved(move |outcome| match outcome {
            Outcome::Success(value) => {
                let chained = f(value);
                chained.when_resolved(move |inner_outcome| {
                    downstream.resolve(inner_outcome);
                });
            }
            Outcome::Failure(error) => {
                downstream.fail(error);
            }
            Outcome::Canceled => {
                downstream.cancel();
            }
        });
        next
    }

    /// Join N independent results.
    ///
    /// Resolves once all inputs succeed; the first failure or cancellation
    /// wins and settles the joined result immediately, while the remaining
    /// inputs still run to completion on their own.
    pub fn then_combine_all<U, F>(results: Vec<AsyncResult<T>>, combiner: F) -> AsyncResult<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Vec<T>) -> U + Send + 'static,
    {
        let output = AsyncResult::pending();
        let count = results.len();
        if count == 0 {
            output.complete(combiner(Vec::new()));
            return output;
        }

        struct Join<T, F> {
            slots: Vec<Option<T>>,
            remaining: usize,
            combiner: Option<F>,
            settled: bool,
        }

        let join = Arc::new(Mutex::new(Join {
            slots: (0..count).map(|_| None).collect(),
            remaining: count,
            combiner: Some(combiner),
            settled: false,
        }));

        for (index, result) in results.into_iter().enumerate() {
            let join = Arc::clone(&join);
            let output = output.clone();
            result.when_resolved(move |outcome| {
                let mut state = join.lock();
                if state.settled {
                    return;
                }
                match outcome {
                    Outcome::Success(value) => {
                        state.slots[index] = Some(value);
                        state.remaining -= 1;
                        if state.remaining == 0 {
                            state.settled = true;
                            let combiner = state.combiner.take();
                            let values: Vec<T> =
                                state.slots.iter_mut().filter_map(Option::take).collect();
                            drop(state);
                            if let Some(combiner) = combiner {
                                output.complete(combiner(values));
                            }
                        }
                    }
                    Outcome::Failure(error) => {
                        state.settled = true;
                        drop(state);
                        output.fail(error);
                    }
                    Outcome::Canceled => {
                        state.settled = true;
                        drop(state);
                        output.cancel();
                    }
                }
            });
        }

        output
    }

    /// Await resolution of this result
    pub async fn wait(&self) -> Outcome<T> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.when_resolved(move |outcome| {
            let _ = tx.send(outcome);
        });
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Canceled,
        }
    }
}
