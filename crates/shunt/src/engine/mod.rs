//! Chain execution and the single-use continuation.
//!
//! The engine walks a chain one step at a time. Each step gets a fresh [`Next`] bound
//! to it; the step's future is driven to completion first, then the engine waits for
//! the continuation's verdict, which may arrive during the future or long after (a
//! decision function is free to move its `Next` into a spawned task and fire later —
//! there is no timeout).
//!
//! Per step the legal transitions are exactly: `Pending(i)` → `Invoked(i)` →
//! `Pending(i + 1)` on a bare [`Next::advance`], or → terminal on a valued verdict.
//! A continuation that fires twice panics with a [`DoubleContinuationError`]; one whose
//! every handle is dropped unfired can never fire, so the run is abandoned as stalled
//! instead of suspending forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{DoubleContinuationError, RoutingError};
use crate::exchange::{Exchange, RequestHead};
use crate::middleware::{Chain, FaultChain};
use crate::proxy::Backend;

/// Verdict a decision function delivers through its continuation.
#[derive(Debug)]
pub enum RoutingDecision {
    /// No decision yet, run the next function in the chain.
    Proceed,
    /// Terminate the chain and forward to this backend.
    Selected(Backend),
    /// Terminate the chain and fall through to the error chain.
    Failed(RoutingError),
}

/// Terminal result of one chain run.
#[derive(Debug)]
pub(crate) enum Outcome {
    Selected(Backend),
    Failed(RoutingError),
    /// The chain ran out and its terminal default handled the connection.
    Defaulted,
    /// Every handle of the pending continuation was dropped unfired.
    Stalled,
}

/// Request snapshot rendered into the double-invocation panic message.
struct RunDiag {
    url: String,
    headers: String,
}

impl RunDiag {
    fn of(request: &RequestHead) -> Self {
        Self { url: request.uri().to_string(), headers: format!("{:?}", request.headers()) }
    }
}

struct NextState {
    step: usize,
    fired: AtomicBool,
    verdict: Mutex<Option<oneshot::Sender<RoutingDecision>>>,
    diag: Arc<RunDiag>,
}

/// The single-use continuation handed to every decision function.
///
/// Cheap to clone; all clones share the same one-shot verdict slot. Firing after the
/// connection was torn down is a silent no-op, firing twice is a panic.
#[derive(Clone)]
pub struct Next {
    state: Arc<NextState>,
}

impl Next {
    fn bind(step: usize, diag: Arc<RunDiag>) -> (Self, oneshot::Receiver<RoutingDecision>) {
        let (tx, rx) = oneshot::channel();
        (Self { state: Arc::new(NextState { step, fired: AtomicBool::new(false), verdict: Mutex::new(Some(tx)), diag }) }, rx)
    }

    /// No decision: hand control to the next function in the chain.
    pub fn advance(&self) {
        self.fire(RoutingDecision::Proceed);
    }

    /// Terminate the chain with a chosen backend.
    pub fn select(&self, backend: impl Into<Backend>) {
        self.fire(RoutingDecision::Selected(backend.into()));
    }

    /// Terminate the chain and route `error` to the protocol's error chain.
    pub fn fail(&self, error: RoutingError) {
        self.fire(RoutingDecision::Failed(error));
    }

    /// # Panics
    ///
    /// Panics with a [`DoubleContinuationError`] message when this continuation has
    /// already fired, whichever clone fired it.
    fn fire(&self, decision: RoutingDecision) {
        if self.state.fired.swap(true, Ordering::SeqCst) {
            panic!(
                "{}",
                DoubleContinuationError {
                    step: self.state.step,
                    url: self.state.diag.url.clone(),
                    headers: self.state.diag.headers.clone(),
                }
            );
        }

        let sender = self.state.verdict.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = sender {
            // the receiver is gone once the adapter tore the connection down; a late
            // verdict is then a no-op by contract
            let _ = tx.send(decision);
        }
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("step", &self.state.step)
            .field("fired", &self.state.fired.load(Ordering::SeqCst))
            .finish()
    }
}

/// Runs a normal chain to its terminal outcome.
pub(crate) async fn run<X: Exchange>(chain: &Chain<X>, exchange: Arc<X>) -> Outcome {
    let diag = Arc::new(RunDiag::of(exchange.request()));

    for (step, middleware) in chain.stack().iter().enumerate() {
        let (next, verdict) = Next::bind(step, Arc::clone(&diag));
        middleware(Arc::clone(&exchange), next).await;

        match verdict.await {
            Ok(RoutingDecision::Proceed) => trace!(step, "middleware passed"),
            Ok(RoutingDecision::Selected(backend)) => return Outcome::Selected(backend),
            Ok(RoutingDecision::Failed(error)) => return Outcome::Failed(error),
            Err(_) => return stalled(step, &diag),
        }
    }

    let (next, _verdict) = Next::bind(chain.stack().len(), diag);
    (chain.default_fn())(exchange, next).await;
    Outcome::Defaulted
}

/// Runs an error chain, seeded with the error that terminated the normal chain.
///
/// A `Failed` verdict from an error function is not escalated any further: it goes
/// straight to this chain's default handler, which is the final word.
pub(crate) async fn run_fault<X: Exchange>(
    chain: &FaultChain<X>,
    error: Arc<RoutingError>,
    exchange: Arc<X>,
) -> Outcome {
    let diag = Arc::new(RunDiag::of(exchange.request()));

    for (step, middleware) in chain.stack().iter().enumerate() {
        let (next, verdict) = Next::bind(step, Arc::clone(&diag));
        middleware(Arc::clone(&error), Arc::clone(&exchange), next).await;

        match verdict.await {
            Ok(RoutingDecision::Proceed) => trace!(step, "error middleware passed"),
            Ok(RoutingDecision::Selected(backend)) => return Outcome::Selected(backend),
            Ok(RoutingDecision::Failed(followup)) => {
                debug!(step, error = %followup, "error middleware raised a new error");
                let (next, _verdict) = Next::bind(chain.stack().len(), Arc::clone(&diag));
                (chain.default_fn())(Arc::new(followup), exchange, next).await;
                return Outcome::Defaulted;
            }
            Err(_) => return stalled(step, &diag),
        }
    }

    let (next, _verdict) = Next::bind(chain.stack().len(), diag);
    (chain.default_fn())(error, exchange, next).await;
    Outcome::Defaulted
}

fn stalled(step: usize, diag: &RunDiag) -> Outcome {
    warn!(step, url = %diag.url, "continuation dropped without being invoked, abandoning chain");
    Outcome::Stalled
}
