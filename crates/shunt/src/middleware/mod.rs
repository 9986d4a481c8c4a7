//! Middleware chains and their registry.
//!
//! Four independent chains exist, one per {protocol} × {kind} pair: plain requests and
//! upgrades each have a normal chain and an error chain. A chain is an append-only
//! stack of boxed decision functions plus a built-in terminal default that is always
//! last: registration inserts in front of it, and nothing can remove or reorder it. An
//! embedder shadows a default only by terminating earlier.
//!
//! Chains are owned by one registry per distributor; there is no process-wide state.
//! Registration is a setup-time operation, before traffic starts.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::engine::Next;
use crate::error::RoutingError;
use crate::exchange::{HttpExchange, UpgradeExchange};

/// Environment variable consulted by [`ErrorDetail::from_env`].
pub const ENV_MODE: &str = "SHUNT_ENV";

pub type MiddlewareFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A normal decision function: subjects plus its single-use continuation.
pub(crate) type StepFn<X> = Box<dyn Fn(Arc<X>, Next) -> MiddlewareFuture + Send + Sync>;

/// An error decision function: the routed error, subjects, continuation.
pub(crate) type FaultFn<X> = Box<dyn Fn(Arc<RoutingError>, Arc<X>, Next) -> MiddlewareFuture + Send + Sync>;

/// Whether the default error middleware exposes diagnostic detail in 500 bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDetail {
    Expose,
    Suppress,
}

impl ErrorDetail {
    /// `Expose` when `SHUNT_ENV=development`, `Suppress` otherwise.
    pub fn from_env() -> Self {
        if std::env::var(ENV_MODE).is_ok_and(|mode| mode == "development") { Self::Expose } else { Self::Suppress }
    }
}

/// An ordered stack of normal decision functions with its terminal default.
pub(crate) struct Chain<X> {
    stack: Vec<StepFn<X>>,
    default: StepFn<X>,
}

impl<X> Chain<X> {
    fn new(default: StepFn<X>) -> Self {
        Self { stack: Vec::new(), default }
    }

    /// Appends `f` in front of the terminal default.
    pub(crate) fn register(&mut self, f: StepFn<X>) {
        self.stack.push(f);
    }

    pub(crate) fn stack(&self) -> &[StepFn<X>] {
        &self.stack
    }

    pub(crate) fn default_fn(&self) -> &StepFn<X> {
        &self.default
    }

    /// Registered functions plus the default.
    pub(crate) fn len(&self) -> usize {
        self.stack.len() + 1
    }
}

/// Same shape as [`Chain`], for error decision functions.
pub(crate) struct FaultChain<X> {
    stack: Vec<FaultFn<X>>,
    default: FaultFn<X>,
}

impl<X> FaultChain<X> {
    fn new(default: FaultFn<X>) -> Self {
        Self { stack: Vec::new(), default }
    }

    pub(crate) fn register(&mut self, f: FaultFn<X>) {
        self.stack.push(f);
    }

    pub(crate) fn stack(&self) -> &[FaultFn<X>] {
        &self.stack
    }

    pub(crate) fn default_fn(&self) -> &FaultFn<X> {
        &self.default
    }

    pub(crate) fn len(&self) -> usize {
        self.stack.len() + 1
    }
}

/// The four chains of one distributor.
pub(crate) struct Registry {
    pub(crate) http: Chain<HttpExchange>,
    pub(crate) http_fault: FaultChain<HttpExchange>,
    pub(crate) upgrade: Chain<UpgradeExchange>,
    pub(crate) upgrade_fault: FaultChain<UpgradeExchange>,
}

impl Registry {
    pub(crate) fn new(detail: ErrorDetail) -> Self {
        Self {
            http: Chain::new(default_http()),
            http_fault: FaultChain::new(default_http_fault(detail)),
            upgrade: Chain::new(default_upgrade()),
            upgrade_fault: FaultChain::new(default_upgrade_fault()),
        }
    }
}

/// Nothing matched a plain request: 501, empty body.
fn default_http() -> StepFn<HttpExchange> {
    Box::new(|exchange, _next| {
        Box::pin(async move {
            debug!("executing default request middleware");
            exchange.send_head(StatusCode::NOT_IMPLEMENTED, HeaderMap::new());
            exchange.finish();
        })
    })
}

/// Nothing recovered an errored plain request: 500, detail gated by [`ErrorDetail`].
fn default_http_fault(detail: ErrorDetail) -> FaultFn<HttpExchange> {
    Box::new(move |error, exchange, _next| {
        Box::pin(async move {
            debug!("executing default request error middleware");
            match detail {
                ErrorDetail::Expose => {
                    let body = Bytes::from(error.detail());
                    let mut headers = HeaderMap::new();
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
                    exchange.send_head(StatusCode::INTERNAL_SERVER_ERROR, headers);
                    exchange.send_chunk(body);
                }
                ErrorDetail::Suppress => {
                    exchange.send_head(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new());
                }
            }
            exchange.finish();
        })
    })
}

/// Nothing matched an upgrade: close the socket without a handshake.
fn default_upgrade() -> StepFn<UpgradeExchange> {
    Box::new(|exchange, _next| {
        Box::pin(async move {
            debug!("executing default upgrade middleware");
            shutdown_socket(&exchange).await;
        })
    })
}

/// Nothing recovered an errored upgrade: close the socket without a handshake.
fn default_upgrade_fault() -> FaultFn<UpgradeExchange> {
    Box::new(|_error, exchange, _next| {
        Box::pin(async move {
            debug!("executing default upgrade error middleware");
            shutdown_socket(&exchange).await;
        })
    })
}

async fn shutdown_socket(exchange: &UpgradeExchange) {
    if let Some(mut socket) = exchange.take_socket() {
        let _ = socket.shutdown().await;
    }
}
