//! A middleware-driven request distributor
//!
//! This crate is the dispatch layer that sits in front of a pool of backend servers.
//! For every inbound HTTP request or protocol upgrade (e.g. a WebSocket handshake) it
//! runs an ordered chain of embedder-supplied decision functions until one of them
//! picks a backend, and then hands the connection plus a gap-free copy of the request
//! body to an external reverse-proxy engine that does the actual byte shuttling.
//!
//! # Features
//!
//! - Four independent middleware chains: plain/upgrade × normal/error, each with a
//!   built-in terminal default (501, 500, close-the-socket)
//! - Single-use continuations: advancing or terminating a chain twice is a loud
//!   programming error, never a silent misroute
//! - Asynchronous decisions with no loss: body chunks streaming in while a decision is
//!   pending are buffered and replayed to the chosen backend exactly once, in order
//! - Error routing: a failed decision falls through to the protocol's error chain,
//!   whose default always terminates the connection one way or another
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use shunt::{Distributor, ErrorDetail, ForwardTarget, HttpExchange, ProxyEngine, UpgradeExchange};
//!
//! /// Stand-in for a real byte-forwarding engine.
//! struct NullProxy;
//!
//! #[async_trait]
//! impl ProxyEngine for NullProxy {
//!     async fn forward_request(&self, exchange: Arc<HttpExchange>, target: ForwardTarget) {
//!         // a real engine connects to `target.backend`, replays `target.body` and
//!         // streams the backend's response back through `exchange`
//!         let _ = (exchange, target);
//!     }
//!
//!     async fn forward_upgrade(&self, exchange: Arc<UpgradeExchange>, target: ForwardTarget) {
//!         let _ = (exchange, target);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let subscriber = tracing_subscriber::FmtSubscriber::builder().with_max_level(tracing::Level::INFO).finish();
//!     tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
//!
//!     let mut distributor = Distributor::with_error_detail(NullProxy, ErrorDetail::Suppress);
//!     distributor
//!         .use_request(|exchange, next| async move {
//!             match exchange.request().host() {
//!                 Some(host) if host.starts_with("a.") => next.select(4001),
//!                 Some(host) if host.starts_with("b.") => next.select((4002, "10.0.0.7")),
//!                 _ => next.advance(),
//!             }
//!         })
//!         .use_request_error(|error, _exchange, next| async move {
//!             tracing::warn!(error = %error, "routing failed");
//!             next.advance(); // fall through to the built-in 500 default
//!         });
//!
//!     let distributor = Arc::new(distributor);
//!     // distributor.serve(source).await — wire up a ConnectionSource over your listener
//!     let _ = distributor;
//! }
//! ```
//!
//! # Architecture
//!
//! The crate is organized into several key modules:
//!
//! - [`distributor`]: The two protocol adapters, the registration surface and the
//!   accept loop over a [`ConnectionSource`]
//! - [`middleware`]: The four chains, their registry and the built-in defaults
//! - [`engine`]: Chain execution and the single-use [`Next`] continuation
//! - [`buffer`]: Body capture while a decision is pending, and its single replay
//! - [`exchange`]: The per-connection subject objects decision functions see
//! - [`proxy`]: The boundary trait of the external byte-forwarding engine
//!
//! # Control flow
//!
//! A connection arrives → the adapter starts buffering its body and runs the protocol's
//! normal chain. Each decision function receives the exchange and a fresh [`Next`]:
//! [`Next::advance`] moves on, [`Next::select`] terminates with a backend,
//! [`Next::fail`] terminates into the error chain. On selection the adapter hands
//! `{backend, buffered body}` to the [`ProxyEngine`]; otherwise the buffer is released
//! once the built-in default has answered the client.
//!
//! # Limitations
//!
//! - No timeouts: a decision function that never fires its held continuation suspends
//!   that connection indefinitely (add timeouts in your middleware if you need them)
//! - No routing policy, load balancing or health checking — that is middleware's job
//! - Chains are set up before traffic; concurrent registration is not supported

pub mod buffer;
pub mod distributor;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod middleware;
pub mod proxy;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{BodyBuffer, BufferedBody};
pub use distributor::{BodyStream, ConnectionSource, Distributor, Inbound};
pub use engine::{Next, RoutingDecision};
pub use error::{DoubleContinuationError, RoutingError};
pub use exchange::{BoxTransport, Exchange, HttpExchange, RequestHead, Responder, Transport, UpgradeExchange};
pub use middleware::ErrorDetail;
pub use proxy::{Backend, ForwardTarget, ProxyEngine, LOOPBACK_HOST};
