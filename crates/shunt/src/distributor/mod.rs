//! The protocol adapters and the embedder-facing registration surface.
//!
//! A [`Distributor`] owns the four middleware chains and the external proxy engine.
//! For every inbound connection it starts body capture, runs the matching normal
//! chain, and acts on the outcome: a selected backend gets the connection plus the
//! buffered body handed to the proxy engine, an error falls through to the error
//! chain, and everything else ends with the buffer released (the built-in defaults
//! have already answered the client by then).
//!
//! Registration happens before traffic: the `use_*` methods take `&mut self`, while
//! serving takes an `Arc`, so the chains are immutable once connections flow.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tracing::{debug, info};

use crate::buffer::BodyBuffer;
use crate::engine::{self, Next, Outcome};
use crate::error::RoutingError;
use crate::exchange::{BoxTransport, HttpExchange, RequestHead, Responder, UpgradeExchange};
use crate::middleware::{ErrorDetail, Registry};
use crate::proxy::{ForwardTarget, ProxyEngine};

/// Inbound body chunks as delivered by the connection source.
pub type BodyStream = Pin<Box<dyn Stream<Item = Bytes> + Send + 'static>>;

/// One accepted connection, already split into the two protocol flavors.
pub enum Inbound {
    Request { request: RequestHead, body: BodyStream, responder: Box<dyn Responder> },
    Upgrade { request: RequestHead, body: BodyStream, socket: BoxTransport, upgrade_head: Bytes },
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request { request, .. } => f.debug_struct("Inbound::Request").field("request", request).finish_non_exhaustive(),
            Self::Upgrade { request, .. } => f.debug_struct("Inbound::Upgrade").field("request", request).finish_non_exhaustive(),
        }
    }
}

/// Where connections come from.
///
/// Implemented by the embedder over its listener/parser of choice; the distributor
/// deliberately does not inherit from any connection machinery, it is wired to one at
/// [`Distributor::serve`] time.
#[async_trait]
pub trait ConnectionSource: Send {
    /// The next inbound connection, or `None` once the source is exhausted.
    async fn accept(&mut self) -> Option<Inbound>;
}

/// The middleware dispatch engine in front of a backend pool.
pub struct Distributor<P> {
    registry: Registry,
    proxy: P,
}

impl<P: ProxyEngine> Distributor<P> {
    /// A distributor with error detail taken from the environment
    /// ([`ErrorDetail::from_env`]).
    pub fn new(proxy: P) -> Self {
        Self::with_error_detail(proxy, ErrorDetail::from_env())
    }

    pub fn with_error_detail(proxy: P, detail: ErrorDetail) -> Self {
        Self { registry: Registry::new(detail), proxy }
    }

    /// The wrapped proxy engine.
    pub fn proxy(&self) -> &P {
        &self.proxy
    }

    /// Appends a decision function to the plain-request chain, in front of the
    /// built-in 501 default. Chainable.
    pub fn use_request<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Arc<HttpExchange>, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.registry.http.register(Box::new(move |exchange, next| Box::pin(f(exchange, next))));
        self
    }

    /// Appends an error decision function to the plain-request error chain, in front
    /// of the built-in 500 default. Chainable.
    pub fn use_request_error<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Arc<RoutingError>, Arc<HttpExchange>, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.registry.http_fault.register(Box::new(move |error, exchange, next| Box::pin(f(error, exchange, next))));
        self
    }

    /// Appends a decision function to the upgrade chain, in front of the built-in
    /// close-the-socket default. Chainable.
    pub fn use_upgrade<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Arc<UpgradeExchange>, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.registry.upgrade.register(Box::new(move |exchange, next| Box::pin(f(exchange, next))));
        self
    }

    /// Appends an error decision function to the upgrade error chain. Chainable.
    pub fn use_upgrade_error<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Arc<RoutingError>, Arc<UpgradeExchange>, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.registry.upgrade_fault.register(Box::new(move |error, exchange, next| Box::pin(f(error, exchange, next))));
        self
    }

    /// Accept-loop over a connection source, one task per connection.
    pub async fn serve<S: ConnectionSource>(self: Arc<Self>, mut source: S) {
        while let Some(inbound) = source.accept().await {
            let distributor = Arc::clone(&self);
            tokio::spawn(async move { distributor.dispatch(inbound).await });
        }
        info!("connection source exhausted, distributor stopping");
    }

    pub async fn dispatch(&self, inbound: Inbound) {
        match inbound {
            Inbound::Request { request, body, responder } => self.handle_request(request, body, responder).await,
            Inbound::Upgrade { request, body, socket, upgrade_head } => {
                self.handle_upgrade(request, body, socket, upgrade_head).await;
            }
        }
    }

    /// The plain-request adapter: buffer, run the chain, act on the outcome.
    pub async fn handle_request(&self, request: RequestHead, body: BodyStream, responder: Box<dyn Responder>) {
        let mut buffer = BodyBuffer::attach(body);
        let exchange = Arc::new(HttpExchange::new(request, responder));

        match engine::run(&self.registry.http, Arc::clone(&exchange)).await {
            Outcome::Selected(backend) => {
                debug!(backend = %backend, "proxying http request");
                self.proxy.forward_request(exchange, ForwardTarget { backend, body: buffer.handoff() }).await;
            }
            Outcome::Failed(error) => {
                debug!(error = %error, "running error middleware for http request");
                match engine::run_fault(&self.registry.http_fault, Arc::new(error), Arc::clone(&exchange)).await {
                    Outcome::Selected(backend) => {
                        debug!(backend = %backend, "error middleware recovered, proxying http request");
                        self.proxy.forward_request(exchange, ForwardTarget { backend, body: buffer.handoff() }).await;
                    }
                    _ => buffer.release(),
                }
            }
            Outcome::Defaulted | Outcome::Stalled => buffer.release(),
        }
    }

    /// The upgrade adapter: same shape, with the socket as the second subject.
    pub async fn handle_upgrade(
        &self,
        request: RequestHead,
        body: BodyStream,
        socket: BoxTransport,
        upgrade_head: Bytes,
    ) {
        let mut buffer = BodyBuffer::attach(body);
        let exchange = Arc::new(UpgradeExchange::new(request, socket, upgrade_head));

        match engine::run(&self.registry.upgrade, Arc::clone(&exchange)).await {
            Outcome::Selected(backend) => {
                debug!(backend = %backend, "proxying upgrade request");
                self.proxy.forward_upgrade(exchange, ForwardTarget { backend, body: buffer.handoff() }).await;
            }
            Outcome::Failed(error) => {
                debug!(error = %error, "running error middleware for upgrade request");
                match engine::run_fault(&self.registry.upgrade_fault, Arc::new(error), Arc::clone(&exchange)).await {
                    Outcome::Selected(backend) => {
                        debug!(backend = %backend, "error middleware recovered, proxying upgrade request");
                        self.proxy.forward_upgrade(exchange, ForwardTarget { backend, body: buffer.handoff() }).await;
                    }
                    _ => buffer.release(),
                }
            }
            Outcome::Defaulted | Outcome::Stalled => buffer.release(),
        }
    }
}

impl<P> std::fmt::Debug for Distributor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor")
            .field("http_chain", &self.registry.http.len())
            .field("upgrade_chain", &self.registry.upgrade.len())
            .finish_non_exhaustive()
    }
}
