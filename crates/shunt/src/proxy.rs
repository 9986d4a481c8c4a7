//! Boundary to the external reverse-proxy engine.
//!
//! The distributor decides *where* a connection goes; an implementation of
//! [`ProxyEngine`] does the actual byte shuttling. The engine receives the original
//! exchange untouched plus a [`ForwardTarget`] naming the backend and carrying the
//! buffered-then-live request body.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::buffer::BufferedBody;
use crate::exchange::{HttpExchange, UpgradeExchange};

/// Default host used when a decision names only a port.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// A chosen backend server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    host: String,
    port: u16,
}

impl Backend {
    /// A backend on the loopback host.
    pub fn new(port: u16) -> Self {
        Self { host: LOOPBACK_HOST.into(), port }
    }

    pub fn with_host(port: u16, host: impl Into<String>) -> Self {
        Self { host: host.into(), port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<u16> for Backend {
    fn from(port: u16) -> Self {
        Self::new(port)
    }
}

impl<S: Into<String>> From<(u16, S)> for Backend {
    fn from((port, host): (u16, S)) -> Self {
        Self::with_host(port, host)
    }
}

/// Everything a forward operation needs besides the exchange itself.
#[derive(Debug)]
pub struct ForwardTarget {
    pub backend: Backend,
    /// Single-consumer replay of the request body: chunks buffered while the decision
    /// was pending first, live chunks after.
    pub body: BufferedBody,
}

/// The external byte-forwarding collaborator.
///
/// Not implemented by this crate. Both operations receive the exchange the middleware
/// chains ran against, so the engine can keep using the same response channel or take
/// the upgrade socket.
#[async_trait]
pub trait ProxyEngine: Send + Sync + 'static {
    /// Forwards a plain request to `target.backend` and streams the backend's response
    /// through the exchange's responder.
    async fn forward_request(&self, exchange: Arc<HttpExchange>, target: ForwardTarget);

    /// Forwards an upgrade: takes the socket from the exchange, replays
    /// `upgrade_head()` plus the buffered body to the backend, then shuttles bytes both
    /// ways.
    async fn forward_upgrade(&self, exchange: Arc<UpgradeExchange>, target: ForwardTarget);
}
