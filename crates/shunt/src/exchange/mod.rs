//! Per-connection subject objects handed to decision functions.
//!
//! An exchange bundles everything one inbound connection exposes to the middleware
//! chains: the request head, and either a response channel (plain requests) or the raw
//! socket (protocol upgrades). Exchanges are shared across chain steps behind an `Arc`;
//! the continuation travels separately as an ordinary argument.

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use http::request::Parts;
use http::{HeaderMap, Method, Request, StatusCode, Uri, Version};
use tokio::io::{AsyncRead, AsyncWrite};

/// The head of an inbound request, without its body.
///
/// Wraps a bodyless `http::Request` to give decision functions the fields routing
/// decisions are usually made from: method, URI and headers.
#[derive(Debug)]
pub struct RequestHead {
    inner: Request<()>,
}

impl RequestHead {
    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// The `Host` header as sent by the client, port included if any.
    ///
    /// Returns `None` when the header is absent or not valid UTF-8.
    pub fn host(&self) -> Option<&str> {
        self.headers().get(http::header::HOST).and_then(|value| value.to_str().ok())
    }

    /// Consumes the head and returns the inner `Request<()>`.
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }
}

impl AsRef<Request<()>> for RequestHead {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl From<Parts> for RequestHead {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

impl From<Request<()>> for RequestHead {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}

/// Response channel of a plain request.
///
/// Implemented by the embedder over whatever connection machinery feeds the
/// distributor. The external proxy engine streams the chosen backend's response through
/// the same object.
pub trait Responder: Send + 'static {
    /// Writes the status line and headers. Called at most once.
    fn send_head(&mut self, status: StatusCode, headers: HeaderMap);

    /// Writes one body chunk.
    fn send_chunk(&mut self, chunk: Bytes);

    /// Marks the response complete.
    fn finish(&mut self);
}

/// The raw byte stream of an upgrade request.
///
/// Blanket-implemented for anything duplex; the distributor itself only ever shuts a
/// transport down, the external proxy engine does the actual shuttling.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxTransport = Box<dyn Transport>;

/// Common view over both exchange flavors, used by the execution engine for
/// diagnostics.
pub trait Exchange: Send + Sync + 'static {
    fn request(&self) -> &RequestHead;
}

/// Subjects of a plain request: the request head plus its response channel.
pub struct HttpExchange {
    request: RequestHead,
    responder: Mutex<Box<dyn Responder>>,
}

impl HttpExchange {
    pub fn new(request: RequestHead, responder: Box<dyn Responder>) -> Self {
        Self { request, responder: Mutex::new(responder) }
    }

    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    pub fn send_head(&self, status: StatusCode, headers: HeaderMap) {
        self.responder().send_head(status, headers);
    }

    pub fn send_chunk(&self, chunk: Bytes) {
        self.responder().send_chunk(chunk);
    }

    pub fn finish(&self) {
        self.responder().finish();
    }

    fn responder(&self) -> MutexGuard<'_, Box<dyn Responder>> {
        self.responder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Exchange for HttpExchange {
    fn request(&self) -> &RequestHead {
        &self.request
    }
}

impl std::fmt::Debug for HttpExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpExchange").field("request", &self.request).finish_non_exhaustive()
    }
}

/// Subjects of an upgrade request: the request head, the not-yet-switched socket and
/// any bytes the client already sent after its handshake.
pub struct UpgradeExchange {
    request: RequestHead,
    socket: Mutex<Option<BoxTransport>>,
    upgrade_head: Bytes,
}

impl UpgradeExchange {
    pub fn new(request: RequestHead, socket: BoxTransport, upgrade_head: Bytes) -> Self {
        Self { request, socket: Mutex::new(Some(socket)), upgrade_head }
    }

    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    /// Bytes received after the upgrade request head, to be replayed to the backend.
    pub fn upgrade_head(&self) -> &Bytes {
        &self.upgrade_head
    }

    /// Takes ownership of the socket. Whoever takes it is responsible for it; every
    /// later call returns `None`.
    pub fn take_socket(&self) -> Option<BoxTransport> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl Exchange for UpgradeExchange {
    fn request(&self) -> &RequestHead {
        &self.request
    }
}

impl std::fmt::Debug for UpgradeExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let taken = self.socket.lock().unwrap_or_else(PoisonError::into_inner).is_none();
        f.debug_struct("UpgradeExchange")
            .field("request", &self.request)
            .field("socket_taken", &taken)
            .field("upgrade_head", &self.upgrade_head.len())
            .finish()
    }
}
