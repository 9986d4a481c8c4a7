//! Request-body capture for in-flight routing decisions.
//!
//! A routing decision may suspend for an arbitrary interval while the client is
//! already streaming its request body. [`BodyBuffer`] records every chunk from the
//! moment the connection arrives, independent of whether anyone is reading yet. Once a
//! backend is chosen, [`BodyBuffer::handoff`] turns the record into a [`BufferedBody`]
//! that replays buffered-then-live chunks exactly once, in arrival order. If no backend
//! is chosen, [`BodyBuffer::release`] discards everything.
//!
//! Ownership rules keep the two paths exclusive: `handoff` consumes the buffer by
//! value, so a chunk can reach at most one consumer.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use http_body::{Body, Frame};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Default)]
struct Shared {
    chunks: VecDeque<Bytes>,
    ended: bool,
    released: bool,
    waker: Option<Waker>,
}

impl Shared {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records an inbound body stream while a routing decision is pending.
///
/// Created by the protocol adapter when a connection arrives, owned by that
/// connection's handling path for its whole lifecycle.
pub struct BodyBuffer {
    shared: Arc<Mutex<Shared>>,
    pump: Option<JoinHandle<()>>,
}

impl BodyBuffer {
    /// Starts recording `stream`. The producer is never blocked: chunks are appended
    /// to an in-memory log as fast as they arrive.
    pub fn attach<S>(stream: S) -> Self
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let pump = tokio::spawn(pump(stream, Arc::clone(&shared)));
        Self { shared, pump: Some(pump) }
    }

    /// Stops recording and discards everything captured so far. Chunks still arriving
    /// are dropped at the source. Safe to call any number of times.
    pub fn release(&mut self) {
        self.abort_pump();
        let mut shared = lock(&self.shared);
        if shared.released {
            return;
        }
        debug!(buffered = shared.chunks.len(), "releasing body buffer");
        shared.released = true;
        shared.chunks.clear();
        shared.wake();
    }

    /// Hands the record over to its one consumer. Chunks buffered before this call and
    /// chunks arriving after are delivered alike, in arrival order.
    pub fn handoff(mut self) -> BufferedBody {
        BufferedBody { shared: Arc::clone(&self.shared), pump: self.pump.take() }
    }

    fn abort_pump(&self) {
        if let Some(pump) = &self.pump {
            pump.abort();
        }
    }
}

// a buffer dropped on a panic or cancelled-task path must not leave the pump
// pulling the client's body for a dead connection
impl Drop for BodyBuffer {
    fn drop(&mut self) {
        self.abort_pump();
    }
}

impl std::fmt::Debug for BodyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = lock(&self.shared);
        f.debug_struct("BodyBuffer")
            .field("buffered", &shared.chunks.len())
            .field("ended", &shared.ended)
            .field("released", &shared.released)
            .finish()
    }
}

async fn pump<S>(stream: S, shared: Arc<Mutex<Shared>>)
where
    S: Stream<Item = Bytes> + Send + 'static,
{
    let mut stream = std::pin::pin!(stream);
    while let Some(chunk) = stream.next().await {
        let mut shared = lock(&shared);
        if shared.released {
            return;
        }
        shared.chunks.push_back(chunk);
        shared.wake();
    }

    let mut shared = lock(&shared);
    shared.ended = true;
    shared.wake();
}

/// The single-consumer replay of a captured body stream.
///
/// Yields every chunk exactly once and terminates when the client's stream ended.
/// Handed to the external proxy engine inside a
/// [`ForwardTarget`](crate::proxy::ForwardTarget).
pub struct BufferedBody {
    shared: Arc<Mutex<Shared>>,
    pump: Option<JoinHandle<()>>,
}

impl Drop for BufferedBody {
    fn drop(&mut self) {
        if let Some(pump) = &self.pump {
            pump.abort();
        }
    }
}

impl Body for BufferedBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut shared = lock(&self.shared);

        if let Some(chunk) = shared.chunks.pop_front() {
            return Poll::Ready(Some(Ok(Frame::data(chunk))));
        }
        if shared.ended || shared.released {
            return Poll::Ready(None);
        }

        shared.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn is_end_stream(&self) -> bool {
        let shared = lock(&self.shared);
        shared.chunks.is_empty() && (shared.ended || shared.released)
    }
}

impl std::fmt::Debug for BufferedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = lock(&self.shared);
        f.debug_struct("BufferedBody").field("buffered", &shared.chunks.len()).field("ended", &shared.ended).finish()
    }
}
