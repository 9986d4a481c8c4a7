//! In-process fixtures shared by the unit tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Request, StatusCode};

use crate::exchange::{HttpExchange, RequestHead, Responder};

#[derive(Debug)]
pub(crate) enum ResponseEvent {
    Head(StatusCode, HeaderMap),
    Chunk(Bytes),
    Finished,
}

/// Shared view of everything a [`RecordingResponder`] was asked to send.
#[derive(Clone)]
pub(crate) struct ResponseLog {
    events: Arc<Mutex<Vec<ResponseEvent>>>,
}

impl ResponseLog {
    fn events(&self) -> MutexGuard<'_, Vec<ResponseEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn status(&self) -> Option<StatusCode> {
        self.events().iter().find_map(|event| match event {
            ResponseEvent::Head(status, _) => Some(*status),
            _ => None,
        })
    }

    pub(crate) fn body(&self) -> Bytes {
        let mut body = BytesMut::new();
        for event in self.events().iter() {
            if let ResponseEvent::Chunk(chunk) = event {
                body.extend_from_slice(chunk);
            }
        }
        body.freeze()
    }

    pub(crate) fn finished(&self) -> bool {
        self.events().iter().any(|event| matches!(event, ResponseEvent::Finished))
    }
}

pub(crate) struct RecordingResponder {
    events: Arc<Mutex<Vec<ResponseEvent>>>,
}

impl Responder for RecordingResponder {
    fn send_head(&mut self, status: StatusCode, headers: HeaderMap) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(ResponseEvent::Head(status, headers));
    }

    fn send_chunk(&mut self, chunk: Bytes) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(ResponseEvent::Chunk(chunk));
    }

    fn finish(&mut self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(ResponseEvent::Finished);
    }
}

pub(crate) fn recording_responder() -> (Box<dyn Responder>, ResponseLog) {
    let events = Arc::new(Mutex::new(Vec::new()));
    (Box::new(RecordingResponder { events: Arc::clone(&events) }), ResponseLog { events })
}

/// A plain-request exchange for `GET /index.html` with the given `Host` header.
pub(crate) fn http_exchange(host: &str) -> (Arc<HttpExchange>, ResponseLog) {
    let head: RequestHead =
        Request::builder().uri("/index.html").header(http::header::HOST, host).body(()).unwrap().into();
    let (responder, log) = recording_responder();
    (Arc::new(HttpExchange::new(head, responder)), log)
}
