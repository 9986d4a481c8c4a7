//! End-to-end dispatch scenarios through the public API only.
//!
//! The proxy engine double here behaves like a tiny in-process backend pool: it
//! consumes the handed-off body, records what each "backend" received, and answers
//! through the exchange with a canned per-port response body.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::channel::mpsc;
use http::{HeaderMap, Request, StatusCode};
use http_body_util::BodyExt;

use shunt::{
    Backend, BodyStream, Distributor, ErrorDetail, ForwardTarget, HttpExchange, ProxyEngine, RequestHead, Responder,
    RoutingError, UpgradeExchange,
};

#[derive(Debug, Default)]
struct Response {
    status: Option<StatusCode>,
    body: BytesMut,
    finished: bool,
}

#[derive(Clone, Default)]
struct ResponseLog(Arc<Mutex<Response>>);

impl ResponseLog {
    fn snapshot(&self) -> (Option<StatusCode>, Bytes, bool) {
        let response = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        (response.status, Bytes::copy_from_slice(&response.body), response.finished)
    }
}

struct LogResponder(ResponseLog);

impl Responder for LogResponder {
    fn send_head(&mut self, status: StatusCode, _headers: HeaderMap) {
        self.0 .0.lock().unwrap_or_else(PoisonError::into_inner).status = Some(status);
    }

    fn send_chunk(&mut self, chunk: Bytes) {
        self.0 .0.lock().unwrap_or_else(PoisonError::into_inner).body.extend_from_slice(&chunk);
    }

    fn finish(&mut self) {
        self.0 .0.lock().unwrap_or_else(PoisonError::into_inner).finished = true;
    }
}

fn responder() -> (Box<dyn Responder>, ResponseLog) {
    let log = ResponseLog::default();
    (Box::new(LogResponder(log.clone())), log)
}

/// In-process backend pool: port → canned response body.
struct BackendPool {
    answers: HashMap<u16, &'static str>,
    received: Mutex<Vec<(Backend, Bytes)>>,
}

impl BackendPool {
    fn new(answers: &[(u16, &'static str)]) -> Self {
        Self { answers: answers.iter().copied().collect(), received: Mutex::new(Vec::new()) }
    }

    fn received(&self) -> Vec<(Backend, Bytes)> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ProxyEngine for BackendPool {
    async fn forward_request(&self, exchange: Arc<HttpExchange>, target: ForwardTarget) {
        let body = target.body.collect().await.expect("buffered body never fails").to_bytes();
        let answer = self.answers.get(&target.backend.port()).copied().unwrap_or("");
        self.received.lock().unwrap_or_else(PoisonError::into_inner).push((target.backend, body));

        exchange.send_head(StatusCode::OK, HeaderMap::new());
        exchange.send_chunk(Bytes::from_static(answer.as_bytes()));
        exchange.finish();
    }

    async fn forward_upgrade(&self, exchange: Arc<UpgradeExchange>, target: ForwardTarget) {
        let mut replay = BytesMut::from(&exchange.upgrade_head()[..]);
        replay.extend_from_slice(&target.body.collect().await.expect("buffered body never fails").to_bytes());
        self.received.lock().unwrap_or_else(PoisonError::into_inner).push((target.backend, replay.freeze()));
    }
}

fn head(host: &str) -> RequestHead {
    Request::builder().uri("/index.html").header(http::header::HOST, host).body(()).unwrap().into()
}

fn empty_body() -> BodyStream {
    Box::pin(futures::stream::empty())
}

fn subdomain_router(pool: BackendPool) -> Distributor<BackendPool> {
    let mut distributor = Distributor::with_error_detail(pool, ErrorDetail::Suppress);
    distributor
        .use_request(|exchange, next| async move {
            if exchange.request().host().is_some_and(|host| host.starts_with("a.")) {
                next.select(4001);
            } else {
                next.advance();
            }
        })
        .use_request(|exchange, next| async move {
            if exchange.request().host().is_some_and(|host| host.starts_with("b.")) {
                next.select(4002);
            } else {
                next.advance();
            }
        });
    distributor
}

#[tokio::test]
async fn routes_each_host_to_its_backend() {
    let distributor = subdomain_router(BackendPool::new(&[(4001, "a"), (4002, "b")]));

    let (first, first_log) = responder();
    distributor.handle_request(head("a.example"), empty_body(), first).await;
    let (second, second_log) = responder();
    distributor.handle_request(head("b.example"), empty_body(), second).await;

    assert_eq!(first_log.snapshot(), (Some(StatusCode::OK), Bytes::from_static(b"a"), true));
    assert_eq!(second_log.snapshot(), (Some(StatusCode::OK), Bytes::from_static(b"b"), true));
}

#[tokio::test]
async fn unmatched_host_gets_501() {
    let distributor = subdomain_router(BackendPool::new(&[(4001, "a"), (4002, "b")]));

    let (responder, log) = responder();
    distributor.handle_request(head("c.example"), empty_body(), responder).await;

    let (status, body, finished) = log.snapshot();
    assert_eq!(status, Some(StatusCode::NOT_IMPLEMENTED));
    assert_eq!(body, Bytes::new());
    assert!(finished);
    assert!(distributor.proxy().received().is_empty());
}

#[tokio::test]
async fn chunked_body_survives_a_delayed_decision() {
    let pool = BackendPool::new(&[(4001, "ok")]);
    let mut distributor = Distributor::with_error_detail(pool, ErrorDetail::Suppress);
    distributor.use_request(|_exchange, next| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        next.select(4001);
    });

    let (tx, rx) = mpsc::unbounded::<Bytes>();
    let writer = tokio::spawn(async move {
        for chunk in [&b"A"[..], b"B", b"C"] {
            tx.unbounded_send(Bytes::from_static(chunk)).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // sender drops here, ending the stream
    });

    let (responder, _log) = responder();
    distributor.handle_request(head("a.example"), Box::pin(rx), responder).await;
    writer.await.unwrap();

    let received = distributor.proxy().received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, Backend::new(4001));
    assert_eq!(received[0].1, Bytes::from_static(b"ABC"));
}

#[tokio::test]
async fn failed_decision_reaches_the_error_chain_then_500() {
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let pool = BackendPool::new(&[]);
    let mut distributor = Distributor::with_error_detail(pool, ErrorDetail::Suppress);

    let sink = Arc::clone(&seen);
    distributor
        .use_request(|_exchange, next| async move { next.fail(RoutingError::new("x")) })
        .use_request(|_exchange, _next| async move { panic!("must not run after termination") })
        .use_request_error(move |error, _exchange, next| {
            sink.lock().unwrap_or_else(PoisonError::into_inner).push(error.message().to_string());
            async move { next.advance() }
        });

    let (responder, log) = responder();
    distributor.handle_request(head("a.example"), empty_body(), responder).await;

    assert_eq!(*seen.lock().unwrap_or_else(PoisonError::into_inner), vec!["x".to_string()]);
    let (status, body, finished) = log.snapshot();
    assert_eq!(status, Some(StatusCode::INTERNAL_SERVER_ERROR));
    assert_eq!(body, Bytes::new());
    assert!(finished);
}

#[tokio::test]
async fn development_mode_exposes_error_detail() {
    let pool = BackendPool::new(&[]);
    let mut distributor = Distributor::with_error_detail(pool, ErrorDetail::Expose);
    distributor.use_request(|_exchange, next| async move { next.fail(RoutingError::new("backend lookup failed")) });

    let (responder, log) = responder();
    distributor.handle_request(head("a.example"), empty_body(), responder).await;

    let (status, body, _) = log.snapshot();
    assert_eq!(status, Some(StatusCode::INTERNAL_SERVER_ERROR));
    assert_eq!(body, Bytes::from_static(b"backend lookup failed"));
}

#[tokio::test]
async fn double_continuation_panics_with_request_diagnostics() {
    let pool = BackendPool::new(&[]);
    let mut distributor = Distributor::with_error_detail(pool, ErrorDetail::Suppress);
    distributor.use_request(|_exchange, next| async move {
        next.advance();
        next.advance();
    });
    let distributor = Arc::new(distributor);

    let (responder, _log) = responder();
    let worker = Arc::clone(&distributor);
    let outcome =
        tokio::spawn(async move { worker.handle_request(head("a.example"), empty_body(), responder).await }).await;

    let panic = outcome.expect_err("double continuation must panic").into_panic();
    let message = panic.downcast_ref::<String>().expect("panic carries a message");
    assert!(message.contains("more than once"));
    assert!(message.contains("/index.html"));
    assert!(message.contains("a.example"));
}

#[tokio::test]
async fn unmatched_upgrade_closes_the_socket_without_a_handshake() {
    let pool = BackendPool::new(&[]);
    let distributor = Distributor::with_error_detail(pool, ErrorDetail::Suppress);

    let (socket, mut peer) = tokio::io::duplex(64);
    distributor.handle_upgrade(head("a.example"), empty_body(), Box::new(socket), Bytes::new()).await;

    let mut read = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut peer, &mut read).await.unwrap();
    assert!(read.is_empty(), "no handshake bytes may be written");
    assert!(distributor.proxy().received().is_empty());
}

#[tokio::test]
async fn matched_upgrade_replays_head_and_buffered_bytes() {
    let pool = BackendPool::new(&[]);
    let mut distributor = Distributor::with_error_detail(pool, ErrorDetail::Suppress);
    distributor.use_upgrade(|exchange, next| async move {
        if exchange.request().host().is_some_and(|host| host.starts_with("ws.")) {
            next.select(5001);
        } else {
            next.advance();
        }
    });

    let (socket, _peer) = tokio::io::duplex(64);
    let early: BodyStream = Box::pin(futures::stream::iter(vec![Bytes::from_static(b"frame")]));
    distributor.handle_upgrade(head("ws.example"), early, Box::new(socket), Bytes::from_static(b"GET ")).await;

    let received = distributor.proxy().received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, Backend::new(5001));
    assert_eq!(received[0].1, Bytes::from_static(b"GET frame"));
}
