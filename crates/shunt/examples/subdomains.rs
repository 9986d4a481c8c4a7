//! Routes requests to per-subdomain backends: `a.example` to port 4001, `b.example`
//! to port 4002, anything else to the built-in 501 default. Drives a few synthetic
//! connections through the distributor and logs what the proxy engine would forward.
//!
//! Run with: `cargo run --example subdomains`

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode};
use http_body_util::BodyExt;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use shunt::{
    BodyStream, ConnectionSource, Distributor, ForwardTarget, HttpExchange, Inbound, ProxyEngine, RequestHead,
    Responder, RoutingError, UpgradeExchange,
};

/// Stands in for a real byte-forwarding engine: consumes the handed-off body and logs
/// where the bytes would have gone.
struct LoggingProxy;

#[async_trait]
impl ProxyEngine for LoggingProxy {
    async fn forward_request(&self, exchange: Arc<HttpExchange>, target: ForwardTarget) {
        let body = target.body.collect().await.expect("buffered body never fails").to_bytes();
        info!(backend = %target.backend, body = body.len(), "would proxy http request");

        exchange.send_head(StatusCode::OK, HeaderMap::new());
        exchange.send_chunk(Bytes::from(format!("routed to {}\n", target.backend)));
        exchange.finish();
    }

    async fn forward_upgrade(&self, exchange: Arc<UpgradeExchange>, target: ForwardTarget) {
        let head = exchange.upgrade_head().len();
        info!(backend = %target.backend, handshake_bytes = head, "would proxy upgrade");
    }
}

/// Prints the response instead of writing it to a socket.
struct StdoutResponder {
    host: String,
}

impl Responder for StdoutResponder {
    fn send_head(&mut self, status: StatusCode, _headers: HeaderMap) {
        println!("{} <- {}", self.host, status);
    }

    fn send_chunk(&mut self, chunk: Bytes) {
        print!("{} <- {}", self.host, String::from_utf8_lossy(&chunk));
    }

    fn finish(&mut self) {
        println!("{} <- (end)", self.host);
    }
}

struct Synthetic(std::collections::VecDeque<Inbound>);

#[async_trait]
impl ConnectionSource for Synthetic {
    async fn accept(&mut self) -> Option<Inbound> {
        self.0.pop_front()
    }
}

fn request(host: &str) -> Inbound {
    let head: RequestHead =
        Request::builder().uri("/").header(http::header::HOST, host).body(()).expect("valid request").into();
    let body: BodyStream = Box::pin(futures::stream::empty());
    Inbound::Request { request: head, body, responder: Box::new(StdoutResponder { host: host.to_string() }) }
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut distributor = Distributor::new(LoggingProxy);
    distributor
        .use_request(|exchange, next| async move {
            match exchange.request().host() {
                Some(host) if host.starts_with("a.") => next.select(4001),
                _ => next.advance(),
            }
        })
        .use_request(|exchange, next| async move {
            match exchange.request().host() {
                Some(host) if host.starts_with("b.") => next.select(4002),
                _ => next.advance(),
            }
        })
        .use_request_error(|error, _exchange, next| async move {
            tracing::warn!(error = %error, "routing failed, falling through to the 500 default");
            next.advance();
        });

    // also exercise the error chain
    distributor.use_request(|exchange, next| async move {
        if exchange.request().host() == Some("broken.example") {
            next.fail(RoutingError::new("backend pool offline"));
        } else {
            next.advance();
        }
    });

    let connections = Synthetic(
        [request("a.example"), request("b.example"), request("c.example"), request("broken.example")].into(),
    );

    Arc::new(distributor).serve(connections).await;

    // serve() spawns one task per connection; give them a moment to finish
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
}
