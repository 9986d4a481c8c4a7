//! Error types of the dispatch core.
//!
//! Two kinds of failure exist and they never mix:
//!
//! - [`RoutingError`] is a *value* a decision function hands to its continuation via
//!   [`Next::fail`](crate::engine::Next::fail). It is always recovered by running the
//!   protocol's error chain and is never raised.
//! - [`DoubleContinuationError`] is a programming error: a continuation was invoked a
//!   second time. It is raised as a panic so it surfaces loudly during development and
//!   can never be silently swallowed.

use std::error::Error;

use thiserror::Error;

/// An error routed through a protocol's error chain.
///
/// Carries a human readable message and an optional source error. The message (plus the
/// source chain) is what the default error middleware writes into the 500 response body
/// when diagnostic detail is enabled.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct RoutingError {
    message: String,
    #[source]
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl RoutingError {
    pub fn new<S: ToString>(message: S) -> Self {
        Self { message: message.to_string(), source: None }
    }

    pub fn with_source<S: ToString, E: Into<Box<dyn Error + Send + Sync>>>(message: S, source: E) -> Self {
        Self { message: message.to_string(), source: Some(source.into()) }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Renders the message followed by the full source chain, one cause per line.
    pub fn detail(&self) -> String {
        let mut detail = self.message.clone();
        let mut cause = Error::source(self);
        while let Some(err) = cause {
            detail.push_str("\ncaused by: ");
            detail.push_str(&err.to_string());
            cause = err.source();
        }
        detail
    }
}

/// Raised (as a panic) when a single-use continuation is invoked more than once.
///
/// The message names the offending chain step and the request it was handling, headers
/// included, so the broken decision function can be found without a debugger.
#[derive(Error, Debug)]
#[error("continuation invoked more than once by chain function #{step} for {url} ({headers})")]
pub struct DoubleContinuationError {
    pub step: usize,
    pub url: String,
    pub headers: String,
}
