//! Pluggable request authentication.
//!
//! An [`Auth`] sees every response of an exchange before the caller does. It
//! can finish the exchange, or ask for another request on the same
//! connection (a digest challenge, a token refresh). Intermediate responses
//! are drained before the next request is written.

use super::{request::Request, response::Response};
use crate::error::BoxError;

/// What to do after a response has arrived.
#[derive(Debug)]
pub enum Decision {
    /// Send this request next, on the same connection.
    Retry(Request),
    /// Hand the current response to the caller.
    Done,
}

/// An authentication flow driven over a single connection.
pub trait Auth: Send + Sync {
    /// Adjust the first request before it is sent.
    fn start(&self, request: &mut Request) -> Result<(), BoxError> {
        let _ = request;
        Ok(())
    }

    /// Inspect the response to `request` and decide how to continue.
    ///
    /// Only the status and headers of `response` are available; its body is
    /// drained by the connection if another request follows.
    fn next(&self, request: &Request, response: &Response) -> Result<Decision, BoxError>;
}

/// Sends every request unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

impl Auth for NoAuth {
    fn next(&self, _: &Request, _: &Response) -> Result<Decision, BoxError> {
        Ok(Decision::Done)
    }
}
