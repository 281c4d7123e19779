//! Request lifecycle and access logging
//!
//! A [`RequestLog`] follows one request through [`RequestState`] and writes
//! exactly one access record when it reaches a terminal state, or when it is
//! dropped early because the client went away.

use chrono::{DateTime, SecondsFormat, Utc};
use hyper::{Method, Uri, Version};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{error, info};

/// Tracing target of access records, routable to its own file
pub const ACCESS_TARGET: &str = "infergate::access";

/// Where a request is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Authorizing,
    Rejected,
    Authorized,
    TooLarge,
    SelectingBackend,
    NoBackend,
    Dispatched,
    Streaming,
    Complete,
    ClientAborted,
    BackendFailed,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Rejected
                | RequestState::TooLarge
                | RequestState::NoBackend
                | RequestState::Complete
                | RequestState::ClientAborted
                | RequestState::BackendFailed
        )
    }

    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (*self, next),
            (Received, Authorizing)
                | (Authorizing, Rejected)
                | (Authorizing, Authorized)
                | (Authorized, TooLarge)
                // client went away while its body was being read
                | (Authorized, ClientAborted)
                | (Authorized, SelectingBackend)
                | (SelectingBackend, NoBackend)
                | (SelectingBackend, Dispatched)
                | (SelectingBackend, ClientAborted)
                // single retry on a different backend
                | (Dispatched, SelectingBackend)
                | (Dispatched, Streaming)
                | (Dispatched, BackendFailed)
                | (Dispatched, TooLarge)
                | (Dispatched, ClientAborted)
                | (Streaming, Complete)
                | (Streaming, ClientAborted)
                | (Streaming, BackendFailed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Received => "received",
            RequestState::Authorizing => "authorizing",
            RequestState::Rejected => "rejected",
            RequestState::Authorized => "authorized",
            RequestState::TooLarge => "too_large",
            RequestState::SelectingBackend => "selecting_backend",
            RequestState::NoBackend => "no_backend",
            RequestState::Dispatched => "dispatched",
            RequestState::Streaming => "streaming",
            RequestState::Complete => "complete",
            RequestState::ClientAborted => "client_aborted",
            RequestState::BackendFailed => "backend_failed",
        }
    }
}

/// Per-request record, written to the access log once
#[derive(Debug)]
pub struct RequestLog {
    client: SocketAddr,
    received_at: DateTime<Utc>,
    started: Instant,
    request_line: String,
    request_id: String,
    credential_presented: bool,
    backend: Option<String>,
    state: RequestState,
    emitted: bool,
}

impl RequestLog {
    pub fn new(
        client: SocketAddr,
        method: &Method,
        uri: &Uri,
        version: Version,
        request_id: &str,
    ) -> Self {
        let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        Self {
            client,
            received_at: Utc::now(),
            started: Instant::now(),
            request_line: format!("{} {} {:?}", method, target, version),
            request_id: request_id.to_string(),
            credential_presented: false,
            backend: None,
            state: RequestState::Received,
            emitted: false,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn request_line(&self) -> &str {
        &self.request_line
    }

    /// Record whether an Authorization header was sent; its value never is
    pub fn set_credential_presented(&mut self, presented: bool) {
        self.credential_presented = presented;
    }

    pub fn set_backend(&mut self, backend: &str) {
        self.backend = Some(backend.to_string());
    }

    /// Move to `next`; illegal transitions are refused and logged
    pub fn advance(&mut self, next: RequestState) -> bool {
        if !self.state.can_transition_to(next) {
            error!(
                request_id = %self.request_id,
                from = self.state.as_str(),
                to = next.as_str(),
                "Refused illegal request state transition"
            );
            return false;
        }
        self.state = next;
        true
    }

    /// Enter a terminal state and write the access record.
    ///
    /// `interrupted` marks a stream that failed after bytes reached the
    /// client, which is logged as `stream_interrupted`.
    pub fn finish(
        &mut self,
        terminal: RequestState,
        status: u16,
        bytes_sent: u64,
        interrupted: bool,
    ) {
        if self.emitted {
            return;
        }
        if !terminal.is_terminal() || !self.advance(terminal) {
            return;
        }
        self.emitted = true;

        let outcome = if interrupted {
            "stream_interrupted"
        } else {
            terminal.as_str()
        };
        info!(
            target: ACCESS_TARGET,
            client = %self.client,
            timestamp = %self.received_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            request = %self.request_line,
            status,
            bytes_sent,
            credential_presented = self.credential_presented,
            backend = self.backend.as_deref().unwrap_or("-"),
            outcome,
            duration_ms = self.started.elapsed().as_millis() as u64,
            request_id = %self.request_id,
            "access"
        );
    }

    pub fn is_finished(&self) -> bool {
        self.emitted
    }
}

impl Drop for RequestLog {
    fn drop(&mut self) {
        // The service future was dropped before the request finished
        if !self.emitted && self.state.can_transition_to(RequestState::ClientAborted) {
            // 499: client closed request
            self.finish(RequestState::ClientAborted, 499, 0, false);
        }
    }
}
