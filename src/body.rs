//! Body wrappers used on the proxy path
//!
//! [`DeferredBody`] hands the client's request body to the backend client
//! lazily, so a request whose backend connection failed before any byte was
//! written can be sent again. [`TrackedBody`] relays the backend response
//! frame by frame and settles the request's bookkeeping when the stream ends.

use crate::accesslog::{RequestLog, RequestState};
use crate::error::{BoxError, GatewayError, ProxyBody};
use crate::loadbalancer::ConnectionGuard;
use http_body_util::LengthLimitError;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::warn;

/// Client request body that has not been handed to a backend yet
#[derive(Clone)]
pub struct BodySlot {
    inner: Arc<Mutex<Option<ProxyBody>>>,
    size_hint: SizeHint,
    end_stream: bool,
}

impl BodySlot {
    pub fn new(body: ProxyBody) -> Self {
        let size_hint = body.size_hint();
        let end_stream = body.is_end_stream();
        Self {
            inner: Arc::new(Mutex::new(Some(body))),
            size_hint,
            end_stream,
        }
    }

    /// A body for one send attempt. It takes the real body on its first poll.
    pub fn deferred(&self) -> DeferredBody {
        DeferredBody {
            slot: self.clone(),
            body: None,
        }
    }

    /// True while no send attempt has started reading the body
    pub fn is_unsent(&self) -> bool {
        self.end_stream || self.inner.lock().is_some()
    }
}

/// Request body that pulls from a [`BodySlot`] only when polled
pub struct DeferredBody {
    slot: BodySlot,
    body: Option<ProxyBody>,
}

impl Body for DeferredBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.body.is_none() {
            this.body = this.slot.inner.lock().take();
        }
        match this.body.as_mut() {
            Some(body) => Pin::new(body).poll_frame(cx),
            None => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self.body {
            Some(ref body) => body.is_end_stream(),
            None => self.slot.end_stream,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self.body {
            Some(ref body) => body.size_hint(),
            None => self.slot.size_hint.clone(),
        }
    }
}

/// Whether `err` (or anything in its source chain) is a body size violation
pub fn is_length_limit_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.downcast_ref::<LengthLimitError>().is_some() {
            return true;
        }
        current = e.source();
    }
    false
}

/// Backend response body relayed to the client.
///
/// Frames pass through unbuffered. The connection guard and access record
/// ride along and are settled when the stream completes, fails, or is
/// dropped because the client disconnected.
pub struct TrackedBody {
    inner: ProxyBody,
    guard: Option<ConnectionGuard>,
    log: RequestLog,
    status: u16,
    bytes_sent: u64,
}

impl TrackedBody {
    pub fn new(inner: ProxyBody, guard: ConnectionGuard, log: RequestLog, status: u16) -> Self {
        Self {
            inner,
            guard: Some(guard),
            log,
            status,
            bytes_sent: 0,
        }
    }

    fn settle(&mut self, terminal: RequestState, interrupted: bool) {
        // Release the backend slot before logging
        self.guard.take();
        self.log.finish(terminal, self.status, self.bytes_sent, interrupted);
    }
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.log.is_finished() {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes_sent += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                let backend = this
                    .guard
                    .as_ref()
                    .map(|g| g.endpoint().address().to_string())
                    .unwrap_or_default();
                let err = GatewayError::StreamInterrupted { backend, source: e };
                warn!(
                    request_id = %this.log.request_id(),
                    bytes_sent = this.bytes_sent,
                    error = %err,
                    "Backend stream interrupted, aborting client response"
                );
                this.settle(RequestState::BackendFailed, true);
                Poll::Ready(Some(Err(err.into())))
            }
            Poll::Ready(None) => {
                this.settle(RequestState::Complete, false);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        if !self.log.is_finished() {
            if self.inner.is_end_stream() {
                self.settle(RequestState::Complete, false);
            } else {
                self.settle(RequestState::ClientAborted, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, BalancerConfig};
    use crate::loadbalancer::Endpoint;
    use http_body_util::{BodyExt, Full, Limited, StreamBody};
    use hyper::{Method, Version};

    fn boxed(data: &'static str) -> ProxyBody {
        Full::new(Bytes::from(data)).map_err(|e| match e {}).boxed()
    }

    fn streaming_log() -> RequestLog {
        let mut log = RequestLog::new(
            "127.0.0.1:50000".parse().unwrap(),
            &Method::POST,
            &"/api/chat".parse().unwrap(),
            Version::HTTP_11,
            "req-test",
        );
        for state in [
            RequestState::Authorizing,
            RequestState::Authorized,
            RequestState::SelectingBackend,
            RequestState::Dispatched,
            RequestState::Streaming,
        ] {
            log.advance(state);
        }
        log
    }

    fn endpoint() -> Arc<Endpoint> {
        Arc::new(Endpoint::new(
            &BackendConfig::new("127.0.0.1", 11434),
            &BalancerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_deferred_body_untouched_until_polled() {
        let slot = BodySlot::new(boxed("prompt"));
        let attempt = slot.deferred();
        assert!(slot.is_unsent());
        assert_eq!(attempt.size_hint().exact(), Some(6));

        // A failed attempt that never polled leaves the body in place
        drop(attempt);
        assert!(slot.is_unsent());

        let collected = slot.deferred().collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from("prompt"));
        assert!(!slot.is_unsent());
    }

    #[tokio::test]
    async fn test_length_limit_detection() {
        let limited = Limited::new(Full::new(Bytes::from("0123456789")), 4);
        let err = limited.collect().await.unwrap_err();
        assert!(is_length_limit_error(err.as_ref()));

        let other: BoxError = "connection reset".into();
        assert!(!is_length_limit_error(other.as_ref()));
    }

    #[tokio::test]
    async fn test_tracked_body_relays_chunks_in_order() {
        let chunks: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from("{\"response\":\"Hel\"}\n"))),
            Ok(Frame::data(Bytes::from("{\"response\":\"lo\"}\n"))),
            Ok(Frame::data(Bytes::from("{\"done\":true}\n"))),
        ];
        let inner = StreamBody::new(futures::stream::iter(chunks)).boxed();
        let endpoint = endpoint();
        let guard = ConnectionGuard::new(Arc::clone(&endpoint));

        let mut body = TrackedBody::new(inner, guard, streaming_log(), 200);
        let mut received = Vec::new();
        while let Some(frame) = body.frame().await {
            received.push(frame.unwrap().into_data().unwrap());
        }

        assert_eq!(received.len(), 3);
        assert_eq!(received[1], Bytes::from("{\"response\":\"lo\"}\n"));
        assert_eq!(endpoint.active_connections(), 0);
        assert_eq!(body.log.state(), RequestState::Complete);
        assert_eq!(body.bytes_sent, 51);
    }

    #[tokio::test]
    async fn test_tracked_body_interrupted_stream() {
        let chunks: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from("first"))),
            Err("backend reset".into()),
        ];
        let inner = StreamBody::new(futures::stream::iter(chunks)).boxed();
        let endpoint = endpoint();
        let guard = ConnectionGuard::new(Arc::clone(&endpoint));

        let mut body = TrackedBody::new(inner, guard, streaming_log(), 200);
        assert!(body.frame().await.unwrap().is_ok());
        assert_eq!(endpoint.active_connections(), 1);
        let err = body.frame().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("interrupted"));

        assert_eq!(endpoint.active_connections(), 0);
        assert_eq!(body.log.state(), RequestState::BackendFailed);
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_tracked_body_client_abort_releases_slot() {
        let chunks: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from("first"))),
            Ok(Frame::data(Bytes::from("second"))),
        ];
        let inner = StreamBody::new(futures::stream::iter(chunks)).boxed();
        let endpoint = endpoint();
        let guard = ConnectionGuard::new(Arc::clone(&endpoint));

        let mut body = TrackedBody::new(inner, guard, streaming_log(), 200);
        assert!(body.frame().await.is_some());
        drop(body);

        assert_eq!(endpoint.active_connections(), 0);
    }
}
