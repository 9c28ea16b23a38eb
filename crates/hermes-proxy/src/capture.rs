//! Response capture while streaming to the client.
//!
//! [`CaptureBody`] forwards every frame as it arrives and tees the data into a
//! buffer. When the stream ends, fails, stalls past its idle timeout, or is
//! dropped, the completion callback runs exactly once with the buffered bytes.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hyper::body::{Body, Frame, SizeHint};
use tokio::time::{Instant, Sleep};

use hermes_core::ExchangeFailure;

/// Error recorded when the client goes away mid-response.
pub const CLIENT_DISCONNECTED: &str = "client disconnected before response completed";

/// Boxed error produced by proxied bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a captured stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The upstream body ended normally.
    Complete,
    /// The stream failed or was abandoned; carries the error message.
    Failed(String),
    /// No frame arrived within the idle timeout.
    TimedOut(ExchangeFailure),
}

type OnComplete = Box<dyn FnOnce(Bytes, CaptureOutcome) + Send + 'static>;

struct IdleTimer {
    period: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl IdleTimer {
    fn reset(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.period);
    }
}

/// Body wrapper that records what it forwards.
pub struct CaptureBody<B: Body> {
    inner: B,
    buffer: BytesMut,
    idle: Option<IdleTimer>,
    on_complete: Option<OnComplete>,
}

impl<B: Body> CaptureBody<B> {
    /// Wraps `inner`; `on_complete` receives the captured bytes.
    pub fn new<F>(inner: B, on_complete: F) -> Self
    where
        F: FnOnce(Bytes, CaptureOutcome) + Send + 'static,
    {
        Self {
            inner,
            buffer: BytesMut::new(),
            idle: None,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    /// Fails the stream when no frame arrives for `period`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn with_idle_timeout(mut self, period: Duration) -> Self {
        self.idle = Some(IdleTimer {
            period,
            sleep: Box::pin(tokio::time::sleep(period)),
        });
        self
    }

    fn finish(&mut self, outcome: CaptureOutcome) {
        if let Some(callback) = self.on_complete.take() {
            let captured = std::mem::take(&mut self.buffer).freeze();
            callback(captured, outcome);
        }
    }
}

impl<B> Body for CaptureBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.buffer.extend_from_slice(data);
                }
                if let Some(idle) = &mut this.idle {
                    idle.reset();
                }
                if this.inner.is_end_stream() {
                    this.finish(CaptureOutcome::Complete);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                let e: BoxError = e.into();
                this.finish(CaptureOutcome::Failed(e.to_string()));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(CaptureOutcome::Complete);
                Poll::Ready(None)
            }
            Poll::Pending => {
                let expired = match &mut this.idle {
                    Some(idle) => idle.sleep.as_mut().poll(cx).is_ready(),
                    None => false,
                };
                if !expired {
                    return Poll::Pending;
                }
                let failure = ExchangeFailure::timed_out("Response body");
                this.idle = None;
                this.finish(CaptureOutcome::TimedOut(failure.clone()));
                Poll::Ready(Some(Err(Box::new(failure))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B: Body> Drop for CaptureBody<B> {
    fn drop(&mut self) {
        if self.on_complete.is_none() {
            return;
        }
        // hyper drops bodies that are already at their end without polling them
        let outcome = if self.inner.is_end_stream() {
            CaptureOutcome::Complete
        } else {
            CaptureOutcome::Failed(CLIENT_DISCONNECTED.to_string())
        };
        self.finish(outcome);
    }
}
