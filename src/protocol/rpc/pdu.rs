//! Pending calls (PDUs) and their single-fire completions.
//!
//! A [`Completion`] is consumed by delivering a result, so the type system
//! rules out a second delivery. If one is dropped without ever being used (an
//! engine torn down mid-call, a PDU lost to a bug) it still delivers
//! [`CallError::ConnectionLost`] from its destructor: a caller never waits on
//! a call nobody will answer.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use super::error::{CallError, CallResult};

/// Names one submitted call. Valid for cancellation until the call completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallHandle {
    xid: u32,
}

impl CallHandle {
    pub(crate) fn new(xid: u32) -> Self {
        Self { xid }
    }

    /// Transaction id the call travels under.
    pub fn xid(&self) -> u32 {
        self.xid
    }
}

type Callback = Box<dyn FnOnce(CallResult) + Send>;

enum Sink {
    Channel(oneshot::Sender<CallResult>),
    Callback(Callback),
}

/// Where the outcome of one call goes.
pub struct Completion {
    sink: Option<Sink>,
}

impl Completion {
    /// Completion backed by a one-shot channel; await the returned
    /// [`PendingReply`] for the outcome.
    pub fn channel() -> (Self, PendingReply) {
        let (tx, rx) = oneshot::channel();
        (Self { sink: Some(Sink::Channel(tx)) }, PendingReply { rx })
    }

    /// Completion that runs `f` with the outcome, on the thread driving the
    /// engine.
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        Self { sink: Some(Sink::Callback(Box::new(f))) }
    }

    pub(crate) fn complete(mut self, result: CallResult) {
        self.deliver(result);
    }

    fn deliver(&mut self, result: CallResult) {
        match self.sink.take() {
            Some(Sink::Channel(tx)) => {
                // receiver gone means the caller stopped caring
                let _ = tx.send(result);
            }
            Some(Sink::Callback(f)) => f(result),
            None => {}
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.deliver(Err(CallError::ConnectionLost));
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.sink {
            Some(Sink::Channel(_)) => "channel",
            Some(Sink::Callback(_)) => "callback",
            None => "spent",
        };
        f.debug_struct("Completion").field("sink", &kind).finish()
    }
}

/// Receiving end of a channel [`Completion`].
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<CallResult>,
}

impl PendingReply {
    /// Takes the outcome without waiting. `None` while the call is pending.
    /// Only the first successful take sees the real outcome.
    pub fn try_result(&mut self) -> Option<CallResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(CallError::ConnectionLost)),
        }
    }
}

impl Future for PendingReply {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(CallError::ConnectionLost)))
    }
}

/// One call from submission until its outcome is delivered.
#[derive(Debug)]
pub(crate) struct Pdu {
    pub xid: u32,
    /// Submission order, used to restore FIFO order when requeueing.
    pub seq: u64,
    /// Serialized call message without record marker.
    pub message: Vec<u8>,
    /// Last time the call entered the outbound queue.
    pub enqueued_at: Instant,
    /// Last time the call finished transmission.
    pub sent_at: Option<Instant>,
    /// Retransmissions caused by timeouts.
    pub retries: u32,
    /// Whether this stay in the outbound queue was already counted as a
    /// queue timeout.
    pub queue_timeout_counted: bool,
    completion: Option<Completion>,
}

impl Pdu {
    pub fn new(xid: u32, seq: u64, message: Vec<u8>, completion: Completion, now: Instant) -> Self {
        Self {
            xid,
            seq,
            message,
            enqueued_at: now,
            sent_at: None,
            retries: 0,
            queue_timeout_counted: false,
            completion: Some(completion),
        }
    }

    /// Delivers `result` unless the outcome was already delivered.
    /// Returns whether this call delivered it.
    pub fn complete(&mut self, result: CallResult) -> bool {
        match self.completion.take() {
            Some(completion) => {
                completion.complete(result);
                true
            }
            None => false,
        }
    }

    /// The caller already has an outcome; the PDU only lingers because part
    /// of it is on the wire.
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_none()
    }

    /// Resets transmission bookkeeping when the PDU goes back to the queue.
    pub fn requeue(&mut self, now: Instant) {
        self.enqueued_at = now;
        self.sent_at = None;
        self.queue_timeout_counted = false;
    }
}
