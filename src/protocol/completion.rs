//! Completion reporting.
//!
//! Every posted operation finishes with exactly one [`Completion`] on the
//! endpoint's queue. Failures of remote origin (timeouts, abandoned pulls,
//! rejected connects) are reported here rather than as errors from the call
//! that posted the operation.

use crate::core::match_info::MatchInfo;
use crate::core::packet::MacAddr;
use crate::error::{MxError, Result};
use std::fmt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Identifier returned when an operation is posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// A remote endpoint: interface address plus endpoint index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub mac: MacAddr,
    pub endpoint: u8,
}

impl PeerAddr {
    pub const fn new(mac: MacAddr, endpoint: u8) -> Self {
        Self { mac, endpoint }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mac, self.endpoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Send,
    Recv,
    Connect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    /// The receive buffer was shorter than the message; `length` holds the
    /// delivered prefix.
    Truncated { msg_length: u32 },
    /// A deadline passed before the transfer finished.
    Timeout,
    /// The transfer was dropped by a nack, a peer restart or endpoint close.
    Abandoned,
    /// The peer refused the operation.
    Rejected,
}

impl CompletionStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            CompletionStatus::Success | CompletionStatus::Truncated { .. }
        )
    }

    /// Failed statuses as the matching error; truncation counts as success.
    pub fn into_result(self) -> Result<()> {
        match self {
            CompletionStatus::Success | CompletionStatus::Truncated { .. } => Ok(()),
            CompletionStatus::Timeout => Err(MxError::Timeout),
            CompletionStatus::Abandoned => Err(MxError::Abandoned),
            CompletionStatus::Rejected => Err(MxError::Rejected),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub request: RequestId,
    pub kind: CompletionKind,
    /// Absent for receives cancelled before anything matched them.
    pub peer: Option<PeerAddr>,
    pub match_info: MatchInfo,
    /// Bytes transferred.
    pub length: u32,
    pub status: CompletionStatus,
}

/// Producer half held by the endpoint.
#[derive(Debug, Clone)]
pub(crate) struct CompletionSender {
    tx: mpsc::UnboundedSender<Completion>,
}

impl CompletionSender {
    pub(crate) fn push(&self, completion: Completion) {
        // A dropped queue means the application stopped listening.
        let _ = self.tx.send(completion);
    }
}

/// Consumer half handed to the application.
#[derive(Debug)]
pub struct CompletionQueue {
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl CompletionQueue {
    pub(crate) fn channel() -> (CompletionSender, CompletionQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CompletionSender { tx }, CompletionQueue { rx })
    }

    /// Next completion if one is ready.
    pub fn try_next(&mut self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next completion; `None` once the endpoint is gone.
    pub async fn next(&mut self) -> Option<Completion> {
        self.rx.recv().await
    }

    /// Drain everything ready right now.
    pub fn drain(&mut self) -> Vec<Completion> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<Completion> {
        UnboundedReceiverStream::new(self.rx)
    }
}
