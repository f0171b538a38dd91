//! # Transport Layer
//!
//! Packet delivery collaborators. The protocol core only needs somewhere to
//! hand encoded frames ([`FrameSink`]) and a way to be fed received frames
//! ([`crate::protocol::Nic::handle_frame`]); neither side promises delivery,
//! ordering or uniqueness.
//!
//! ## Transports
//! - **Loopback**: in-process fabric over tokio channels, with optional loss,
//!   duplication and reordering
//! - **UDP**: one Ethernet frame per datagram, for talking across processes
//!   without a raw socket

pub mod loopback;
pub mod udp;

use crate::error::Result;
use bytes::Bytes;

/// Outbound half of a link.
///
/// `send` must not block; a frame that cannot be queued is reported as an
/// error and considered lost.
pub trait FrameSink: Send + Sync {
    fn send(&self, frame: Bytes) -> Result<()>;
}
