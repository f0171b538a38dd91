//! # Error Types
//!
//! Error handling for the wire codec, region manager and pull engine.
//!
//! ## Error Categories
//! - **Wire Errors**: malformed or truncated frames, unknown packet types
//! - **Region Errors**: unknown region ids, out-of-range accesses, pinning failures
//! - **Engine Errors**: stale replies, timeouts, abandoned transfers, exhausted tables
//! - **Plumbing Errors**: transport, configuration and I/O failures
//!
//! Only pinning failures during registration are hard errors for the immediate
//! caller. Everything raised while processing an incoming frame is dropped and
//! counted by the receive path; nothing here is fatal to an endpoint.
//!
//! ## Example Usage
//! ```rust
//! use mx_ether::error::{MxError, Result};
//! use mx_ether::memory::{HostMemory, RegionManager, Span};
//! use std::sync::Arc;
//!
//! fn register_one(manager: &RegionManager, addr: u64) -> Result<u8> {
//!     let id = manager.register(&[Span::new(addr, 64)])?;
//!     Ok(id.index)
//! }
//!
//! let memory = Arc::new(HostMemory::new());
//! let manager = RegionManager::new(memory.clone(), 8);
//! let addr = memory.alloc(64);
//! match register_one(&manager, addr) {
//!     Ok(index) => assert!(index < 8),
//!     Err(MxError::RegionTableFull) => unreachable!(),
//!     Err(e) => panic!("{e}"),
//! }
//! ```

use crate::memory::RegionId;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Wire errors
    pub const ERR_TRUNCATED: &str = "Frame shorter than its declared layout";
    pub const ERR_NOT_OUR_ETHERTYPE: &str = "Frame does not carry the MX ethertype";

    /// Transport errors
    pub const ERR_FABRIC_PORT_CLOSED: &str = "Loopback port closed";
    pub const ERR_UNKNOWN_DESTINATION: &str = "No port attached for destination address";
}

/// Why a frame was rejected by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedKind {
    /// Body shorter than the layout its type requires.
    Truncated,
    /// Packet type byte outside the assigned set.
    UnknownType(u8),
    /// Link-layer type is not ours.
    ForeignEtherType(u16),
    /// A declared length disagrees with the bytes present.
    LengthMismatch,
}

impl std::fmt::Display for MalformedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MalformedKind::Truncated => f.write_str(constants::ERR_TRUNCATED),
            MalformedKind::UnknownType(t) => write!(f, "unknown packet type {t}"),
            MalformedKind::ForeignEtherType(t) => {
                write!(f, "{} (0x{t:04x})", constants::ERR_NOT_OUR_ETHERTYPE)
            }
            MalformedKind::LengthMismatch => f.write_str("declared length mismatch"),
        }
    }
}

// MxError is the primary error type for all operations
#[derive(Error, Debug)]
pub enum MxError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed packet: {0}")]
    MalformedPacket(MalformedKind),

    #[error("Invalid region {0}")]
    InvalidRegion(RegionId),

    #[error("Range {offset}+{length} outside region of {region_length} bytes")]
    OutOfRange {
        offset: u64,
        length: u64,
        region_length: u64,
    },

    #[error("Stale or duplicate pull reply")]
    StaleReply,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Transfer abandoned")]
    Abandoned,

    #[error("Rejected by peer")]
    Rejected,

    #[error("Page pinning failed: {0}")]
    PinFailed(String),

    #[error("Region table full")]
    RegionTableFull,

    #[error("Pull table full")]
    PullTableFull,

    #[error("Pull ranges violate partition: {0}")]
    PartitionViolation(String),

    #[error("Peer not connected")]
    NotConnected,

    #[error("Endpoint closed")]
    EndpointClosed,

    #[error("Endpoint slot {0} already open")]
    EndpointBusy(u8),

    #[error("No free endpoint slot")]
    EndpointTableFull,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Synchronization primitive poisoned")]
    LockPoisoned,
}

impl<T> From<std::sync::PoisonError<T>> for MxError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        MxError::LockPoisoned
    }
}

/// Type alias for Results using MxError
pub type Result<T> = std::result::Result<T, MxError>;
