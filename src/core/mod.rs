//! # Core Wire Components
//!
//! Packet layouts, byte-order-safe field accessors and the match-tag codec
//! shared by every sender and receiver.
//!
//! ## Components
//! - **Wire**: sealed field accessor for 1, 2 and 4 byte fields
//! - **Match Info**: 64-bit tag split into two 32-bit words
//! - **Packet**: tagged body variants and the Ethernet frame around them
//! - **Codec**: Tokio codec for datagram transports
//!
//! ## Wire Format
//! ```text
//! [Ethernet(14)] [ptype(1)] [dst_ep(1)] [src_ep(1)] [generation(1)] [Body(N)]
//! ```
//!
//! All multi-byte fields are big-endian regardless of host order.

pub mod codec;
pub mod match_info;
pub mod packet;
pub mod wire;
