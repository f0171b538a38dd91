//! # mx-ether
//!
//! Message passing over commodity Ethernet with a pull-based rendezvous for
//! large transfers.
//!
//! Small messages are copied into frames. Large ones are announced, and the
//! receiver pulls the bytes straight out of the sender's registered region and
//! into its own, in chunks that may arrive in any order, duplicated, or not at
//! all.
//!
//! ## Layout
//! - [`core`]: frame layouts, match info and the datagram codec
//! - [`memory`]: pinned user regions and the per-endpoint region table
//! - [`protocol`]: NICs, endpoints, matching and the pull engine
//! - [`transport`]: loopback and UDP links
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics
//!
//! ## Example
//! ```rust,no_run
//! use mx_ether::config::MxConfig;
//! use mx_ether::memory::HostMemory;
//! use mx_ether::protocol::Nic;
//! use mx_ether::transport::loopback::LoopbackFabric;
//! use std::sync::Arc;
//!
//! # fn main() -> mx_ether::error::Result<()> {
//! let config = MxConfig::default();
//! let fabric = LoopbackFabric::new();
//! let (port, _frames) = fabric.attach(config.nic.mac_addr()?)?;
//! let nic = Nic::new(config, Arc::new(port), Arc::new(HostMemory::new()))?;
//! let (endpoint, _completions) = nic.open_endpoint(None)?;
//! println!("listening on {}", endpoint.addr());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::MxConfig;
pub use error::{MxError, Result};
pub use protocol::{Completion, CompletionQueue, CompletionStatus, Endpoint, Nic, PeerAddr};
