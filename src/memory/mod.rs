//! # Region Memory
//!
//! Pinned, reference-counted user regions addressed by id plus byte offset.
//!
//! ## Components
//! - **Pinner**: collaborator interface that pins and unpins physical pages,
//!   with a simulated user address space implementation
//! - **Region**: frozen segment list and the offset walk used by fill/extract
//! - **Manager**: per-endpoint region table with deferred deregistration

pub mod manager;
pub mod pinner;
pub mod region;

pub use crate::core::packet::RegionId;
pub use manager::{RegionManager, RegionRef, MAX_REGIONS};
pub use pinner::{HostMemory, PagePinner, PinnedPage, PAGE_SIZE};
pub use region::{Segment, Span, UserRegion};
