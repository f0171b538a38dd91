//! # Messaging Engine
//!
//! Endpoints, matching and the pull-based rendezvous protocol.
//!
//! ## Components
//! - **Nic**: endpoint slot table, frame dispatch, host queries, timeouts
//! - **Endpoint**: connect, send, receive and the per-endpoint receive path
//! - **Matching**: posted and unexpected queues keyed by masked match info
//! - **Eager**: tiny, small and fragmented medium messages
//! - **Rendezvous**: announce, pull issue and stateless pull servicing
//! - **Pull**: pull contexts and the handle/magic correlation table
//! - **Partner**: per-peer session, generation and sequence state
//! - **Completion**: the queue through which every operation finishes
//!
//! ## Message Flow
//! ```text
//! sender                               receiver
//!   isend <= medium_max  -- eager -->   match, copy, complete
//!   isend  > medium_max  -- RNDV -->    match, issue pulls
//!                        <-- PULL --
//!                        -- REPLY -->   fill, complete contexts
//!   complete send        <-- NOTIFY --  complete receive
//! ```

pub mod completion;
pub mod eager;
pub mod endpoint;
pub mod matching;
pub mod nic;
pub mod partner;
pub mod pull;
pub mod rendezvous;

pub use completion::{
    Completion, CompletionKind, CompletionQueue, CompletionStatus, PeerAddr, RequestId,
};
pub use endpoint::Endpoint;
pub use nic::Nic;
pub use pull::{PullHandle, PullTable};
