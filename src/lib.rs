//! # stockgroup
//!
//! A replicated stock-price map kept by a group of cooperating processes:
//! - Group membership with ordered views and heartbeat failure detection
//! - Replicated RPC: every mutation is broadcast to the whole view, FIFO per sender
//! - State transfer so joining members start from a consistent snapshot
//! - Cluster-wide named locks making compare-and-swap atomic per key
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Member                                       │
//! │  ReplicatedStocks (set / remove / cas / get) │
//! │      │                │                      │
//! │  DistributedLock   ReplicationTransport      │
//! │      │                │         │            │
//! │      │          ReplicatedMap  StateTransfer │
//! │      └──────┬─────────┘                      │
//! │        GroupMembership + FailureDetector     │
//! └──────────────┬───────────────────────────────┘
//!                │ Network (TCP or in-memory)
//!      ┌─────────┴──────────┬──────────────┐
//!   Member B             Member C       Member D
//! ```
//!
//! ## Usage
//!
//! ### Start members
//! ```bash
//! stockd serve --name A --bind 127.0.0.1:7800 --http 127.0.0.1:8800
//! stockd serve --name B --bind 127.0.0.1:7801 --seeds 127.0.0.1:7800 --console
//! ```
//!
//! ### Use the CLI
//! ```bash
//! stock --node http://127.0.0.1:8800 set AAPL 150
//! stock --node http://127.0.0.1:8800 cas AAPL 150 155
//! stock --node http://127.0.0.1:8800 show
//! ```

pub mod common;
pub mod group;
pub mod lock;
pub mod member;
pub mod state;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use common::{Config, Error, GroupConfig, MemberStatus, Result};
pub use group::{MemberId, View, ViewId};
pub use member::Member;
pub use transport::{MemoryNetwork, Network, TcpNetwork};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
