//! Member-to-member transport
//!
//! - `message`: the wire contract (envelopes, calls, replies, lock traffic)
//! - `network`: the point-to-point delivery seam, with in-memory and TCP
//!   implementations
//! - `rpc`: replicated broadcast calls with per-member response sets

pub mod memory;
pub mod message;
pub mod network;
pub mod rpc;
pub mod tcp;

pub use memory::{MemoryEndpoint, MemoryNetwork};
pub use message::{ApplicationError, Envelope, LockMessage, Message, RpcCall, Value};
pub use network::{Inbox, Network};
pub use rpc::{
    CallMode, CallOptions, Digest, MutationHandler, ReplicationTransport, Response, ResponseSet,
};
pub use tcp::TcpNetwork;
