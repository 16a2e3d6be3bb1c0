//! Distributed lock service
//!
//! - `service`: client API (acquire, release, scoped guards) and message handling
//! - `table`: the coordinator's lock table and its reconciliation after failover

pub mod service;
mod table;

pub use service::{DistributedLockService, LockGuard, LockHandle};
