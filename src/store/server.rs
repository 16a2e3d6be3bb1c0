//! Cluster-facing stock operations
//!
//! Writes are broadcast to the whole view and every member (this one
//! included) applies them through `ReplicatedMapStore`. Compare-and-swap
//! first takes the cluster lock for its key, so at most one CAS per key is
//! in flight across the group. Reads are served from the local replica.

use crate::common::{validate_key, Error, GroupConfig, MemberStatus, Result};
use crate::lock::service::DistributedLockService;
use crate::store::map::{ReplicatedMapStore, COMPARE_AND_SWAP, REMOVE_STOCK, SET_STOCK};
use crate::transport::message::{RpcCall, Value};
use crate::transport::rpc::{CallOptions, ReplicationTransport, ResponseSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Name of the cluster lock guarding CAS on `key`.
pub fn lock_name(key: &str) -> String {
    format!("lock {}", key)
}

pub struct ReplicatedStocks {
    store: Arc<ReplicatedMapStore>,
    transport: Arc<ReplicationTransport>,
    locks: Arc<DistributedLockService>,
    status: watch::Receiver<MemberStatus>,
    call_timeout: Duration,
    lock_timeout: Duration,
}

impl ReplicatedStocks {
    pub fn new(
        store: Arc<ReplicatedMapStore>,
        transport: Arc<ReplicationTransport>,
        locks: Arc<DistributedLockService>,
        status: watch::Receiver<MemberStatus>,
        config: &GroupConfig,
    ) -> Self {
        Self {
            store,
            transport,
            locks,
            status,
            call_timeout: config.call_timeout(),
            lock_timeout: config.lock_timeout(),
        }
    }

    /// Set `key` to `value` on every member.
    pub async fn set(&self, key: &str, value: f64) -> Result<ResponseSet> {
        validate_key(key)?;
        self.ensure_writable()?;
        let call = RpcCall::new(SET_STOCK, vec![key.into(), value.into()]);
        self.transport
            .broadcast_call(call, CallOptions::sync(self.call_timeout))
            .await
    }

    /// Remove `key` on every member; absent keys are fine.
    pub async fn remove(&self, key: &str) -> Result<ResponseSet> {
        validate_key(key)?;
        self.ensure_writable()?;
        let call = RpcCall::new(REMOVE_STOCK, vec![key.into()]);
        self.transport
            .broadcast_call(call, CallOptions::sync(self.call_timeout))
            .await
    }

    /// Replace `key`'s value with `new` on every member where it equals
    /// `expected`.
    ///
    /// Each member reports `Bool(true)` if it swapped. The cluster lock
    /// is held for the whole broadcast and released on every exit path.
    pub async fn compare_and_swap(&self, key: &str, expected: f64, new: f64) -> Result<ResponseSet> {
        validate_key(key)?;
        self.ensure_writable()?;

        let guard = self.locks.lock(&lock_name(key), self.lock_timeout).await?;
        let call = RpcCall::new(
            COMPARE_AND_SWAP,
            vec![key.into(), expected.into(), new.into()],
        );
        let responses = self
            .transport
            .broadcast_call(call, CallOptions::sync(self.call_timeout))
            .await;
        if let Err(e) = guard.unlock() {
            tracing::warn!("Failed to release {}: {}", lock_name(key), e);
        }
        responses
    }

    /// Local value of `key`.
    pub fn get(&self, key: &str) -> Result<Option<f64>> {
        self.ensure_readable()?;
        Ok(self.store.get(key))
    }

    /// Every local entry, sorted by key.
    pub fn all(&self) -> Result<BTreeMap<String, f64>> {
        self.ensure_readable()?;
        Ok(self.store.entries())
    }

    pub fn status(&self) -> MemberStatus {
        *self.status.borrow()
    }

    fn ensure_writable(&self) -> Result<()> {
        let status = self.status();
        if !status.can_write() {
            return Err(Error::Membership(format!(
                "cannot write while {}",
                status
            )));
        }
        Ok(())
    }

    fn ensure_readable(&self) -> Result<()> {
        let status = self.status();
        if !status.can_read() {
            return Err(Error::Membership(format!("cannot read while {}", status)));
        }
        Ok(())
    }
}

/// True when every member reported a successful swap.
pub fn swapped(responses: &ResponseSet) -> bool {
    responses.unanimous() == Some(&Value::Bool(true))
}
