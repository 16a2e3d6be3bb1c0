//! Cluster-wide named locks
//!
//! Requests go to the coordinator of the current view, which owns the lock
//! table. Acquiring waits on a one-shot grant (no polling) until it arrives or
//! the timeout fires; a timed-out request is cancelled, and a grant that
//! still arrives afterwards is handed straight back.
//!
//! Locks are not reentrant: a second acquire of a held name by the same
//! member queues behind the first like any other request.

use crate::common::{Error, Result};
use crate::group::membership::{GroupMembership, MembershipListener};
use crate::group::view::{MemberId, View};
use crate::lock::table::{LockTable, Outbox};
use crate::transport::message::{LockMessage, Message};
use crate::transport::network::{send_or_log, Network};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Proof of holding a lock, carrying its fencing token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    name: String,
    holder: MemberId,
    token: u64,
}

impl LockHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> &MemberId {
        &self.holder
    }

    /// Strictly increasing across every grant in the group.
    pub fn token(&self) -> u64 {
        self.token
    }
}

struct PendingAcquire {
    name: String,
    grant: oneshot::Sender<u64>,
}

#[derive(Default)]
struct ClientState {
    pending: HashMap<u64, PendingAcquire>,
    /// token -> lock name
    held: HashMap<u64, String>,
    max_token: u64,
}

pub struct DistributedLockService {
    network: Arc<dyn Network>,
    membership: Arc<GroupMembership>,
    next_request: AtomicU64,
    client: Mutex<ClientState>,
    table: Mutex<LockTable>,
}

/// Cancels an acquire whose caller stopped waiting
struct AcquireCleanup<'a> {
    service: &'a DistributedLockService,
    name: &'a str,
    request_id: u64,
    armed: bool,
}

impl Drop for AcquireCleanup<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.service.client.lock().pending.remove(&self.request_id);
        if let Some(coordinator) = self.service.membership.coordinator() {
            send_or_log(
                self.service.network.as_ref(),
                &coordinator,
                Message::Lock(LockMessage::Cancel {
                    name: self.name.to_string(),
                    request_id: self.request_id,
                }),
            );
        }
    }
}

impl DistributedLockService {
    pub fn new(network: Arc<dyn Network>, membership: Arc<GroupMembership>) -> Self {
        let local = network.local().clone();
        Self {
            network,
            membership,
            next_request: AtomicU64::new(1),
            client: Mutex::new(ClientState::default()),
            table: Mutex::new(LockTable::new(local)),
        }
    }

    /// Block until `name` is granted to this member or `timeout` elapses.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockHandle> {
        if !self.membership.is_member() {
            return Err(Error::Membership(format!(
                "cannot lock {}: not a member of any view",
                name
            )));
        }
        let coordinator = self
            .membership
            .coordinator()
            .ok_or_else(|| Error::Membership("no lock coordinator".into()))?;

        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();
        self.client.lock().pending.insert(
            request_id,
            PendingAcquire {
                name: name.to_string(),
                grant: tx,
            },
        );
        let mut cleanup = AcquireCleanup {
            service: self,
            name,
            request_id,
            armed: true,
        };

        send_or_log(
            self.network.as_ref(),
            &coordinator,
            Message::Lock(LockMessage::Acquire {
                name: name.to_string(),
                request_id,
            }),
        );

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(token)) => {
                cleanup.armed = false;
                tracing::debug!("Acquired {} (token {})", name, token);
                Ok(LockHandle {
                    name: name.to_string(),
                    holder: self.network.local().clone(),
                    token,
                })
            }
            Ok(Err(_)) => {
                cleanup.armed = false;
                Err(Error::Membership(format!(
                    "lock request for {} abandoned: no longer in the view",
                    name
                )))
            }
            Err(_) => {
                self.abandon(name, &mut rx);
                Err(Error::LockTimeout(name.to_string()))
            }
        }
    }

    /// Stop waiting for a grant. One that raced the timeout is handed back.
    fn abandon(&self, name: &str, grant: &mut oneshot::Receiver<u64>) {
        grant.close();
        if let Ok(token) = grant.try_recv() {
            self.client.lock().held.remove(&token);
            self.hand_back(name, token);
        }
    }

    fn hand_back(&self, name: &str, token: u64) {
        tracing::debug!("Returning unclaimed grant of {} (token {})", name, token);
        if let Err(e) = self.send_release(name, token) {
            tracing::debug!("Could not return {}: {}", name, e);
        }
    }

    /// Give a held lock back. Releasing twice is a no-op.
    pub fn release(&self, handle: &LockHandle) -> Result<()> {
        let held = self.client.lock().held.remove(&handle.token).is_some();
        if !held {
            tracing::debug!("{} (token {}) is not held; nothing to release", handle.name, handle.token);
            return Ok(());
        }
        self.send_release(&handle.name, handle.token)
    }

    /// Acquire `name` and release it when the guard is dropped.
    pub async fn lock(&self, name: &str, timeout: Duration) -> Result<LockGuard<'_>> {
        let handle = self.acquire(name, timeout).await?;
        Ok(LockGuard {
            service: self,
            handle: Some(handle),
        })
    }

    fn send_release(&self, name: &str, token: u64) -> Result<()> {
        let coordinator = self
            .membership
            .coordinator()
            .ok_or_else(|| Error::Membership("no lock coordinator".into()))?;
        self.network.send(
            &coordinator,
            Message::Lock(LockMessage::Release {
                name: name.to_string(),
                token,
            }),
        )
    }

    /// Lock traffic received from `from`.
    pub fn handle(&self, from: &MemberId, message: LockMessage) {
        match message {
            LockMessage::Granted {
                name,
                request_id,
                token,
            } => self.on_granted(name, request_id, token),
            other => {
                let mut outbox = Outbox::new();
                self.table.lock().process(from.clone(), other, &mut outbox);
                self.flush(outbox);
            }
        }
    }

    fn on_granted(&self, name: String, request_id: u64, token: u64) {
        let mut client = self.client.lock();
        client.max_token = client.max_token.max(token);
        let unclaimed = match client.pending.remove(&request_id) {
            Some(pending) => match pending.grant.send(token) {
                Ok(()) => {
                    client.held.insert(token, pending.name);
                    None
                }
                Err(_) => Some(pending.name),
            },
            None => Some(name),
        };
        drop(client);

        if let Some(name) = unclaimed {
            self.hand_back(&name, token);
        }
    }

    fn flush(&self, outbox: Outbox) {
        for (to, message) in outbox {
            send_or_log(self.network.as_ref(), &to, Message::Lock(message));
        }
    }

    /// Current holder of `name` according to the local table.
    ///
    /// Only meaningful on the coordinator.
    pub fn holder(&self, name: &str) -> Option<(MemberId, u64)> {
        self.table
            .lock()
            .holder(name)
            .map(|(member, token)| (member.clone(), token))
    }

    /// Requests queued behind the holder of `name` (coordinator only).
    pub fn waiting(&self, name: &str) -> usize {
        self.table.lock().waiting(name)
    }

    /// Whether the coordinator is still collecting lock reports after a
    /// failover. Grants are held back meanwhile.
    pub fn is_reconciling(&self) -> bool {
        self.table.lock().is_reconciling()
    }

    /// Number of locks this member currently holds.
    pub fn held_count(&self) -> usize {
        self.client.lock().held.len()
    }
}

impl MembershipListener for DistributedLockService {
    fn view_accepted(&self, view: &View, previous: &View) {
        let mut outbox = Outbox::new();
        self.table.lock().view_changed(view, previous, &mut outbox);
        self.flush(outbox);

        let local = self.network.local();
        if !view.contains(local) {
            let mut client = self.client.lock();
            if !client.pending.is_empty() || !client.held.is_empty() {
                tracing::warn!(
                    "Dropping {} pending and {} held lock(s): not in view {}",
                    client.pending.len(),
                    client.held.len(),
                    view.id()
                );
            }
            // Dropping the senders fails the waiting acquirers
            client.pending.clear();
            client.held.clear();
            return;
        }

        if view.coordinator() != previous.coordinator() {
            let Some(coordinator) = view.coordinator() else {
                return;
            };
            let client = self.client.lock();
            let message = LockMessage::Reconcile {
                view: view.id(),
                held: client
                    .held
                    .iter()
                    .map(|(token, name)| (name.clone(), *token))
                    .collect(),
                pending: client
                    .pending
                    .iter()
                    .map(|(request_id, p)| (p.name.clone(), *request_id))
                    .collect(),
                max_token: client.max_token,
            };
            drop(client);
            send_or_log(self.network.as_ref(), coordinator, Message::Lock(message));
        }
    }
}

/// A held lock, released on drop
pub struct LockGuard<'a> {
    service: &'a DistributedLockService,
    handle: Option<LockHandle>,
}

impl LockGuard<'_> {
    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    pub fn token(&self) -> u64 {
        self.handle.as_ref().map(|h| h.token).unwrap_or_default()
    }

    /// Release now and report any error.
    pub fn unlock(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.service.release(&handle),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.service.release(&handle) {
                tracing::warn!("Failed to release {}: {}", handle.name, e);
            }
        }
    }
}
