//! In-process network for tests and embedded groups
//!
//! Members are connected through unbounded channels keyed by address. Faults
//! are injected by crashing a member (all traffic to and from it is dropped)
//! or by installing a drop rule that discards matching messages.

use crate::common::{Error, Result};
use crate::group::view::MemberId;
use crate::transport::message::{Envelope, Message};
use crate::transport::network::{Inbox, Network};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

type DropRule = Arc<dyn Fn(&MemberId, &MemberId, &Message) -> bool + Send + Sync>;

#[derive(Default)]
struct Shared {
    mailboxes: Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
    crashed: Mutex<HashSet<String>>,
    drop_rule: RwLock<Option<DropRule>>,
}

/// Hub connecting in-memory endpoints
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    shared: Arc<Shared>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member and return its endpoint and inbox.
    pub fn endpoint(&self, name: &str) -> (Arc<MemoryEndpoint>, Inbox) {
        let local = MemberId::new(name, format!("mem://{}", name));
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .mailboxes
            .lock()
            .insert(local.addr().to_string(), tx);
        self.shared.crashed.lock().remove(local.addr());
        let endpoint = Arc::new(MemoryEndpoint {
            local,
            shared: self.shared.clone(),
        });
        (endpoint, rx)
    }

    /// Silently drop all traffic to and from `member` from now on.
    pub fn crash(&self, member: &MemberId) {
        tracing::info!("Crashing {}", member);
        self.shared.crashed.lock().insert(member.addr().to_string());
        self.shared.mailboxes.lock().remove(member.addr());
    }

    /// Drop every message for which `rule(from, to, message)` is true.
    pub fn drop_when<F>(&self, rule: F)
    where
        F: Fn(&MemberId, &MemberId, &Message) -> bool + Send + Sync + 'static,
    {
        *self.shared.drop_rule.write() = Some(Arc::new(rule));
    }

    pub fn clear_drop_rule(&self) {
        *self.shared.drop_rule.write() = None;
    }
}

pub struct MemoryEndpoint {
    local: MemberId,
    shared: Arc<Shared>,
}

impl Network for MemoryEndpoint {
    fn local(&self) -> &MemberId {
        &self.local
    }

    fn send(&self, to: &MemberId, message: Message) -> Result<()> {
        {
            let crashed = self.shared.crashed.lock();
            if crashed.contains(self.local.addr()) || crashed.contains(to.addr()) {
                return Ok(());
            }
        }
        if let Some(rule) = self.shared.drop_rule.read().as_ref() {
            if rule(&self.local, to, &message) {
                tracing::trace!("Drop rule discarded {} to {}", message.kind(), to);
                return Ok(());
            }
        }

        let mailboxes = self.shared.mailboxes.lock();
        let mailbox = mailboxes
            .get(to.addr())
            .ok_or_else(|| Error::Unreachable(to.to_string()))?;
        mailbox
            .send(Envelope {
                from: self.local.clone(),
                message,
            })
            .map_err(|_| Error::Unreachable(to.to_string()))
    }

    fn shutdown(&self) {
        self.shared.mailboxes.lock().remove(self.local.addr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::view::ViewId;

    #[tokio::test]
    async fn test_fifo_delivery() {
        let net = MemoryNetwork::new();
        let (a, _a_inbox) = net.endpoint("A");
        let (b, mut b_inbox) = net.endpoint("B");

        for request_id in 0..3 {
            a.send(b.local(), Message::StateRequest { request_id }).unwrap();
        }
        for expected in 0..3 {
            let envelope = b_inbox.recv().await.unwrap();
            assert_eq!(envelope.from, *a.local());
            assert_eq!(
                envelope.message,
                Message::StateRequest {
                    request_id: expected
                }
            );
        }
    }

    #[tokio::test]
    async fn test_crash_and_drop_rule() {
        let net = MemoryNetwork::new();
        let (a, _a_inbox) = net.endpoint("A");
        let (b, mut b_inbox) = net.endpoint("B");
        let (c, _c_inbox) = net.endpoint("C");

        net.drop_when(|_, _, message| matches!(message, Message::Heartbeat { .. }));
        a.send(b.local(), Message::Heartbeat { view: ViewId(2) }).unwrap();
        a.send(b.local(), Message::LeaveRequest).unwrap();
        assert_eq!(b_inbox.recv().await.unwrap().message, Message::LeaveRequest);

        net.crash(c.local());
        // Traffic to a crashed member vanishes without an error
        a.send(c.local(), Message::LeaveRequest).unwrap();
        c.send(b.local(), Message::LeaveRequest).unwrap();
        assert!(b_inbox.try_recv().is_err());

        let unknown = MemberId::new("Z", "mem://Z");
        assert!(matches!(
            a.send(&unknown, Message::LeaveRequest),
            Err(Error::Unreachable(_))
        ));
    }
}
