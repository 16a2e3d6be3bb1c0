//! Initial state for joining members
//!
//! A new member asks an existing one for a snapshot, installs it, and only
//! then starts applying replicated calls. Calls that arrived in the meantime
//! were queued by the transport; the snapshot's digest tells which of them
//! the snapshot already contains.
//!
//! A provider only captures once every other member of the joiner's view
//! has announced that view. Announcements travel behind each member's
//! earlier calls, so by then every call sent to a view without the joiner
//! has been applied here and is part of the snapshot.

use crate::common::{Error, Result};
use crate::group::membership::GroupMembership;
use crate::group::view::{MemberId, ViewId};
use crate::state::snapshot::StoreSnapshot;
use crate::transport::message::Message;
use crate::transport::network::{send_or_log, Network};
use crate::transport::rpc::{Digest, ReplicationTransport};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Local state that can be captured and replaced wholesale.
pub trait StateProvider: Send + Sync {
    fn snapshot_entries(&self) -> BTreeMap<String, f64>;
    fn install_entries(&self, entries: BTreeMap<String, f64>);
}

type StatePayload = std::result::Result<Vec<u8>, String>;

pub struct StateTransfer {
    network: Arc<dyn Network>,
    membership: Arc<GroupMembership>,
    transport: Arc<ReplicationTransport>,
    provider: Arc<dyn StateProvider>,
    next_request: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<StatePayload>>>,
    /// Highest view each member has announced
    announced: Mutex<HashMap<MemberId, ViewId>>,
    deferred: Mutex<Vec<DeferredRequest>>,
    /// How long a deferred request is kept before it is dropped
    hold: Duration,
}

struct DeferredRequest {
    from: MemberId,
    request_id: u64,
    expires: Instant,
}

impl StateTransfer {
    pub fn new(
        network: Arc<dyn Network>,
        membership: Arc<GroupMembership>,
        transport: Arc<ReplicationTransport>,
        provider: Arc<dyn StateProvider>,
        hold: Duration,
    ) -> Self {
        Self {
            network,
            membership,
            transport,
            provider,
            next_request: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            announced: Mutex::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
            hold,
        }
    }

    /// Snapshot of local state, consistent with the delivery digest.
    pub fn produce_snapshot(&self) -> StoreSnapshot {
        let (entries, digest) = self.transport.capture(|| self.provider.snapshot_entries());
        StoreSnapshot::new(entries, digest)
    }

    /// Serve a state request from `from`.
    ///
    /// A member still waiting for its own state has nothing trustworthy to
    /// give and says so, letting the requester try someone else. Otherwise
    /// the request waits until the view containing `from` has settled.
    pub fn on_request(&self, from: &MemberId, request_id: u64) {
        if self.transport.is_delivery_blocked() {
            let reason = format!("{} has not installed its own state yet", self.network.local());
            self.respond(from, request_id, Err(reason));
            return;
        }
        if !self.settled_for(from) {
            tracing::debug!("Deferring state request from {} until the view settles", from);
            self.deferred.lock().push(DeferredRequest {
                from: from.clone(),
                request_id,
                expires: Instant::now() + self.hold,
            });
            return;
        }
        self.serve(from, request_id);
    }

    /// `from` announced that it has installed `view`.
    pub fn view_announced(&self, from: &MemberId, view: ViewId) {
        {
            let mut announced = self.announced.lock();
            let seen = announced.entry(from.clone()).or_insert(view);
            if *seen < view {
                *seen = view;
            }
        }
        self.serve_deferred();
    }

    /// Every member of the current view other than `joiner` has announced it.
    fn settled_for(&self, joiner: &MemberId) -> bool {
        let view = self.membership.current_view();
        if !view.contains(joiner) {
            return false;
        }
        let announced = self.announced.lock();
        view.members()
            .iter()
            .filter(|m| *m != joiner)
            .all(|m| announced.get(m).is_some_and(|seen| *seen >= view.id()))
    }

    fn serve_deferred(&self) {
        let ready: Vec<DeferredRequest> = {
            let mut deferred = self.deferred.lock();
            if deferred.is_empty() {
                return;
            }
            let now = Instant::now();
            deferred.retain(|request| {
                let live = request.expires > now;
                if !live {
                    tracing::debug!("Dropping stale state request from {}", request.from);
                }
                live
            });
            let (ready, waiting) = std::mem::take(&mut *deferred)
                .into_iter()
                .partition(|request| self.settled_for(&request.from));
            *deferred = waiting;
            ready
        };
        for request in ready {
            self.serve(&request.from, request.request_id);
        }
    }

    fn serve(&self, to: &MemberId, request_id: u64) {
        let snapshot = self.produce_snapshot();
        tracing::info!("Returning {} stocks to {}", snapshot.len(), to);
        self.respond(to, request_id, snapshot.encode().map_err(|e| e.to_string()));
    }

    fn respond(&self, to: &MemberId, request_id: u64, payload: StatePayload) {
        send_or_log(
            self.network.as_ref(),
            to,
            Message::StateResponse {
                request_id,
                payload,
            },
        );
    }

    pub fn on_response(&self, from: &MemberId, request_id: u64, payload: StatePayload) {
        match self.pending.lock().remove(&request_id) {
            Some(waiter) => {
                let _ = waiter.send(payload);
            }
            None => tracing::debug!("Late state response {} from {}", request_id, from),
        }
    }

    /// Fetch a snapshot from `provider`, waiting at most `timeout`.
    pub async fn request_state(&self, provider: &MemberId, timeout: Duration) -> Result<StoreSnapshot> {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        let sent = self
            .network
            .send(provider, Message::StateRequest { request_id });
        let outcome = match sent {
            Ok(()) => tokio::time::timeout(timeout, rx).await,
            Err(e) => {
                self.pending.lock().remove(&request_id);
                return Err(Error::StateTransfer(format!(
                    "cannot ask {} for state: {}",
                    provider, e
                )));
            }
        };
        self.pending.lock().remove(&request_id);

        match outcome {
            Ok(Ok(Ok(bytes))) => StoreSnapshot::decode(&bytes).map_err(|e| {
                Error::StateTransfer(format!("unreadable snapshot from {}: {}", provider, e))
            }),
            Ok(Ok(Err(reason))) => Err(Error::StateTransfer(format!(
                "{} refused state request: {}",
                provider, reason
            ))),
            Ok(Err(_)) => Err(Error::StateTransfer(format!(
                "state request to {} was abandoned",
                provider
            ))),
            Err(_) => Err(Error::StateTransfer(format!(
                "no state from {} within {:?}",
                provider, timeout
            ))),
        }
    }

    /// Install `snapshot` and start applying queued calls.
    ///
    /// Returns the number of queued calls processed.
    pub fn install(&self, snapshot: StoreSnapshot) -> usize {
        let (entries, digest) = snapshot.into_parts();
        tracing::info!("Received state: {} stocks", entries.len());
        self.provider.install_entries(entries);
        self.transport.resume_delivery(digest)
    }

    /// Obtain the initial state right after joining.
    ///
    /// Other members are asked in view order (oldest first) within an
    /// overall `timeout`. The first member of a group starts empty.
    pub async fn fetch_initial_state(&self, timeout: Duration) -> Result<()> {
        let view = self.membership.current_view();
        let local = self.network.local();
        let providers: Vec<MemberId> = view
            .members()
            .iter()
            .filter(|m| *m != local)
            .cloned()
            .collect();

        if providers.is_empty() {
            tracing::info!("First member of the group; starting with empty state");
            self.transport.resume_delivery(Digest::new());
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let mut last_error = None;
        for (i, provider) in providers.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let attempt = remaining / (providers.len() - i) as u32;
            match self.request_state(provider, attempt).await {
                Ok(snapshot) => {
                    let replayed = self.install(snapshot);
                    tracing::debug!("Replayed {} queued call(s) after state install", replayed);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("State transfer from {} failed: {}", provider, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::StateTransfer(format!("no state received within {:?}", timeout))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;
    use crate::transport::message::{ApplicationError, RpcCall, Value};
    use crate::transport::rpc::MutationHandler;

    #[derive(Default)]
    struct Entries(Mutex<BTreeMap<String, f64>>);

    impl StateProvider for Entries {
        fn snapshot_entries(&self) -> BTreeMap<String, f64> {
            self.0.lock().clone()
        }

        fn install_entries(&self, entries: BTreeMap<String, f64>) {
            *self.0.lock() = entries;
        }
    }

    impl MutationHandler for Entries {
        fn handle(&self, _call: &RpcCall) -> std::result::Result<Value, ApplicationError> {
            Ok(Value::Unit)
        }
    }

    fn transfer_for(network: &MemoryNetwork, name: &str) -> (Arc<StateTransfer>, Arc<Entries>) {
        let (endpoint, _inbox) = network.endpoint(name);
        let endpoint: Arc<dyn Network> = endpoint;
        let membership = Arc::new(GroupMembership::new(endpoint.local().clone()));
        membership.create();
        let entries = Arc::new(Entries::default());
        let transport = Arc::new(ReplicationTransport::new(
            endpoint.clone(),
            membership.clone(),
            entries.clone(),
        ));
        let transfer = Arc::new(StateTransfer::new(
            endpoint,
            membership,
            transport,
            entries.clone(),
            Duration::from_secs(1),
        ));
        (transfer, entries)
    }

    #[tokio::test]
    async fn test_singleton_starts_empty_and_unblocks() {
        let network = MemoryNetwork::new();
        let (transfer, entries) = transfer_for(&network, "A");
        assert!(transfer.transport.is_delivery_blocked());

        transfer
            .fetch_initial_state(Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!transfer.transport.is_delivery_blocked());
        assert!(entries.snapshot_entries().is_empty());
    }

    #[tokio::test]
    async fn test_install_replaces_entries() {
        let network = MemoryNetwork::new();
        let (transfer, entries) = transfer_for(&network, "A");
        entries.install_entries([("OLD".to_string(), 1.0)].into_iter().collect());

        let snapshot = StoreSnapshot::new(
            [("AAPL".to_string(), 150.0), ("GOOG".to_string(), 2800.0)]
                .into_iter()
                .collect(),
            Digest::new(),
        );
        assert_eq!(transfer.install(snapshot.clone()), 0);
        assert_eq!(&entries.snapshot_entries(), snapshot.entries());
        assert_eq!(transfer.produce_snapshot(), snapshot);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let network = MemoryNetwork::new();
        let (transfer, _) = transfer_for(&network, "A");
        // B exists but nobody reads its inbox
        let (b, _b_inbox) = network.endpoint("B");

        let err = transfer
            .request_state(b.local(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StateTransfer(_)));
        assert!(transfer.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_waits_for_view_announcements() {
        let network = MemoryNetwork::new();
        let (transfer, entries) = transfer_for(&network, "A");
        let (b, _b_inbox) = network.endpoint("B");
        let (c, mut c_inbox) = network.endpoint("C");
        let a = transfer.network.local().clone();
        transfer.membership.join(b.local().clone()).unwrap();
        let view = transfer.membership.join(c.local().clone()).unwrap();
        transfer.transport.resume_delivery(Digest::new());
        entries.install_entries([("AAPL".to_string(), 150.0)].into_iter().collect());

        transfer.on_request(c.local(), 1);
        transfer.view_announced(&a, view.id());
        // B is still on the view before C joined
        transfer.view_announced(b.local(), ViewId(view.id().0 - 1));
        assert!(c_inbox.try_recv().is_err());

        transfer.view_announced(b.local(), view.id());
        let envelope = c_inbox.recv().await.unwrap();
        match envelope.message {
            Message::StateResponse {
                request_id: 1,
                payload: Ok(bytes),
            } => {
                let snapshot = StoreSnapshot::decode(&bytes).unwrap();
                assert_eq!(snapshot.entries().get("AAPL"), Some(&150.0));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
