//! A running group member
//!
//! `Member::join` wires the subsystems around one network endpoint and
//! starts two tasks:
//!
//! - dispatch: drains the inbox one message at a time, so replicated calls,
//!   views and lock traffic are handled in arrival order
//! - tick: heartbeats the view, tracks reachability and evicts members that
//!   went silent
//!
//! Joins, leaves and evictions are decided by the coordinator (the oldest
//! member), which installs the next view locally and sends it to everyone.

use crate::common::{Error, GroupConfig, MemberStatus, Result};
use crate::group::detector::FailureDetector;
use crate::group::membership::GroupMembership;
use crate::group::view::{MemberId, View, ViewId};
use crate::lock::service::DistributedLockService;
use crate::state::transfer::StateTransfer;
use crate::store::map::ReplicatedMapStore;
use crate::store::server::ReplicatedStocks;
use crate::transport::message::{Envelope, Message};
use crate::transport::network::{send_or_log, Inbox, Network};
use crate::transport::rpc::ReplicationTransport;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

pub struct Member {
    shared: Arc<Shared>,
}

struct Shared {
    config: GroupConfig,
    network: Arc<dyn Network>,
    membership: Arc<GroupMembership>,
    detector: Arc<FailureDetector>,
    transport: Arc<ReplicationTransport>,
    locks: Arc<DistributedLockService>,
    state: StateTransfer,
    store: Arc<ReplicatedMapStore>,
    stocks: ReplicatedStocks,
    status: watch::Sender<MemberStatus>,
    rejection: watch::Sender<Option<String>>,
    leaving: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Member {
    /// Join the cluster named in `config` and fetch the initial state.
    ///
    /// Returns once the member is serving. If the state cannot be fetched
    /// the member leaves again and the error is returned.
    pub async fn join(network: Arc<dyn Network>, inbox: Inbox, config: GroupConfig) -> Result<Self> {
        config.validate()?;
        let local = network.local().clone();

        let membership = Arc::new(GroupMembership::new(local.clone()));
        let detector = Arc::new(FailureDetector::new(
            local.clone(),
            config.liveness_timeout(),
        ));
        let store = Arc::new(ReplicatedMapStore::new());
        let transport = Arc::new(ReplicationTransport::new(
            network.clone(),
            membership.clone(),
            store.clone(),
        ));
        let locks = Arc::new(DistributedLockService::new(
            network.clone(),
            membership.clone(),
        ));
        membership.register(detector.clone());
        membership.register(transport.clone());
        membership.register(locks.clone());

        let state = StateTransfer::new(
            network.clone(),
            membership.clone(),
            transport.clone(),
            store.clone(),
            config.state_transfer_timeout(),
        );
        let (status, _) = watch::channel(MemberStatus::Joining);
        let stocks = ReplicatedStocks::new(
            store.clone(),
            transport.clone(),
            locks.clone(),
            status.subscribe(),
            &config,
        );
        let (rejection, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            config,
            network,
            membership,
            detector,
            transport,
            locks,
            state,
            store,
            stocks,
            status,
            rejection,
            leaving: AtomicBool::new(false),
            shutdown,
        });
        tokio::spawn(dispatch(shared.clone(), inbox, shared.shutdown.subscribe()));
        tokio::spawn(tick(shared.clone(), shared.shutdown.subscribe()));

        let member = Member { shared };
        tracing::info!(
            "Joining cluster {} as {}",
            member.shared.config.cluster,
            local
        );
        if let Err(e) = member.enter().await {
            tracing::error!("{} could not join {}: {}", local, member.shared.config.cluster, e);
            if let Err(leave_error) = member.leave().await {
                tracing::debug!("Leave after failed join: {}", leave_error);
            }
            return Err(e);
        }
        Ok(member)
    }

    async fn enter(&self) -> Result<()> {
        let shared = &self.shared;
        let local = shared.network.local();
        let seeds: Vec<MemberId> = shared
            .config
            .seeds
            .iter()
            .filter(|addr| addr.as_str() != local.addr())
            .map(MemberId::seed)
            .collect();

        if seeds.is_empty() {
            shared.membership.create();
        } else {
            self.contact_seeds(&seeds).await?;
        }

        shared
            .state
            .fetch_initial_state(shared.config.state_transfer_timeout())
            .await?;
        shared.transition(&[MemberStatus::Joining], MemberStatus::Serving);
        tracing::info!(
            "{} serving in view {}",
            local,
            shared.membership.current_view()
        );
        Ok(())
    }

    /// Ask the seeds to admit us until a view arrives, a seed rejects us, or
    /// the join timeout passes (then we start a group of our own).
    async fn contact_seeds(&self, seeds: &[MemberId]) -> Result<()> {
        let shared = &self.shared;
        let config = &shared.config;
        let mut views = shared.membership.subscribe();
        let mut rejection = shared.rejection.subscribe();
        let deadline = Instant::now() + config.join_timeout();

        loop {
            if shared.membership.is_member() {
                return Ok(());
            }
            if let Some(reason) = rejection.borrow_and_update().clone() {
                return Err(Error::Membership(format!("join rejected: {}", reason)));
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    "No member of {} answered within {:?}; forming a new group",
                    config.cluster,
                    config.join_timeout()
                );
                shared.membership.create();
                return Ok(());
            }

            for seed in seeds {
                send_or_log(
                    shared.network.as_ref(),
                    seed,
                    Message::JoinRequest {
                        cluster: config.cluster.clone(),
                    },
                );
            }
            let jitter = rand::thread_rng().gen_range(0..=config.join_retry_ms / 4);
            let wait = (config.join_retry() + Duration::from_millis(jitter)).min(deadline - now);
            tokio::select! {
                _ = views.changed() => {}
                _ = rejection.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Leave the group and stop all member tasks.
    ///
    /// Locks held by this member are released by the group once the
    /// departure is installed. Calling this twice is harmless.
    pub async fn leave(&self) -> Result<()> {
        let shared = &self.shared;
        if *shared.status.borrow() == MemberStatus::Left {
            return Ok(());
        }
        shared.leaving.store(true, Ordering::SeqCst);

        let local = shared.network.local().clone();
        let view = shared.membership.current_view();
        if view.contains(&local) {
            if shared.membership.is_coordinator() {
                match shared.membership.leave(&local) {
                    Ok(next) => shared.publish(&next, &[]),
                    Err(e) => tracing::debug!("Leave: {}", e),
                }
            } else if let Some(coordinator) = view.coordinator() {
                let mut views = shared.membership.subscribe();
                send_or_log(shared.network.as_ref(), coordinator, Message::LeaveRequest);
                let confirmed = matches!(
                    tokio::time::timeout(
                        shared.config.leave_timeout(),
                        views.wait_for(|v| !v.contains(&local)),
                    )
                    .await,
                    Ok(Ok(_))
                );
                if !confirmed {
                    tracing::warn!(
                        "{} did not confirm the leave within {:?}",
                        coordinator,
                        shared.config.leave_timeout()
                    );
                }
            }
        }

        shared.status.send_replace(MemberStatus::Left);
        shared.shutdown.send_replace(true);
        shared.network.shutdown();
        tracing::info!("{} left cluster {}", local, shared.config.cluster);
        Ok(())
    }

    pub fn id(&self) -> &MemberId {
        self.shared.network.local()
    }

    pub fn cluster(&self) -> &str {
        &self.shared.config.cluster
    }

    pub fn view(&self) -> View {
        self.shared.membership.current_view()
    }

    pub fn status(&self) -> MemberStatus {
        *self.shared.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<MemberStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_coordinator(&self) -> bool {
        self.shared.membership.is_coordinator()
    }

    /// Cluster-facing stock operations.
    pub fn stocks(&self) -> &ReplicatedStocks {
        &self.shared.stocks
    }

    /// The local replica, bypassing replication.
    pub fn store(&self) -> &ReplicatedMapStore {
        &self.shared.store
    }

    pub fn locks(&self) -> &DistributedLockService {
        &self.shared.locks
    }

    pub fn transport(&self) -> &ReplicationTransport {
        &self.shared.transport
    }

    pub fn membership(&self) -> &GroupMembership {
        &self.shared.membership
    }
}

impl Drop for Member {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl Shared {
    fn transition(&self, from: &[MemberStatus], to: MemberStatus) -> bool {
        self.status.send_if_modified(|status| {
            if from.contains(status) {
                *status = to;
                true
            } else {
                false
            }
        })
    }

    /// Send `view` to all its members except ourselves, plus `extra`.
    fn publish(&self, view: &View, extra: &[MemberId]) {
        let local = self.network.local();
        for member in view.members().iter().chain(extra) {
            if member != local {
                send_or_log(
                    self.network.as_ref(),
                    member,
                    Message::InstallView(view.clone()),
                );
            }
        }
    }

    fn handle(&self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        self.detector.heartbeat(&from);

        match message {
            Message::Heartbeat { view } => self.on_heartbeat(&from, view),
            Message::JoinRequest { cluster } => self.on_join_request(from, &cluster),
            Message::JoinRedirect { coordinator } => self.on_join_redirect(&coordinator),
            Message::JoinRejected { reason } => {
                tracing::warn!("{} rejected our join: {}", from, reason);
                self.rejection.send_replace(Some(reason));
            }
            Message::LeaveRequest => self.on_leave_request(from),
            Message::InstallView(view) => self.on_install_view(view),
            Message::Call {
                seq,
                call_id,
                reply,
                call,
            } => self.transport.deliver(from, seq, call_id, reply, call),
            Message::Reply { call_id, outcome } => self.transport.on_reply(&from, call_id, outcome),
            Message::StateRequest { request_id } => self.state.on_request(&from, request_id),
            Message::StateResponse {
                request_id,
                payload,
            } => self.state.on_response(&from, request_id, payload),
            Message::Lock(message) => self.locks.handle(&from, message),
        }
    }

    /// The coordinator resends the current view to a member that is behind
    /// it or no longer listed, so a lost `InstallView` is repaired.
    fn on_heartbeat(&self, from: &MemberId, installed: ViewId) {
        self.state.view_announced(from, installed);
        if !self.membership.is_coordinator() {
            return;
        }
        let view = self.membership.current_view();
        if !view.contains(from) {
            tracing::debug!("Heartbeat from non-member {}; sending view {}", from, view.id());
        } else if installed < view.id() {
            tracing::debug!("{} is on view {}; resending view {}", from, installed, view.id());
        } else {
            return;
        }
        send_or_log(self.network.as_ref(), from, Message::InstallView(view));
    }

    fn on_join_request(&self, from: MemberId, cluster: &str) {
        if cluster != self.config.cluster {
            tracing::warn!(
                "Rejecting {}: cluster {} is not {}",
                from,
                cluster,
                self.config.cluster
            );
            send_or_log(
                self.network.as_ref(),
                &from,
                Message::JoinRejected {
                    reason: format!(
                        "cluster {} does not match {}",
                        cluster, self.config.cluster
                    ),
                },
            );
            return;
        }

        let view = self.membership.current_view();
        let local = self.network.local();
        match view.coordinator() {
            None => tracing::debug!("Ignoring join request from {}: no group yet", from),
            Some(coordinator) if coordinator != local => send_or_log(
                self.network.as_ref(),
                &from,
                Message::JoinRedirect {
                    coordinator: coordinator.clone(),
                },
            ),
            Some(_) if view.contains(&from) => {
                send_or_log(self.network.as_ref(), &from, Message::InstallView(view))
            }
            Some(_) => match self.membership.join(from.clone()) {
                Ok(next) => {
                    tracing::info!("Admitted {}", from);
                    self.publish(&next, &[]);
                    self.transport.announce_view();
                }
                Err(e) => tracing::warn!("Could not admit {}: {}", from, e),
            },
        }
    }

    fn on_join_redirect(&self, coordinator: &MemberId) {
        if self.membership.is_member() {
            return;
        }
        tracing::debug!("Redirected to coordinator {}", coordinator);
        send_or_log(
            self.network.as_ref(),
            coordinator,
            Message::JoinRequest {
                cluster: self.config.cluster.clone(),
            },
        );
    }

    fn on_leave_request(&self, from: MemberId) {
        if !self.membership.is_coordinator() {
            tracing::debug!("Ignoring leave request from {}: not coordinator", from);
            return;
        }
        let view = self.membership.current_view();
        if !view.contains(&from) {
            send_or_log(self.network.as_ref(), &from, Message::InstallView(view));
            return;
        }
        match self.membership.leave(&from) {
            Ok(next) => {
                tracing::info!("{} left", from);
                self.publish(&next, &[from]);
                self.transport.announce_view();
            }
            Err(e) => tracing::warn!("Leave of {} failed: {}", from, e),
        }
    }

    fn on_install_view(&self, view: View) {
        let local = self.network.local();
        let was_member = self.membership.is_member();
        let excluded = !view.contains(local);
        if !self.membership.install(view) {
            return;
        }
        self.transport.announce_view();
        if excluded && was_member && !self.leaving.load(Ordering::SeqCst) {
            tracing::warn!("{} was excluded from the group", local);
            self.transition(
                &[MemberStatus::Serving, MemberStatus::Isolated, MemberStatus::Joining],
                MemberStatus::Excluded,
            );
        }
    }

    /// Heartbeat the view, update reachability and evict silent members.
    fn check_group(&self) {
        let view = self.membership.current_view();
        let local = self.network.local();
        if !view.contains(local) {
            return;
        }
        self.transport.announce_view();

        let status = *self.status.borrow();
        if !matches!(status, MemberStatus::Serving | MemberStatus::Isolated) {
            return;
        }

        let suspects = self.detector.suspects(&view);
        let reachable: Vec<&MemberId> = view
            .members()
            .iter()
            .filter(|m| !suspects.contains(m))
            .collect();
        if reachable.len() * 2 <= view.len() {
            if self.transition(&[MemberStatus::Serving], MemberStatus::Isolated) {
                tracing::warn!(
                    "Isolated: only {} of {} members reachable",
                    reachable.len(),
                    view.len()
                );
            }
            return;
        }
        if self.transition(&[MemberStatus::Isolated], MemberStatus::Serving) {
            tracing::info!("Reachable majority restored in view {}", view.id());
        }

        if suspects.is_empty() || reachable.first().copied() != Some(local) {
            return;
        }
        let names: Vec<String> = suspects.iter().map(|m| m.to_string()).collect();
        tracing::warn!("Evicting unresponsive member(s): {}", names.join(", "));
        match self.membership.evict(&suspects) {
            Ok(next) => {
                self.publish(&next, &suspects);
                self.transport.announce_view();
            }
            Err(e) => tracing::debug!("Eviction skipped: {}", e),
        }
    }
}

async fn dispatch(shared: Arc<Shared>, mut inbox: Inbox, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            envelope = inbox.recv() => match envelope {
                Some(envelope) => shared.handle(envelope),
                None => break,
            }
        }
    }
    tracing::debug!("Dispatch loop for {} stopped", shared.network.local());
}

async fn tick(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(shared.config.heartbeat_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => shared.check_group(),
        }
    }
}
