//! Replicated RPC: broadcast a call to every member of the view
//!
//! The sender stamps each call with a per-sender sequence number and pushes
//! it down every link while holding the send lock, so all receivers see one
//! sender's calls in the same order. SYNC calls then wait for one reply per
//! member of the view taken at call time; whatever has not answered by the
//! deadline is reported as timed out rather than failing the whole call.
//!
//! On the receiving side calls are applied one at a time by the member's
//! dispatch loop. While the member is still waiting for its initial state,
//! delivery is blocked and calls are queued; the delivery digest records the
//! last sequence number applied from each sender so calls already reflected
//! in a snapshot are not applied twice.

use crate::common::{Error, Result};
use crate::group::membership::{GroupMembership, MembershipListener};
use crate::group::view::{MemberId, View};
use crate::transport::message::{ApplicationError, Message, RpcCall, Value};
use crate::transport::network::{send_or_log, Network};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Last sequence number applied from each sender
pub type Digest = BTreeMap<MemberId, u64>;

/// Executes replicated calls against local state.
pub trait MutationHandler: Send + Sync {
    fn handle(&self, call: &RpcCall) -> std::result::Result<Value, ApplicationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Wait for every member of the view (or the timeout)
    Sync,
    /// Fire and forget
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    pub mode: CallMode,
    pub timeout: Duration,
}

impl CallOptions {
    pub fn sync(timeout: Duration) -> Self {
        Self {
            mode: CallMode::Sync,
            timeout,
        }
    }

    pub fn asynchronous() -> Self {
        Self {
            mode: CallMode::Async,
            timeout: Duration::ZERO,
        }
    }
}

/// Outcome of a call on one member
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Value(Value),
    /// The member's handler returned an error
    Failed(String),
    TimedOut,
    /// The member left the view before answering
    Departed,
    /// The call could not be sent
    Unreachable(String),
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Value(v) => write!(f, "{}", v),
            Response::Failed(e) => write!(f, "failed: {}", e),
            Response::TimedOut => write!(f, "timed out"),
            Response::Departed => write!(f, "departed"),
            Response::Unreachable(e) => write!(f, "unreachable: {}", e),
        }
    }
}

/// Per-member outcomes of one broadcast
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseSet {
    method: String,
    responses: BTreeMap<MemberId, Response>,
}

impl ResponseSet {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            responses: BTreeMap::new(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn get(&self, member: &MemberId) -> Option<&Response> {
        self.responses.get(member)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MemberId, &Response)> {
        self.responses.iter()
    }

    /// Every member answered with a value.
    pub fn is_complete(&self) -> bool {
        !self.responses.is_empty()
            && self
                .responses
                .values()
                .all(|r| matches!(r, Response::Value(_)))
    }

    /// The common value when every member answered with the same one.
    pub fn unanimous(&self) -> Option<&Value> {
        if !self.is_complete() {
            return None;
        }
        let mut values = self.responses.values().filter_map(|r| match r {
            Response::Value(v) => Some(v),
            _ => None,
        });
        let first = values.next()?;
        values.all(|v| v == first).then_some(first)
    }

    /// Members that did not answer in time or left mid-call.
    pub fn missing(&self) -> Vec<&MemberId> {
        self.responses
            .iter()
            .filter(|(_, r)| {
                matches!(
                    r,
                    Response::TimedOut | Response::Departed | Response::Unreachable(_)
                )
            })
            .map(|(m, _)| m)
            .collect()
    }

    /// All-or-error view of the set: the first handler failure, else a
    /// timeout if any member is missing.
    pub fn into_result(self) -> Result<Self> {
        if let Some((member, Response::Failed(message))) = self
            .responses
            .iter()
            .find(|(_, r)| matches!(r, Response::Failed(_)))
        {
            return Err(Error::Application {
                member: member.to_string(),
                message: message.clone(),
            });
        }
        let pending = self.missing().len();
        if pending > 0 {
            return Err(Error::TransportTimeout {
                method: self.method,
                pending,
            });
        }
        Ok(self)
    }
}

impl fmt::Display for ResponseSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (member, response) in &self.responses {
            writeln!(f, "  {}: {}", member, response)?;
        }
        Ok(())
    }
}

struct PendingCall {
    waiting: HashSet<MemberId>,
    responses: BTreeMap<MemberId, Response>,
    done: Option<oneshot::Sender<()>>,
}

impl PendingCall {
    fn record(&mut self, member: &MemberId, response: Response) {
        if !self.waiting.remove(member) {
            return;
        }
        self.responses.insert(member.clone(), response);
        if self.waiting.is_empty() {
            if let Some(done) = self.done.take() {
                let _ = done.send(());
            }
        }
    }
}

struct QueuedCall {
    from: MemberId,
    seq: u64,
    call_id: u64,
    reply: bool,
    call: RpcCall,
}

struct Delivery {
    blocked: bool,
    queue: Vec<QueuedCall>,
    digest: Digest,
}

pub struct ReplicationTransport {
    network: Arc<dyn Network>,
    membership: Arc<GroupMembership>,
    handler: Arc<dyn MutationHandler>,
    send_seq: Mutex<u64>,
    next_call_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    delivery: Mutex<Delivery>,
}

/// Removes a pending call if the waiting caller goes away early
struct PendingCleanup<'a> {
    pending: &'a Mutex<HashMap<u64, PendingCall>>,
    call_id: u64,
}

impl Drop for PendingCleanup<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.call_id);
    }
}

impl ReplicationTransport {
    /// Delivery starts blocked until the initial state is installed.
    pub fn new(
        network: Arc<dyn Network>,
        membership: Arc<GroupMembership>,
        handler: Arc<dyn MutationHandler>,
    ) -> Self {
        Self {
            network,
            membership,
            handler,
            send_seq: Mutex::new(0),
            next_call_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            delivery: Mutex::new(Delivery {
                blocked: true,
                queue: Vec::new(),
                digest: Digest::new(),
            }),
        }
    }

    /// Send `call` to every member of the current view, this one included.
    pub async fn broadcast_call(&self, call: RpcCall, options: CallOptions) -> Result<ResponseSet> {
        let local = self.network.local();
        let call_id = self.next_call_id.fetch_add(1, Ordering::SeqCst);
        let reply = options.mode == CallMode::Sync;
        let _cleanup = PendingCleanup {
            pending: &self.pending,
            call_id,
        };

        // The view is read under the send lock so a view announcement never
        // overtakes a call addressed to an older view.
        let (view, done, unreachable) = {
            let mut seq = self.send_seq.lock();
            let view = self.membership.current_view();
            if !view.contains(local) {
                return Err(Error::Membership(format!(
                    "{} is not a member of view {}",
                    local,
                    view.id()
                )));
            }

            let done = if reply {
                let (tx, rx) = oneshot::channel();
                self.pending.lock().insert(
                    call_id,
                    PendingCall {
                        waiting: view.members().iter().cloned().collect(),
                        responses: BTreeMap::new(),
                        done: Some(tx),
                    },
                );
                Some(rx)
            } else {
                None
            };

            *seq += 1;
            let mut failed = Vec::new();
            for member in view.members() {
                let message = Message::Call {
                    seq: *seq,
                    call_id,
                    reply,
                    call: call.clone(),
                };
                if let Err(e) = self.network.send(member, message) {
                    failed.push((member.clone(), e.to_string()));
                }
            }
            (view, done, failed)
        };
        tracing::debug!("Broadcast {} to view {} ({:?})", call, view.id(), options.mode);

        let Some(done) = done else {
            return Ok(ResponseSet::new(call.method));
        };
        for (member, reason) in unreachable {
            self.record(call_id, &member, Response::Unreachable(reason));
        }

        if tokio::time::timeout(options.timeout, done).await.is_err() {
            tracing::warn!("{} timed out after {:?}", call, options.timeout);
        }

        let mut set = ResponseSet::new(call.method);
        if let Some(pending) = self.pending.lock().remove(&call_id) {
            set.responses = pending.responses;
            for member in pending.waiting {
                set.responses.insert(member, Response::TimedOut);
            }
        }
        Ok(set)
    }

    fn record(&self, call_id: u64, member: &MemberId, response: Response) {
        if let Some(pending) = self.pending.lock().get_mut(&call_id) {
            pending.record(member, response);
        }
    }

    /// Reply from `from` to one of our calls.
    pub fn on_reply(&self, from: &MemberId, call_id: u64, outcome: std::result::Result<Value, String>) {
        let response = match outcome {
            Ok(value) => Response::Value(value),
            Err(message) => Response::Failed(message),
        };
        self.record(call_id, from, response);
    }

    /// Call received from `from`; applied now or queued while blocked.
    pub fn deliver(&self, from: MemberId, seq: u64, call_id: u64, reply: bool, call: RpcCall) {
        let queued = QueuedCall {
            from,
            seq,
            call_id,
            reply,
            call,
        };
        let mut delivery = self.delivery.lock();
        if delivery.blocked {
            tracing::debug!("Queueing {} from {} until state is installed", queued.call, queued.from);
            delivery.queue.push(queued);
            return;
        }
        self.apply(&mut delivery, queued);
    }

    fn apply(&self, delivery: &mut Delivery, queued: QueuedCall) {
        let QueuedCall {
            from,
            seq,
            call_id,
            reply,
            call,
        } = queued;

        let duplicate = delivery.digest.get(&from).is_some_and(|last| seq <= *last);
        let outcome = if duplicate {
            tracing::debug!("Skipping {} from {}: already in installed state", call, from);
            Ok(Value::Unit)
        } else {
            delivery.digest.insert(from.clone(), seq);
            self.handler.handle(&call).map_err(|e| {
                tracing::warn!("{} from {} failed: {}", call, from, e);
                e.0
            })
        };

        if reply {
            send_or_log(self.network.as_ref(), &from, Message::Reply { call_id, outcome });
        }
    }

    /// Tell every member of the current view, this one included, which view
    /// this member has installed.
    ///
    /// Sent under the send lock: each receiver gets this member's calls to
    /// earlier views before the announcement.
    pub fn announce_view(&self) {
        let _seq = self.send_seq.lock();
        let view = self.membership.current_view();
        if !view.contains(self.network.local()) {
            return;
        }
        for member in view.members() {
            send_or_log(
                self.network.as_ref(),
                member,
                Message::Heartbeat { view: view.id() },
            );
        }
    }

    pub fn is_delivery_blocked(&self) -> bool {
        self.delivery.lock().blocked
    }

    /// Run `capture` with delivery paused and return its result with the digest.
    ///
    /// Nothing can be applied in between, so the pair describes one instant.
    pub fn capture<T>(&self, capture: impl FnOnce() -> T) -> (T, Digest) {
        let delivery = self.delivery.lock();
        (capture(), delivery.digest.clone())
    }

    /// Unblock delivery after state install and replay queued calls.
    ///
    /// Calls covered by `digest` are acknowledged without being applied.
    /// Returns the number of queued calls processed.
    pub fn resume_delivery(&self, digest: Digest) -> usize {
        let mut delivery = self.delivery.lock();
        for (member, seq) in digest {
            let last = delivery.digest.entry(member).or_insert(0);
            *last = (*last).max(seq);
        }
        let queued = std::mem::take(&mut delivery.queue);
        delivery.blocked = false;
        let replayed = queued.len();
        for call in queued {
            self.apply(&mut delivery, call);
        }
        replayed
    }
}

impl MembershipListener for ReplicationTransport {
    fn view_accepted(&self, view: &View, previous: &View) {
        let departed = view.departed_since(previous);
        if departed.is_empty() {
            return;
        }
        for pending in self.pending.lock().values_mut() {
            for member in &departed {
                pending.record(member, Response::Departed);
            }
        }
        self.delivery
            .lock()
            .digest
            .retain(|member, _| !departed.contains(member));
    }
}
