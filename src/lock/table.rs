//! Coordinator-side lock table
//!
//! Only the coordinator of the current view runs a live table. Each lock is
//! either free or held by one member, with a FIFO of waiters. Processing a
//! message never sends anything itself: grants are pushed to an outbox the
//! caller delivers once the table lock is released.
//!
//! When a member becomes coordinator it starts from an empty table and
//! rebuilds it from `Reconcile` reports. Until every member of the view has
//! reported, other requests are deferred so nothing can be granted twice.

use crate::group::view::{MemberId, View, ViewId};
use crate::transport::message::LockMessage;
use std::collections::{HashMap, HashSet, VecDeque};

pub(crate) type Outbox = Vec<(MemberId, LockMessage)>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Holder {
    member: MemberId,
    token: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Waiter {
    member: MemberId,
    request_id: u64,
}

#[derive(Debug, Default)]
struct LockEntry {
    holder: Option<Holder>,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug)]
struct Reconciliation {
    view: ViewId,
    awaiting: HashSet<MemberId>,
}

#[derive(Debug)]
pub(crate) struct LockTable {
    local: MemberId,
    view: ViewId,
    active: bool,
    locks: HashMap<String, LockEntry>,
    next_token: u64,
    reconciling: Option<Reconciliation>,
    deferred: Vec<(MemberId, LockMessage)>,
}

impl LockTable {
    pub(crate) fn new(local: MemberId) -> Self {
        Self {
            local,
            view: ViewId::default(),
            active: false,
            locks: HashMap::new(),
            next_token: 1,
            reconciling: None,
            deferred: Vec::new(),
        }
    }

    /// Current holder of `name`, if any.
    pub(crate) fn holder(&self, name: &str) -> Option<(&MemberId, u64)> {
        self.locks
            .get(name)?
            .holder
            .as_ref()
            .map(|h| (&h.member, h.token))
    }

    pub(crate) fn waiting(&self, name: &str) -> usize {
        self.locks.get(name).map(|e| e.waiters.len()).unwrap_or(0)
    }

    pub(crate) fn is_reconciling(&self) -> bool {
        self.reconciling.is_some()
    }

    /// Adjust the table to a newly installed view.
    pub(crate) fn view_changed(&mut self, view: &View, previous: &View, outbox: &mut Outbox) {
        self.view = view.id();
        let is_coordinator = view.coordinator() == Some(&self.local);
        let was_coordinator = previous.coordinator() == Some(&self.local);

        if !is_coordinator {
            self.active = false;
            self.locks.clear();
            self.reconciling = None;
            // Keep early reports for a view we have not installed yet
            let current = self.view;
            self.deferred.retain(|(_, m)| {
                matches!(m, LockMessage::Reconcile { view, .. } if *view > current)
            });
            return;
        }

        if was_coordinator {
            let departed = view.departed_since(previous);
            self.drop_members(&departed, outbox);
            let finished = match self.reconciling.as_mut() {
                Some(r) => {
                    r.awaiting.retain(|m| view.contains(m));
                    r.awaiting.is_empty()
                }
                None => false,
            };
            if finished {
                self.finish_reconciliation(outbox);
            }
        } else {
            self.active = true;
            self.locks.clear();
            if previous.is_empty() && view.len() == 1 {
                tracing::debug!("Lock table started for new group");
            } else {
                tracing::info!("Rebuilding lock table for view {}", view.id());
                self.reconciling = Some(Reconciliation {
                    view: view.id(),
                    awaiting: view.members().iter().cloned().collect(),
                });
            }
        }

        self.replay_deferred(outbox);
    }

    pub(crate) fn process(&mut self, from: MemberId, message: LockMessage, outbox: &mut Outbox) {
        if let LockMessage::Reconcile {
            view,
            held,
            pending,
            max_token,
        } = message
        {
            self.reconcile(from, view, held, pending, max_token, outbox);
            return;
        }
        if !self.active || self.reconciling.is_some() {
            self.deferred.push((from, message));
            return;
        }

        match message {
            LockMessage::Acquire { name, request_id } => {
                let entry = self.locks.entry(name.clone()).or_default();
                let duplicate = entry
                    .waiters
                    .iter()
                    .any(|w| w.member == from && w.request_id == request_id);
                if !duplicate {
                    entry.waiters.push_back(Waiter {
                        member: from,
                        request_id,
                    });
                }
                self.grant_next(&name, outbox);
            }
            LockMessage::Release { name, token } => {
                let Some(entry) = self.locks.get_mut(&name) else {
                    return;
                };
                let matches = entry
                    .holder
                    .as_ref()
                    .is_some_and(|h| h.token == token && h.member == from);
                if matches {
                    entry.holder = None;
                    self.grant_next(&name, outbox);
                } else {
                    tracing::debug!("Ignoring stale release of {} (token {}) from {}", name, token, from);
                }
            }
            LockMessage::Cancel { name, request_id } => {
                if let Some(entry) = self.locks.get_mut(&name) {
                    entry
                        .waiters
                        .retain(|w| !(w.member == from && w.request_id == request_id));
                }
                self.grant_next(&name, outbox);
            }
            LockMessage::Granted { .. } | LockMessage::Reconcile { .. } => {}
        }
    }

    fn reconcile(
        &mut self,
        from: MemberId,
        view: ViewId,
        held: Vec<(String, u64)>,
        pending: Vec<(String, u64)>,
        max_token: u64,
        outbox: &mut Outbox,
    ) {
        let expected = matches!(&self.reconciling, Some(r) if r.view == view);
        if !expected {
            if view > self.view {
                self.deferred.push((
                    from,
                    LockMessage::Reconcile {
                        view,
                        held,
                        pending,
                        max_token,
                    },
                ));
            }
            return;
        }

        self.next_token = self.next_token.max(max_token + 1);
        for (name, token) in held {
            self.next_token = self.next_token.max(token + 1);
            let entry = self.locks.entry(name.clone()).or_default();
            match &entry.holder {
                None => {
                    entry.holder = Some(Holder {
                        member: from.clone(),
                        token,
                    })
                }
                Some(existing) => tracing::warn!(
                    "Lock {} reported held by both {} and {}; keeping {}",
                    name,
                    existing.member,
                    from,
                    existing.member
                ),
            }
        }
        for (name, request_id) in pending {
            self.locks
                .entry(name)
                .or_default()
                .waiters
                .push_back(Waiter {
                    member: from.clone(),
                    request_id,
                });
        }

        let finished = match self.reconciling.as_mut() {
            Some(r) => {
                r.awaiting.remove(&from);
                r.awaiting.is_empty()
            }
            None => false,
        };
        if finished {
            self.finish_reconciliation(outbox);
        }
    }

    fn finish_reconciliation(&mut self, outbox: &mut Outbox) {
        self.reconciling = None;
        tracing::info!(
            "Lock table rebuilt for view {} ({} lock(s))",
            self.view,
            self.locks.len()
        );
        let names: Vec<String> = self.locks.keys().cloned().collect();
        for name in names {
            self.grant_next(&name, outbox);
        }
        self.replay_deferred(outbox);
    }

    fn replay_deferred(&mut self, outbox: &mut Outbox) {
        if !self.active {
            return;
        }
        let deferred = std::mem::take(&mut self.deferred);
        for (from, message) in deferred {
            self.process(from, message, outbox);
        }
    }

    /// Force-release locks held by departed members and drop their waiters.
    fn drop_members(&mut self, departed: &[MemberId], outbox: &mut Outbox) {
        if departed.is_empty() {
            return;
        }
        for (name, entry) in self.locks.iter_mut() {
            if let Some(holder) = &entry.holder {
                if departed.contains(&holder.member) {
                    tracing::info!("Releasing lock {} held by departed {}", name, holder.member);
                    entry.holder = None;
                }
            }
            entry.waiters.retain(|w| !departed.contains(&w.member));
        }
        let names: Vec<String> = self.locks.keys().cloned().collect();
        for name in names {
            self.grant_next(&name, outbox);
        }
    }

    fn grant_next(&mut self, name: &str, outbox: &mut Outbox) {
        let Some(entry) = self.locks.get_mut(name) else {
            return;
        };
        if entry.holder.is_none() {
            if let Some(waiter) = entry.waiters.pop_front() {
                let token = self.next_token;
                self.next_token += 1;
                entry.holder = Some(Holder {
                    member: waiter.member.clone(),
                    token,
                });
                outbox.push((
                    waiter.member,
                    LockMessage::Granted {
                        name: name.to_string(),
                        request_id: waiter.request_id,
                        token,
                    },
                ));
            }
        }
        if entry.holder.is_none() && entry.waiters.is_empty() {
            self.locks.remove(name);
        }
    }
}
