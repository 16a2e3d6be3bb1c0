//! Group membership: the current view and its subscribers
//!
//! Views are only ever replaced by a newer one. Every accepted view is handed
//! to registered listeners in registration order, and published on a watch
//! channel for tasks that just need the latest view.

use crate::common::Result;
use crate::group::view::{MemberId, View};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

/// Receives every view this member accepts, in order.
pub trait MembershipListener: Send + Sync {
    fn view_accepted(&self, view: &View, previous: &View);
}

pub struct GroupMembership {
    local: MemberId,
    view: watch::Sender<View>,
    listeners: Mutex<Vec<Arc<dyn MembershipListener>>>,
    /// Serializes installs so listeners see views in id order
    installing: Mutex<()>,
}

impl GroupMembership {
    pub fn new(local: MemberId) -> Self {
        let (view, _) = watch::channel(View::empty());
        Self {
            local,
            view,
            listeners: Mutex::new(Vec::new()),
            installing: Mutex::new(()),
        }
    }

    pub fn local(&self) -> &MemberId {
        &self.local
    }

    pub fn current_view(&self) -> View {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<View> {
        self.view.subscribe()
    }

    pub fn register(&self, listener: Arc<dyn MembershipListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn is_member(&self) -> bool {
        self.view.borrow().contains(&self.local)
    }

    pub fn is_coordinator(&self) -> bool {
        self.view.borrow().coordinator() == Some(&self.local)
    }

    pub fn coordinator(&self) -> Option<MemberId> {
        self.view.borrow().coordinator().cloned()
    }

    /// Accept `view` if it is newer than the current one.
    ///
    /// Returns false for stale or duplicate views.
    pub fn install(&self, view: View) -> bool {
        let _installing = self.installing.lock();
        self.install_locked(view)
    }

    fn install_locked(&self, view: View) -> bool {
        let mut previous = None;
        self.view.send_if_modified(|current| {
            if view.id() <= current.id() {
                return false;
            }
            previous = Some(std::mem::replace(current, view.clone()));
            true
        });
        let Some(previous) = previous else {
            tracing::debug!("Ignoring stale view {} on {}", view, self.local);
            return false;
        };

        tracing::info!("View: {}", view);
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.view_accepted(&view, &previous);
        }
        true
    }

    /// Derive the next view from the current one and install it, with no
    /// other install in between.
    fn change(&self, next: impl FnOnce(&View) -> Result<View>) -> Result<View> {
        let _installing = self.installing.lock();
        let view = next(&self.current_view())?;
        self.install_locked(view.clone());
        Ok(view)
    }

    /// Form a new group with this member as its only member.
    pub fn create(&self) -> View {
        let view = View::singleton(self.local.clone());
        self.install(view.clone());
        view
    }

    /// Admit `member` (coordinator side) and install the resulting view.
    pub fn join(&self, member: MemberId) -> Result<View> {
        self.change(|current| current.joined(member))
    }

    /// Remove `member` (coordinator side) and install the resulting view.
    pub fn leave(&self, member: &MemberId) -> Result<View> {
        self.evict(std::slice::from_ref(member))
    }

    /// Remove several members at once and install the resulting view.
    pub fn evict(&self, members: &[MemberId]) -> Result<View> {
        self.change(|current| current.without(members))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::view::ViewId;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(ViewId, ViewId)>>,
    }

    impl MembershipListener for Recorder {
        fn view_accepted(&self, view: &View, previous: &View) {
            self.seen.lock().push((previous.id(), view.id()));
        }
    }

    fn member(name: &str) -> MemberId {
        MemberId::new(name, format!("mem://{}", name))
    }

    #[test]
    fn test_views_delivered_in_order() {
        let a = member("A");
        let membership = GroupMembership::new(a.clone());
        let recorder = Arc::new(Recorder::default());
        membership.register(recorder.clone());

        membership.create();
        membership.join(member("B")).unwrap();
        let v3 = membership.join(member("C")).unwrap();

        assert_eq!(membership.current_view(), v3);
        assert!(membership.is_coordinator());
        assert_eq!(
            *recorder.seen.lock(),
            vec![
                (ViewId(0), ViewId(1)),
                (ViewId(1), ViewId(2)),
                (ViewId(2), ViewId(3))
            ]
        );
    }

    #[test]
    fn test_stale_view_ignored() {
        let a = member("A");
        let membership = GroupMembership::new(a.clone());
        let v1 = membership.create();
        let v2 = membership.join(member("B")).unwrap();

        assert!(!membership.install(v1));
        assert_eq!(membership.current_view(), v2);
    }

    #[test]
    fn test_leave_moves_coordinator() {
        let a = member("A");
        let b = member("B");
        let membership = GroupMembership::new(b.clone());
        membership.install(View::singleton(a.clone()).joined(b.clone()).unwrap());
        assert!(!membership.is_coordinator());

        membership.leave(&a).unwrap();
        assert!(membership.is_coordinator());
        assert!(membership.is_member());
    }

    #[tokio::test]
    async fn test_subscribe_sees_latest_view() {
        let a = member("A");
        let membership = GroupMembership::new(a.clone());
        let mut rx = membership.subscribe();

        membership.create();
        rx.changed().await.unwrap();
        assert!(rx.borrow().contains(&a));
    }
}
