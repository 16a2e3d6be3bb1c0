//! Heartbeat-based failure detector
//!
//! Every message received from a member counts as a sign of life. A member
//! of the current view that stays silent longer than the liveness timeout is
//! suspected; eviction itself is the member runtime's decision.

use crate::group::membership::MembershipListener;
use crate::group::view::{MemberId, View};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub struct FailureDetector {
    local: MemberId,
    timeout: Duration,
    last_seen: Mutex<HashMap<MemberId, Instant>>,
}

impl FailureDetector {
    pub fn new(local: MemberId, timeout: Duration) -> Self {
        Self {
            local,
            timeout,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn heartbeat(&self, from: &MemberId) {
        self.last_seen.lock().insert(from.clone(), Instant::now());
    }

    /// Members of `view` (other than this one) silent for too long.
    pub fn suspects(&self, view: &View) -> Vec<MemberId> {
        let now = Instant::now();
        let last_seen = self.last_seen.lock();
        view.members()
            .iter()
            .filter(|m| **m != self.local)
            .filter(|m| match last_seen.get(*m) {
                Some(seen) => now.duration_since(*seen) > self.timeout,
                None => true,
            })
            .cloned()
            .collect()
    }
}

impl MembershipListener for FailureDetector {
    fn view_accepted(&self, view: &View, _previous: &View) {
        // New members get a full timeout before they can be suspected
        let now = Instant::now();
        let mut last_seen = self.last_seen.lock();
        last_seen.retain(|m, _| view.contains(m));
        for member in view.members() {
            last_seen.entry(member.clone()).or_insert(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str) -> MemberId {
        MemberId::new(name, format!("mem://{}", name))
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_member_suspected() {
        let a = member("A");
        let b = member("B");
        let c = member("C");
        let view = View::singleton(a.clone())
            .joined(b.clone())
            .unwrap()
            .joined(c.clone())
            .unwrap();

        let detector = FailureDetector::new(a.clone(), Duration::from_millis(100));
        detector.view_accepted(&view, &View::empty());
        assert!(detector.suspects(&view).is_empty());

        tokio::time::advance(Duration::from_millis(80)).await;
        detector.heartbeat(&b);
        tokio::time::advance(Duration::from_millis(80)).await;

        assert_eq!(detector.suspects(&view), vec![c]);
    }
}
