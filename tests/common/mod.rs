//! Shared helpers for in-memory cluster tests

#![allow(dead_code)]

use std::time::Duration;
use stockgroup::{GroupConfig, Member, MemoryNetwork};
use tokio::time::Instant;

pub const CLUSTER: &str = "test";

/// Fast timeouts so failure detection happens within a test.
pub fn config(name: &str, seeds: &[&str]) -> GroupConfig {
    let mut config = GroupConfig::new(CLUSTER, name).with_seeds(seeds.iter().copied());
    config.join_timeout_ms = 1_000;
    config.join_retry_ms = 20;
    config.state_transfer_timeout_ms = 1_000;
    config.call_timeout_ms = 1_000;
    config.lock_timeout_ms = 1_000;
    config.heartbeat_interval_ms = 20;
    config.liveness_timeout_ms = 200;
    config.leave_timeout_ms = 500;
    config
}

pub fn addr(name: &str) -> String {
    format!("mem://{}", name)
}

pub async fn start_with(net: &MemoryNetwork, config: GroupConfig) -> stockgroup::Result<Member> {
    let (endpoint, inbox) = net.endpoint(&config.name);
    Member::join(endpoint, inbox, config).await
}

pub async fn start(net: &MemoryNetwork, name: &str, seeds: &[&str]) -> Member {
    match start_with(net, config(name, seeds)).await {
        Ok(member) => member,
        Err(e) => panic!("{} failed to join: {}", name, e),
    }
}

/// Start `names` in order, the first one forming the group.
pub async fn cluster(net: &MemoryNetwork, names: &[&str]) -> Vec<Member> {
    let seed = addr(names[0]);
    let mut members = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let seeds: Vec<&str> = if i == 0 { vec![] } else { vec![seed.as_str()] };
        members.push(start(net, name, &seeds).await);
    }
    let size = names.len();
    eventually(|| members.iter().all(|m| m.view().len() == size)).await;
    members
}

/// Poll `condition` until it holds, failing the test after 5 seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
