//! Joins, leaves, eviction and isolation

mod common;

use common::{cluster, config, eventually, start, start_with};
use stockgroup::transport::Message;
use stockgroup::{Error, MemberStatus, MemoryNetwork, ViewId};

#[tokio::test]
async fn test_members_agree_on_views() {
    let net = MemoryNetwork::new();
    let members = cluster(&net, &["A", "B", "C"]).await;

    let view = members[0].view();
    assert_eq!(view.id(), ViewId(3));
    assert_eq!(view.coordinator(), Some(members[0].id()));
    for member in &members {
        assert_eq!(member.view(), view);
        assert_eq!(member.status(), MemberStatus::Serving);
    }
    assert_eq!(view.rank(members[2].id()), Some(2));
}

#[tokio::test]
async fn test_join_through_non_coordinator_seed() {
    let net = MemoryNetwork::new();
    let members = cluster(&net, &["A", "B"]).await;

    // C only knows B, which redirects it to A
    let c = start(&net, "C", &["mem://B"]).await;
    eventually(|| members.iter().all(|m| m.view().len() == 3)).await;
    assert_eq!(c.view().coordinator(), Some(members[0].id()));
}

#[tokio::test]
async fn test_leave_installs_smaller_view() {
    let net = MemoryNetwork::new();
    let members = cluster(&net, &["A", "B", "C"]).await;
    let before = members[0].view().id();

    members[1].leave().await.unwrap();
    assert_eq!(members[1].status(), MemberStatus::Left);
    eventually(|| members[2].view().len() == 2).await;
    assert!(members[0].view().id() > before);
    assert!(!members[2].view().contains(members[1].id()));

    // Leaving twice is harmless
    members[1].leave().await.unwrap();
}

#[tokio::test]
async fn test_coordinator_leave_hands_over() {
    let net = MemoryNetwork::new();
    let members = cluster(&net, &["A", "B", "C"]).await;

    members[0].leave().await.unwrap();
    eventually(|| members[1].view().len() == 2 && members[2].view().len() == 2).await;
    assert!(members[1].is_coordinator());
    members[2].stocks().set("AAPL", 150.0).await.unwrap();
    assert_eq!(members[1].stocks().get("AAPL").unwrap(), Some(150.0));
}

#[tokio::test]
async fn test_crashed_member_is_evicted() {
    let net = MemoryNetwork::new();
    let members = cluster(&net, &["A", "B", "C"]).await;

    net.crash(members[2].id());
    eventually(|| members[0].view().len() == 2 && members[1].view().len() == 2).await;
    assert_eq!(members[0].status(), MemberStatus::Serving);

    let responses = members[1].stocks().set("AAPL", 150.0).await.unwrap();
    assert_eq!(responses.len(), 2);
    assert!(responses.is_complete());
}

#[tokio::test]
async fn test_minority_member_becomes_isolated() {
    let net = MemoryNetwork::new();
    let members = cluster(&net, &["A", "B"]).await;
    members[0].stocks().set("AAPL", 150.0).await.unwrap();

    net.crash(members[1].id());
    eventually(|| members[0].status() == MemberStatus::Isolated).await;

    // No majority: no eviction, no writes, reads still local
    assert_eq!(members[0].view().len(), 2);
    assert!(matches!(
        members[0].stocks().set("AAPL", 1.0).await,
        Err(Error::Membership(_))
    ));
    assert_eq!(members[0].stocks().get("AAPL").unwrap(), Some(150.0));
}

#[tokio::test]
async fn test_silent_member_learns_it_was_excluded() {
    let net = MemoryNetwork::new();
    let members = cluster(&net, &["A", "B", "C"]).await;

    let c = members[2].id().clone();
    net.drop_when(move |from, _, message| from == &c && matches!(message, Message::Heartbeat { .. }));

    eventually(|| members[2].status() == MemberStatus::Excluded).await;
    assert_eq!(members[0].view().len(), 2);
    assert!(members[2].stocks().set("AAPL", 1.0).await.is_err());
}

#[tokio::test]
async fn test_cluster_name_mismatch_is_rejected() {
    let net = MemoryNetwork::new();
    let _a = start(&net, "A", &[]).await;

    let mut other = config("B", &["mem://A"]);
    other.cluster = "other".to_string();
    match start_with(&net, other).await {
        Err(Error::Membership(msg)) => assert!(msg.contains("rejected")),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("join across clusters should fail"),
    }
}

#[tokio::test]
async fn test_unanswered_seeds_form_new_group() {
    let net = MemoryNetwork::new();
    let mut lonely = config("A", &["mem://nobody"]);
    lonely.join_timeout_ms = 100;

    let a = match start_with(&net, lonely).await {
        Ok(member) => member,
        Err(e) => panic!("join failed: {}", e),
    };
    assert_eq!(a.view().len(), 1);
    assert!(a.is_coordinator());
    assert_eq!(a.status(), MemberStatus::Serving);
}
