//! Replicated map behaviour across an in-memory group

mod common;

use common::{cluster, config, eventually, start, start_with};
use stockgroup::store::map::SET_STOCK;
use stockgroup::transport::{CallOptions, Message, Response, RpcCall};
use stockgroup::{Error, MemoryNetwork};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_sync_set_is_visible_everywhere() {
    let net = MemoryNetwork::new();
    let members = cluster(&net, &["A", "B", "C"]).await;

    let responses = members[1].stocks().set("AAPL", 150.0).await.unwrap();
    assert!(responses.is_complete());
    assert_eq!(responses.len(), 3);

    for member in &members {
        assert_eq!(member.stocks().get("AAPL").unwrap(), Some(150.0));
    }
}

#[tokio::test]
async fn test_calls_from_one_sender_apply_in_order() {
    let net = MemoryNetwork::new();
    let members = cluster(&net, &["A", "B", "C"]).await;

    members[2].stocks().set("IBM", 1.0).await.unwrap();
    members[2].stocks().set("IBM", 2.0).await.unwrap();
    for member in &members {
        assert_eq!(member.stocks().get("IBM").unwrap(), Some(2.0));
    }

    // Fire-and-forget calls must still land in send order
    for i in 0..50 {
        let call = RpcCall::new(SET_STOCK, vec!["MSFT".into(), (i as f64).into()]);
        members[0]
            .transport()
            .broadcast_call(call, CallOptions::asynchronous())
            .await
            .unwrap();
    }
    eventually(|| {
        members
            .iter()
            .all(|m| m.stocks().get("MSFT").unwrap() == Some(49.0))
    })
    .await;
}

#[tokio::test]
async fn test_remove_of_absent_key_succeeds() {
    let net = MemoryNetwork::new();
    let members = cluster(&net, &["A", "B"]).await;
    members[0].stocks().set("AAPL", 150.0).await.unwrap();

    let responses = members[1].stocks().remove("NOPE").await.unwrap();
    assert!(responses.into_result().is_ok());
    for member in &members {
        assert_eq!(member.stocks().all().unwrap().len(), 1);
    }

    members[1].stocks().remove("AAPL").await.unwrap();
    for member in &members {
        assert_eq!(member.stocks().get("AAPL").unwrap(), None);
    }
}

#[tokio::test]
async fn test_malformed_call_reports_application_error() {
    let net = MemoryNetwork::new();
    let members = cluster(&net, &["A", "B"]).await;

    let call = RpcCall::new(SET_STOCK, vec!["AAPL".into(), "cheap".into()]);
    let responses = members[0]
        .transport()
        .broadcast_call(call, CallOptions::sync(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(responses.len(), 2);
    assert!(responses
        .iter()
        .all(|(_, r)| matches!(r, Response::Failed(msg) if msg.contains("must be f64"))));
    assert!(matches!(
        responses.into_result(),
        Err(Error::Application { .. })
    ));

    // Members keep serving after a failed call
    members[1].stocks().set("AAPL", 150.0).await.unwrap();
    assert_eq!(members[0].stocks().get("AAPL").unwrap(), Some(150.0));
}

#[tokio::test]
async fn test_joiner_receives_snapshot() {
    let net = MemoryNetwork::new();
    let a = start(&net, "A", &[]).await;
    a.stocks().set("AAPL", 150.0).await.unwrap();
    a.stocks().set("GOOG", 2800.0).await.unwrap();

    let b = start(&net, "B", &["mem://A"]).await;
    assert_eq!(b.store().entries(), a.store().entries());
    assert_eq!(b.stocks().get("GOOG").unwrap(), Some(2800.0));

    // The joiner takes part in later writes
    b.stocks().set("AAPL", 151.0).await.unwrap();
    assert_eq!(a.stocks().get("AAPL").unwrap(), Some(151.0));
}

#[tokio::test]
async fn test_join_fails_without_state() {
    let net = MemoryNetwork::new();
    let a = start(&net, "A", &[]).await;
    a.stocks().set("AAPL", 150.0).await.unwrap();

    net.drop_when(|_, _, message| matches!(message, Message::StateRequest { .. }));
    let mut b_config = config("B", &["mem://A"]);
    b_config.state_transfer_timeout_ms = 200;

    match start_with(&net, b_config).await {
        Err(Error::StateTransfer(_)) => {}
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("join should fail without a snapshot"),
    }
    net.clear_drop_rule();

    // B left again, A is alone and still serving
    eventually(|| a.view().len() == 1).await;
    a.stocks().set("AAPL", 151.0).await.unwrap();
}

#[tokio::test]
async fn test_writes_rejected_after_leave() {
    let net = MemoryNetwork::new();
    let members = cluster(&net, &["A", "B"]).await;

    members[1].leave().await.unwrap();
    assert!(matches!(
        members[1].stocks().set("AAPL", 1.0).await,
        Err(Error::Membership(_))
    ));
    assert_eq!(members[0].view().len(), 1);
    members[0].stocks().set("AAPL", 2.0).await.unwrap();
}

#[tokio::test]
async fn test_member_that_missed_a_view_still_reaches_joiner() {
    let net = MemoryNetwork::new();
    let members = cluster(&net, &["A", "B"]).await;

    // Lose the view that admits C on its way to B
    let b = members[1].id().clone();
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = dropped.clone();
    net.drop_when(move |_, to, message| {
        to == &b && matches!(message, Message::InstallView(_)) && !flag.swap(true, Ordering::SeqCst)
    });

    let c = start(&net, "C", &[common::addr("A").as_str()]).await;
    assert!(dropped.load(Ordering::SeqCst));
    // C only got its state once B had caught up
    assert_eq!(members[1].view(), c.view());

    let responses = members[1].stocks().set("AAPL", 150.0).await.unwrap();
    assert!(responses.is_complete());
    assert_eq!(responses.len(), 3);
    assert_eq!(c.stocks().get("AAPL").unwrap(), Some(150.0));
}
