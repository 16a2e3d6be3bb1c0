//! Two members talking over real sockets

mod common;

use common::eventually;
use stockgroup::store::swapped;
use stockgroup::{Member, Network, TcpNetwork};

#[tokio::test]
async fn test_tcp_round_trip() {
    let (a_net, a_inbox) = TcpNetwork::bind("A", "127.0.0.1:0".parse().unwrap(), None)
        .await
        .unwrap();
    let a_addr = a_net.local().addr().to_string();
    let a = match Member::join(a_net, a_inbox, common::config("A", &[])).await {
        Ok(member) => member,
        Err(e) => panic!("A failed to start: {}", e),
    };
    a.stocks().set("AAPL", 150.0).await.unwrap();

    let (b_net, b_inbox) = TcpNetwork::bind("B", "127.0.0.1:0".parse().unwrap(), None)
        .await
        .unwrap();
    let b = match Member::join(b_net, b_inbox, common::config("B", &[a_addr.as_str()])).await {
        Ok(member) => member,
        Err(e) => panic!("B failed to join: {}", e),
    };
    assert_eq!(b.stocks().get("AAPL").unwrap(), Some(150.0));

    let responses = b.stocks().set("GOOG", 2800.0).await.unwrap();
    assert!(responses.is_complete());
    assert_eq!(a.stocks().get("GOOG").unwrap(), Some(2800.0));

    let responses = a.stocks().compare_and_swap("GOOG", 2800.0, 2900.0).await.unwrap();
    assert!(swapped(&responses));
    assert_eq!(b.stocks().get("GOOG").unwrap(), Some(2900.0));

    b.leave().await.unwrap();
    eventually(|| a.view().len() == 1).await;
    a.leave().await.unwrap();
}
