//! End-to-end workflows with many clients at once:
//! - Concurrent arrivals all end up paired
//! - Conversations stay isolated between pairs
//! - Churn re-pairs survivors and keeps the lobby consistent

mod common;

use common::*;
use pairchat_common::ServerEvent;
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn smoke_concurrent_arrivals_all_pair() {
    let (addr, state) = start_server().await;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            tokio::spawn(async move {
                let mut client = TestClient::connect(&addr).await;
                assert_eq!(client.recv_event().await, ServerEvent::Paired);
                client
            })
        })
        .collect();

    let mut clients = Vec::new();
    for handle in handles {
        clients.push(handle.await.unwrap());
    }

    let lobby = state.lobby();
    assert_eq!(lobby.online(), 10);
    assert_eq!(lobby.waiting(), 0);
    drop(lobby);

    let tokens: HashSet<_> = clients.iter().map(|c| c.identity.token.clone()).collect();
    assert_eq!(tokens.len(), 10, "every client gets its own token");
}

#[tokio::test]
async fn smoke_pairs_do_not_overhear_each_other() {
    let (addr, _state) = start_server().await;
    let (mut a, mut b) = paired_clients(&addr).await;
    let (mut c, mut d) = paired_clients(&addr).await;

    a.send_text("for b").await;
    c.send_text("for d").await;

    assert_eq!(b.recv_event().await, ServerEvent::Message("for b".to_string()));
    assert_eq!(d.recv_event().await, ServerEvent::Message("for d".to_string()));
    assert!(a.recv_event_timeout(Duration::from_millis(200)).await.is_none());
    assert!(c.recv_event_timeout(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn smoke_churn_repairs_survivors() {
    let (addr, state) = start_server().await;
    let (a, mut b) = paired_clients(&addr).await;
    let (c, mut d) = paired_clients(&addr).await;

    a.close().await;
    c.close().await;

    assert_eq!(b.recv_event().await, ServerEvent::Unpaired);
    assert_eq!(d.recv_event().await, ServerEvent::Unpaired);

    // b and d never blocked each other, so they meet next.
    assert_eq!(b.recv_event().await, ServerEvent::Paired);
    assert_eq!(d.recv_event().await, ServerEvent::Paired);

    b.send_text("hi stranger").await;
    assert_eq!(
        d.recv_event().await,
        ServerEvent::Message("hi stranger".to_string())
    );

    wait_for_online(&state, 2).await;
    assert_eq!(state.lobby().waiting(), 0);
}

#[tokio::test]
async fn smoke_reconnect_after_block_avoids_blocked_peer() {
    let (addr, state) = start_server().await;
    let (mut a, mut b) = paired_clients(&addr).await;
    let b_token = b.identity.token.clone();

    a.send(pairchat_common::ClientEvent::Block).await;
    assert_eq!(a.recv_event().await, ServerEvent::Blocked);
    assert_eq!(b.recv_event().await, ServerEvent::Blocked);

    b.close().await;
    wait_for_online(&state, 1).await;

    let mut b_again = TestClient::connect_with(
        &addr,
        Some(b_token.as_str()),
        Some(pairchat_common::types::PROTOCOL_VERSION),
    )
    .await;
    assert_eq!(b_again.identity.token, b_token);
    assert!(b_again
        .recv_event_timeout(Duration::from_millis(300))
        .await
        .is_none());
    assert_eq!(state.lobby().waiting(), 2);
}
