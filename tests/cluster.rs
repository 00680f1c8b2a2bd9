//! Integration tests driving a `Cluster` over real loopback TCP: honest
//! agreement, traitor tolerance, a faulty primary, quorum-bound warnings,
//! and dynamic membership, end to end rather than through a single engine
//! in isolation (see `src/engine.rs`'s unit tests for that level).

use std::time::Duration;

use generals::cli::Args;
use generals::membership::Cluster;
use generals::wire::{Order, PeerId};

fn args(generals: usize, base_port: u16) -> Args {
    Args {
        generals,
        host: "127.0.0.1".to_string(),
        base_port,
    }
}

#[tokio::test]
async fn three_honest_generals_agree_on_attack() {
    let cluster = Cluster::bootstrap(&args(3, 21000)).await.unwrap();

    let (decision, votes) = cluster.send_order(Order::Attack).await.unwrap();
    assert_eq!(decision, Order::Attack);
    assert_eq!(votes.len(), 3);
    assert!(votes.values().all(|v| *v == Order::Attack));
}

#[tokio::test]
async fn one_faulty_secondary_out_of_four_does_not_break_agreement() {
    let mut cluster = Cluster::bootstrap(&args(4, 21010)).await.unwrap();
    cluster.set_state(&PeerId::from("G1"), true).await.unwrap();

    let (decision, votes) = cluster.send_order(Order::Retreat).await.unwrap();
    assert_eq!(decision, Order::Retreat);
    assert_eq!(votes.len(), 4);
    // the 3 honest generals must still agree with each other even though
    // G1's forwarded/reported values are randomized.
    let honest: Vec<Order> = votes
        .iter()
        .filter(|(id, _)| id.0 != "G1")
        .map(|(_, v)| *v)
        .collect();
    assert!(honest.iter().all(|v| *v == Order::Retreat));
}

#[tokio::test]
async fn quorum_warning_absent_below_the_byzantine_bound() {
    let mut cluster = Cluster::bootstrap(&args(4, 21020)).await.unwrap();
    assert!(cluster.quorum_warning().is_none());

    cluster.set_state(&PeerId::from("G1"), true).await.unwrap();
    assert!(cluster.quorum_warning().is_none(), "3*1+1 == 4 still satisfies n >= 3f+1");
}

#[tokio::test]
async fn quorum_warning_fires_past_the_byzantine_bound() {
    let mut cluster = Cluster::bootstrap(&args(3, 21030)).await.unwrap();
    cluster.set_state(&PeerId::from("G0"), true).await.unwrap();
    assert!(cluster.quorum_warning().is_none());

    cluster.set_state(&PeerId::from("G1"), true).await.unwrap();
    assert!(
        cluster.quorum_warning().is_some(),
        "2 faulty out of 3 violates 3*2+1 <= 3"
    );
}

#[tokio::test]
async fn g_add_grows_the_cluster_and_joins_future_rounds() {
    let mut cluster = Cluster::bootstrap(&args(3, 21040)).await.unwrap();
    cluster.add_nodes(1).await;
    assert_eq!(cluster.engines.len(), 4);

    let (_, votes) = cluster.send_order(Order::Attack).await.unwrap();
    assert_eq!(votes.len(), 4);
    assert!(votes.contains_key(&PeerId::from("G3")));
}

#[tokio::test]
async fn g_kill_on_primary_elects_the_next_lowest_id() {
    let mut cluster = Cluster::bootstrap(&args(3, 21050)).await.unwrap();
    cluster.remove_node(&PeerId::from("G0")).await.unwrap();

    assert_eq!(cluster.client.primary().await.0, PeerId::from("G1"));

    let (decision, votes) = cluster.send_order(Order::Attack).await.unwrap();
    assert_eq!(decision, Order::Attack);
    assert_eq!(votes.len(), 2);
}

#[tokio::test]
async fn g_kill_unknown_peer_is_rejected() {
    let mut cluster = Cluster::bootstrap(&args(3, 21060)).await.unwrap();
    let err = cluster.remove_node(&PeerId::from("G9")).await.unwrap_err();
    assert_matches::assert_matches!(err, generals::error::MembershipError::UnknownPeer(_));
}

#[tokio::test]
async fn faulty_primary_secondaries_still_agree_with_each_other() {
    let mut cluster = Cluster::bootstrap(&args(4, 21070)).await.unwrap();
    cluster.set_state(&PeerId::from("G0"), true).await.unwrap();

    let (_, votes) = cluster.send_order(Order::Attack).await.unwrap();
    let secondary_majorities: Vec<Order> = votes
        .iter()
        .filter(|(id, _)| id.0 != "G0")
        .map(|(_, v)| *v)
        .collect();
    assert_eq!(secondary_majorities.len(), 3);
    let first = secondary_majorities[0];
    assert!(
        secondary_majorities.iter().all(|v| *v == first),
        "honest secondaries relay the same three primary-sent values to each \
         other, so they must all land on the same majority (or all undecided) \
         regardless of what the faulty primary sent each of them: {secondary_majorities:?}"
    );
}

#[tokio::test]
async fn g_kill_on_non_primary_secondary_mid_round_does_not_hang_the_primary() {
    let cluster = Cluster::bootstrap(&args(4, 21080)).await.unwrap();
    let g0 = cluster.engines[&PeerId::from("G0")].clone();
    let g1 = cluster.engines[&PeerId::from("G1")].clone();
    let g2 = cluster.engines[&PeerId::from("G2")].clone();
    let g3_id = PeerId::from("G3");

    let round = tokio::spawn({
        let g0 = g0.clone();
        async move { g0.handle_client_order(Order::Attack).await }
    });

    // give the round a chance to actually start before G3 is pulled out from
    // under it; the round must still close whether this lands before G3's
    // vote arrives, mid-flight, or after.
    tokio::task::yield_now().await;

    for engine in [&g0, &g1, &g2] {
        engine.remove_node(&g3_id).await.unwrap();
    }

    let votes = tokio::time::timeout(Duration::from_secs(2), round)
        .await
        .expect("primary's round must close once the missing peer's vote is synthesized, not hang forever")
        .unwrap()
        .unwrap();
    assert_eq!(votes.get(&PeerId::from("G0")), Some(&Order::Attack));
}
