mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use hashring_rehash::{
    Address, ClusterNode, CommandHandler, CommandKind, DataStore, DistributionConfig,
    LoggerState, Mapping, OwnerLookup, RehashCommand, RehashCoordinator, RehashError,
    RehashPhase, Response,
};
use pretty_assertions::assert_eq;

use common::{TestCluster, fast_config, init_tracing};

const KEYS: usize = 50;

fn key(n: usize) -> String {
    format!("key-{n}")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_write_is_lost_while_a_member_joins() {
    init_tracing();
    let mut cluster = TestCluster::start(&["A", "B"], fast_config());
    let a = cluster.node("A");
    let b = cluster.node("B");

    a.put("k", "v1").await.unwrap();
    for n in 0..KEYS {
        a.put(key(n), format!("value-{n}")).await.unwrap();
    }
    // two members, two owners: both hold everything
    assert_eq!(b.store().len(), KEYS + 1);

    cluster
        .network
        .delay_commands(CommandKind::PullState, Duration::from_millis(150));

    let c = cluster.add_joiner("C");
    let coordinator = Arc::new(RehashCoordinator::join(Arc::clone(&c)));
    let mut phases = coordinator.subscribe();

    let running = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.run().await }
    });

    tokio::time::timeout(
        Duration::from_secs(2),
        phases.wait_for(|phase| *phase == RehashPhase::PullState),
    )
    .await
    .unwrap()
    .unwrap();

    // mid-transition every member routes through the union
    assert!(a.accepted_mapping().is_union());
    assert_eq!(c.logger().state(), LoggerState::Enabled);
    for node in [&a, &b, &c] {
        assert_eq!(node.get("k").await.unwrap(), Some(b"v1".to_vec()));
    }

    a.put("during", "v2").await.unwrap();
    a.put("k", "v1").await.unwrap();

    let new = running.await.unwrap().unwrap();
    assert_eq!(new.len(), 3);
    assert_eq!(coordinator.phase(), RehashPhase::Done);
    assert_eq!(c.logger().state(), LoggerState::Disabled);

    let owners = new.locate("k", 2);
    assert!(
        cluster
            .nodes()
            .filter(|node| owners.contains(node.address()))
            .any(|node| node.store().get("k").map(|e| e.value) == Some(b"v1".to_vec()))
    );

    for node in cluster.nodes() {
        assert_eq!(node.accepted_mapping(), Mapping::Single(Arc::clone(&new)));
        assert_eq!(node.get("k").await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(node.get("during").await.unwrap(), Some(b"v2".to_vec()));
    }

    let hinted = coordinator.wait_for_invalidation().await;
    assert!(hinted > 0);

    // every copy left is owned, and every owner has its copy
    for node in cluster.nodes() {
        for stored in node.store().keys() {
            assert!(
                new.is_owner(node.address(), stored.as_str(), 2),
                "{} still holds {stored}",
                node.address()
            );
        }
    }
    for n in 0..KEYS {
        for owner in new.locate(key(n).as_str(), 2) {
            let holder = cluster.node(owner.as_str());
            assert_eq!(
                holder.store().get(&key(n)).map(|e| e.value),
                Some(format!("value-{n}").into_bytes())
            );
        }
    }
}

#[tokio::test]
async fn join_times_out_when_the_mapping_never_arrives() {
    init_tracing();
    let config = DistributionConfig::default()
        .with_rpc_timeout(Duration::from_millis(50))
        .with_retry_backoff(Duration::from_millis(10), Duration::from_millis(20))
        .with_deadline(Duration::from_millis(300));

    let mut cluster = TestCluster::start(&["A", "B"], config);
    cluster
        .network
        .drop_commands(CommandKind::GetCurrentMapping, 1.0);

    let c = cluster.add_joiner("C");
    let coordinator = RehashCoordinator::join(Arc::clone(&c));

    let started = Instant::now();
    let result = coordinator.run().await;
    let elapsed = started.elapsed();

    assert_eq!(
        result,
        Err(RehashError::Timeout {
            phase: RehashPhase::FetchOldMapping
        })
    );
    assert!(result.unwrap_err().is_retryable());
    assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(300 + 20 + 250), "{elapsed:?}");

    assert_eq!(coordinator.phase(), RehashPhase::Failed);
    assert_eq!(c.logger().state(), LoggerState::Disabled);
    assert_eq!(cluster.node("A").accepted_mapping().target().len(), 2);
}

#[tokio::test]
async fn failed_state_transfer_restores_the_old_mapping() {
    init_tracing();
    let config = fast_config().with_deadline(Duration::from_millis(400));
    let mut cluster = TestCluster::start(&["A", "B"], config);
    let a = cluster.node("A");
    let old = a.accepted_mapping();

    cluster.network.drop_commands(CommandKind::PullState, 1.0);

    let c = cluster.add_joiner("C");
    let coordinator = RehashCoordinator::join(Arc::clone(&c));

    let result = coordinator.run().await;
    assert_eq!(
        result,
        Err(RehashError::Timeout {
            phase: RehashPhase::PullState
        })
    );

    assert_eq!(c.logger().state(), LoggerState::Disabled);
    assert_eq!(c.logger().pending_len(), 0);
    for node in cluster.nodes() {
        assert_eq!(node.accepted_mapping(), old, "{}", node.address());
    }

    let state = coordinator.state().unwrap();
    assert_eq!(state.old.len(), 2);
    assert_eq!(state.new.len(), 3);
    assert!(state.union.is_union());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_node_runs_one_rehash_at_a_time() {
    init_tracing();
    let mut cluster = TestCluster::start(&["A", "B"], fast_config());
    cluster
        .network
        .delay_commands(CommandKind::PullState, Duration::from_millis(150));

    let c = cluster.add_joiner("C");
    let first = Arc::new(RehashCoordinator::join(Arc::clone(&c)));
    let mut phases = first.subscribe();

    let running = tokio::spawn({
        let first = Arc::clone(&first);
        async move { first.run().await }
    });

    tokio::time::timeout(
        Duration::from_secs(2),
        phases.wait_for(|phase| *phase == RehashPhase::PullState),
    )
    .await
    .unwrap()
    .unwrap();

    let second = RehashCoordinator::join(Arc::clone(&c));
    assert_eq!(second.run().await, Err(RehashError::AlreadyInProgress));

    assert!(running.await.unwrap().is_ok());
}

#[tokio::test]
async fn disabled_rehash_swaps_the_mapping_directly() {
    init_tracing();
    let mut cluster = TestCluster::start(&["A", "B"], fast_config().with_rehash_enabled(false));
    let a = cluster.node("A");
    a.put("k", "v").await.unwrap();

    let c = cluster.add_joiner("C");
    let coordinator = RehashCoordinator::join(Arc::clone(&c));
    let new = coordinator.run().await.unwrap();

    assert_eq!(new.len(), 3);
    assert!(coordinator.state().is_none());
    assert!(c.store().is_empty());
    for node in cluster.nodes() {
        assert_eq!(node.accepted_mapping(), Mapping::Single(Arc::clone(&new)));
    }
}

#[tokio::test]
async fn joining_an_idle_cluster_moves_nothing() {
    init_tracing();
    let mut cluster = TestCluster::start(&["A"], fast_config());

    let b = cluster.add_joiner("B");
    let coordinator = RehashCoordinator::join(Arc::clone(&b));
    let new = coordinator.run().await.unwrap();

    assert_eq!(new.len(), 2);
    assert_eq!(coordinator.wait_for_invalidation().await, 0);
    assert_eq!(
        cluster.node("A").accepted_mapping().all_members().len(),
        2
    );
}

#[tokio::test]
async fn rejoining_member_changes_nothing() {
    init_tracing();
    let cluster = TestCluster::start(&["A", "B"], fast_config());
    let b = cluster.node("B");
    let old = b.accepted_mapping();

    let coordinator = RehashCoordinator::join(Arc::clone(&b));
    let new = coordinator.run().await.unwrap();

    assert_eq!(Mapping::Single(new), old);
    assert_eq!(coordinator.phase(), RehashPhase::Done);
    assert!(coordinator.state().is_none());
    assert_eq!(coordinator.wait_for_invalidation().await, 0);
    for node in cluster.nodes() {
        assert_eq!(node.accepted_mapping(), old);
    }
}

#[tokio::test]
async fn join_completes_when_one_member_misses_the_broadcasts() {
    init_tracing();
    let mut cluster = TestCluster::start(&["A", "B", "D"], fast_config());
    let a = cluster.node("A");
    for n in 0..KEYS {
        a.put(key(n), format!("value-{n}")).await.unwrap();
    }
    let old = a.accepted_mapping();

    cluster
        .network
        .drop_commands_to(&Address::from("D"), CommandKind::InstallMapping, 1.0);

    let c = cluster.add_joiner("C");
    let coordinator = RehashCoordinator::join(Arc::clone(&c));
    let new = coordinator.run().await.unwrap();
    coordinator.wait_for_invalidation().await;

    assert_eq!(coordinator.phase(), RehashPhase::Done);
    assert_eq!(cluster.node("D").accepted_mapping(), old);
    for name in ["A", "B", "C"] {
        assert_eq!(
            cluster.node(name).accepted_mapping(),
            Mapping::Single(Arc::clone(&new))
        );
    }
    for n in (0..KEYS).filter(|n| new.is_owner(c.address(), key(*n).as_str(), 2)) {
        assert_eq!(
            c.store().get(&key(n)).map(|e| e.value),
            Some(format!("value-{n}").into_bytes())
        );
    }
}

/// Forwards everything to a node but answers state requests with a bare ack.
#[derive(Debug)]
struct Stateless(Arc<ClusterNode>);

impl CommandHandler for Stateless {
    fn handle(&self, from: &Address, command: RehashCommand) -> Response {
        match command {
            RehashCommand::PullState { .. } => Response::Ack,
            other => self.0.handle(from, other),
        }
    }
}

#[tokio::test]
async fn reply_without_state_is_skipped() {
    init_tracing();
    let mut cluster = TestCluster::start(&["A", "B"], fast_config());
    let a = cluster.node("A");
    for n in 0..KEYS {
        a.put(key(n), format!("value-{n}")).await.unwrap();
    }

    let stateless: Arc<dyn CommandHandler> = Arc::new(Stateless(cluster.node("B")));
    cluster
        .network
        .register(Address::from("B"), Arc::downgrade(&stateless));

    let c = cluster.add_joiner("C");
    let coordinator = RehashCoordinator::join(Arc::clone(&c));
    let new = coordinator.run().await.unwrap();

    assert_eq!(coordinator.phase(), RehashPhase::Done);
    assert_eq!(new.state_providers(c.address(), 2).len(), 2);

    // A holds everything, so its chunk alone fills C
    let owned: Vec<usize> = (0..KEYS)
        .filter(|n| new.is_owner(c.address(), key(*n).as_str(), 2))
        .collect();
    assert!(!owned.is_empty());
    for n in owned {
        assert_eq!(
            c.store().get(&key(n)).map(|e| e.value),
            Some(format!("value-{n}").into_bytes())
        );
    }
}

#[tokio::test]
async fn removed_key_does_not_come_back_with_a_later_join() {
    init_tracing();
    let mut cluster = TestCluster::start(&["A", "B"], fast_config().with_invalidate_stale(false));
    let a = cluster.node("A");
    for n in 0..KEYS {
        a.put(key(n), "old-1").await.unwrap();
        a.put(key(n), "old-2").await.unwrap();
    }

    let c = cluster.add_joiner("C");
    let ring = RehashCoordinator::join(Arc::clone(&c)).run().await.unwrap();

    // a joiner that pulls from a member still holding a copy it no longer owns
    let (joiner, stale_key) = (0..20)
        .map(|n| Address::new(format!("D{n}")))
        .find_map(|joiner| {
            let next = a
                .factory()
                .create_with(ring.iter().cloned(), [joiner.clone()])
                .ok()?;
            let providers = next.state_providers(&joiner, 2);
            let stale_key = (0..KEYS).map(key).find(|k| {
                next.is_owner(&joiner, k.as_str(), 2)
                    && providers.iter().any(|provider| {
                        !ring.is_owner(provider, k.as_str(), 2)
                            && cluster.node(provider.as_str()).store().get(k).is_some()
                    })
            })?;
            Some((joiner, stale_key))
        })
        .unwrap();

    a.remove(stale_key.as_str()).await.unwrap();
    a.put(stale_key.as_str(), "fresh").await.unwrap();

    let d = cluster.add_joiner(joiner.as_str());
    RehashCoordinator::join(Arc::clone(&d)).run().await.unwrap();

    assert_eq!(
        d.store().get(&stale_key).map(|e| e.value),
        Some(b"fresh".to_vec())
    );
    assert_eq!(d.get(&stale_key).await.unwrap(), Some(b"fresh".to_vec()));
}
