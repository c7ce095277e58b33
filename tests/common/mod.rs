#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hashring_rehash::{
    Address, ClusterNode, CommandHandler, DistributionConfig, InMemoryDataStore, LocalNetwork,
};
use tracing_subscriber::EnvFilter;

/// Route `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short timeouts so failure paths finish quickly.
pub fn fast_config() -> DistributionConfig {
    DistributionConfig::default()
        .with_rpc_timeout(Duration::from_millis(200))
        .with_retry_backoff(Duration::from_millis(10), Duration::from_millis(30))
        .with_deadline(Duration::from_secs(2))
}

pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    pub config: DistributionConfig,
    nodes: BTreeMap<String, Arc<ClusterNode>>,
}

impl TestCluster {
    /// A settled cluster where every member accepts the ring of `names`.
    pub fn start(names: &[&str], config: DistributionConfig) -> Self {
        let mut cluster = TestCluster {
            network: LocalNetwork::new(),
            config,
            nodes: BTreeMap::new(),
        };

        for name in names {
            let members = names.iter().map(|m| Address::from(*m));
            cluster.spawn(name, members);
        }

        cluster
    }

    /// A member that is reachable but only knows itself until it joins.
    pub fn add_joiner(&mut self, name: &str) -> Arc<ClusterNode> {
        self.spawn(name, [Address::from(name)])
    }

    /// Take `name` out of the network, as if it crashed.
    pub fn crash(&mut self, name: &str) {
        self.network.unregister(&Address::from(name));
        self.nodes.remove(name);
    }

    pub fn node(&self, name: &str) -> Arc<ClusterNode> {
        Arc::clone(&self.nodes[name])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<ClusterNode>> {
        self.nodes.values()
    }

    fn spawn(&mut self, name: &str, members: impl IntoIterator<Item = Address>) -> Arc<ClusterNode> {
        let address = Address::from(name);
        let node = Arc::new(
            ClusterNode::new(
                self.config.clone(),
                Arc::new(self.network.transport(address.clone())),
                Arc::new(InMemoryDataStore::new()),
                members,
            )
            .unwrap(),
        );

        let handler: Arc<dyn CommandHandler> = node.clone();
        self.network.register(address, Arc::downgrade(&handler));
        self.nodes.insert(name.to_string(), Arc::clone(&node));

        node
    }
}
