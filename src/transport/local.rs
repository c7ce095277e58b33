//! In-process transport.
//!
//! Every member of a [`LocalNetwork`] is a handler living in the same
//! process. Commands can be dropped or delayed per [`CommandKind`] to
//! exercise the retry paths of the rehash protocol.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, trace};

use super::{ClusterTransport, CommandHandler, CommandKind, RehashCommand, Response};
use crate::error::TransportError;
use crate::member::Address;

#[derive(Clone, Copy, Debug, Default)]
struct Fault {
    drop_probability: f64,
    delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct NetworkInner {
    // registration order, the first member acts as coordinator
    members: Vec<(Address, Weak<dyn CommandHandler>)>,
    faults: HashMap<CommandKind, Fault>,
    // take precedence over `faults` for their target
    target_faults: HashMap<(Address, CommandKind), Fault>,
}

/// A set of members reachable from each other in-process.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    inner: RwLock<NetworkInner>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport for `address`, which should be registered before it is
    /// addressed by others.
    pub fn transport(self: &Arc<Self>, address: Address) -> LocalTransport {
        LocalTransport {
            network: Arc::clone(self),
            address,
        }
    }

    /// Add `address` to the view, or replace its handler if already present.
    pub fn register(&self, address: Address, handler: Weak<dyn CommandHandler>) {
        let mut inner = self.inner.write();

        match inner.members.iter_mut().find(|(member, _)| *member == address) {
            Some(entry) => entry.1 = handler,
            None => {
                debug!(%address, "member registered");
                inner.members.push((address, handler));
            }
        }
    }

    /// Remove `address` from the view. Commands sent to it fail as
    /// unreachable from now on.
    pub fn unregister(&self, address: &Address) {
        self.inner.write().members.retain(|(member, _)| member != address);
        debug!(%address, "member unregistered");
    }

    pub fn members(&self) -> Vec<Address> {
        self.inner
            .read()
            .members
            .iter()
            .map(|(member, _)| member.clone())
            .collect()
    }

    pub fn coordinator(&self) -> Option<Address> {
        self.inner.read().members.first().map(|(member, _)| member.clone())
    }

    /// Drop commands of `kind` with the given probability. A dropped command
    /// is reported as a timeout once the sender's timeout has elapsed.
    pub fn drop_commands(&self, kind: CommandKind, probability: f64) {
        let mut inner = self.inner.write();
        inner.faults.entry(kind).or_default().drop_probability = probability.clamp(0.0, 1.0);
    }

    /// Drop commands of `kind` sent to `target` only.
    pub fn drop_commands_to(&self, target: &Address, kind: CommandKind, probability: f64) {
        let mut inner = self.inner.write();
        inner
            .target_faults
            .entry((target.clone(), kind))
            .or_default()
            .drop_probability = probability.clamp(0.0, 1.0);
    }

    /// Hold commands of `kind` back for `delay` before delivering them.
    pub fn delay_commands(&self, kind: CommandKind, delay: Duration) {
        let mut inner = self.inner.write();
        inner.faults.entry(kind).or_default().delay = Some(delay);
    }

    pub fn clear_faults(&self) {
        let mut inner = self.inner.write();
        inner.faults.clear();
        inner.target_faults.clear();
    }

    async fn deliver(
        &self,
        from: &Address,
        to: &Address,
        command: RehashCommand,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let kind = command.kind();

        let (handler, fault) = {
            let inner = self.inner.read();
            let handler = inner
                .members
                .iter()
                .find(|(member, _)| member == to)
                .and_then(|(_, handler)| handler.upgrade());
            let fault = inner
                .target_faults
                .get(&(to.clone(), kind))
                .or_else(|| inner.faults.get(&kind))
                .copied()
                .unwrap_or_default();
            (handler, fault)
        };

        let Some(handler) = handler else {
            return Err(TransportError::Unreachable(to.clone()));
        };

        let dropped = fault.drop_probability > 0.0
            && rand::rng().random::<f64>() < fault.drop_probability;
        if dropped {
            trace!(%from, %to, ?kind, "dropping command");
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout(to.clone()));
        }

        let delivery = async {
            if let Some(delay) = fault.delay {
                tokio::time::sleep(delay).await;
            }
            handler.handle(from, command)
        };

        tokio::time::timeout(timeout, delivery)
            .await
            .map_err(|_| TransportError::Timeout(to.clone()))
    }
}

/// One member's handle on a [`LocalNetwork`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    address: Address,
}

impl LocalTransport {
    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }
}

#[async_trait]
impl ClusterTransport for LocalTransport {
    fn local_address(&self) -> &Address {
        &self.address
    }

    fn coordinator(&self) -> Option<Address> {
        self.network.coordinator()
    }

    fn members(&self) -> Vec<Address> {
        self.network.members()
    }

    async fn send_sync(
        &self,
        targets: &[Address],
        command: RehashCommand,
        timeout: Duration,
    ) -> Vec<(Address, Result<Response, TransportError>)> {
        let deliveries = targets.iter().map(|target| {
            let command = command.clone();
            async move {
                let reply = self
                    .network
                    .deliver(&self.address, target, command, timeout)
                    .await;
                (target.clone(), reply)
            }
        });

        join_all(deliveries).await
    }
}
