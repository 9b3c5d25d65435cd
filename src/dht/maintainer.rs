//! Periodic routing-table maintenance.
//!
//! Three loops share one cancellation token:
//!
//! 1. **Ping**: probe nodes quiet for half the node timeout; fall back to
//!    the seed list when the table is empty.
//! 2. **Lookup**: refresh buckets by querying for self plus two random
//!    targets.
//! 3. **Prune**: demote silent Good nodes to Bad, drop long-silent Bad
//!    nodes, and expire stale group announcements.
//!
//! Probe sends are best-effort: failures are logged at debug level and the
//! next tick retries. Start and stop are idempotent; stop waits for all
//! three tasks to finish.

use std::sync::Arc;

use rand::RngCore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dht::bootstrap::BootstrapManager;
use crate::dht::packet::Packet;
use crate::dht::transport::Transport;
use crate::dht::types::{DhtConfig, MAX_SENT_NODES};
use crate::time::Clock;
use crate::types::{NodeId, PUBLIC_KEY_SIZE, PublicKey};

struct MaintainerInner {
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

/// Background maintenance driver. `Stopped → Running → Stopped`.
pub struct Maintainer {
    config: DhtConfig,
    manager: Arc<BootstrapManager>,
    transport: Arc<dyn Transport>,
    clock: Clock,
    inner: tokio::sync::Mutex<MaintainerInner>,
}

impl Maintainer {
    pub fn new(
        config: DhtConfig,
        manager: Arc<BootstrapManager>,
        transport: Arc<dyn Transport>,
        clock: Clock,
    ) -> Self {
        Self {
            config,
            manager,
            transport,
            clock,
            inner: tokio::sync::Mutex::new(MaintainerInner { cancel: None, tasks: Vec::new() }),
        }
    }

    /// Start the three loops. Calling while running is a no-op.
    pub async fn start(&self) {
        let mut inner = self.inner.lock().await;
        if inner.cancel.is_some() {
            return;
        }
        let cancel = CancellationToken::new();

        inner.tasks.push(tokio::spawn(ping_loop(
            self.config.clone(),
            self.manager.clone(),
            self.transport.clone(),
            self.clock.clone(),
            cancel.clone(),
        )));
        inner.tasks.push(tokio::spawn(lookup_loop(
            self.config.clone(),
            self.manager.clone(),
            self.transport.clone(),
            cancel.clone(),
        )));
        inner.tasks.push(tokio::spawn(prune_loop(
            self.config.clone(),
            self.manager.clone(),
            cancel.clone(),
        )));

        inner.cancel = Some(cancel);
        info!("maintainer started");
    }

    /// Signal cancellation and wait for every loop to finish. Calling while
    /// stopped is a no-op; no partial shutdown.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        let Some(cancel) = inner.cancel.take() else {
            return;
        };
        cancel.cancel();
        for task in inner.tasks.drain(..) {
            let _ = task.await;
        }
        info!("maintainer stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.cancel.is_some()
    }
}

/// Probe nodes that have been quiet for half the node timeout.
async fn ping_loop(
    config: DhtConfig,
    manager: Arc<BootstrapManager>,
    transport: Arc<dyn Transport>,
    clock: Clock,
    cancel: CancellationToken,
) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(config.ping_interval_secs));
    let self_key = *manager.routing().self_key();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let nodes = manager.routing().all_nodes();
        if nodes.is_empty() {
            // Nothing learned yet: probe the seeds instead.
            for seed in manager.bootstrap_nodes().await {
                let packet = Packet::ping_request(&self_key);
                if let Err(e) = transport.send(&packet, &seed.address).await {
                    debug!(peer = %seed.address, error = %e, "seed ping failed");
                }
            }
            continue;
        }

        let now = clock.now_secs();
        let window = config.node_timeout_secs / 2;
        for node in nodes {
            if node.active_within(window, now) {
                continue;
            }
            let packet = Packet::ping_request(&self_key);
            match transport.send(&packet, &node.address).await {
                Ok(()) => manager.routing().record_ping_sent(&node.id),
                Err(e) => {
                    debug!(node = %node.id, peer = %node.address, error = %e, "ping failed");
                }
            }
        }
    }
}

/// Refresh buckets with one self-lookup and two random-target lookups.
async fn lookup_loop(
    config: DhtConfig,
    manager: Arc<BootstrapManager>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(config.lookup_interval_secs));
    let self_key = *manager.routing().self_key();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let mut targets = vec![self_key];
        for _ in 0..2 {
            let mut bytes = [0u8; PUBLIC_KEY_SIZE];
            rand::thread_rng().fill_bytes(&mut bytes);
            targets.push(PublicKey(bytes));
        }

        for target in targets {
            let closest = manager
                .routing()
                .find_closest(&NodeId::from_public_key(target), MAX_SENT_NODES);
            let addresses: Vec<_> = if closest.is_empty() {
                manager
                    .bootstrap_nodes()
                    .await
                    .into_iter()
                    .take(MAX_SENT_NODES)
                    .map(|s| s.address)
                    .collect()
            } else {
                closest.into_iter().map(|n| n.address).collect()
            };

            let packet = Packet::get_nodes(&self_key, &target);
            for address in addresses {
                if let Err(e) = transport.send(&packet, &address).await {
                    debug!(target = %target.fingerprint(), peer = %address, error = %e, "lookup send failed");
                }
            }
        }
    }
}

/// Age out silent nodes and expired announcements.
async fn prune_loop(config: DhtConfig, manager: Arc<BootstrapManager>, cancel: CancellationToken) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(config.ping_interval_secs));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let (demoted, pruned) = manager
            .routing()
            .age_out(config.node_timeout_secs, config.prune_timeout_secs);
        let expired = manager.routing().groups().clean_expired();
        if demoted + pruned + expired > 0 {
            debug!(demoted, pruned, expired, "prune pass");
        }
    }
}
