//! The server context: single owner of all shared state, and the
//! dispatch loop that drives it.
//!
//! Every table the handlers touch (variable store, client registry,
//! transaction table, blocked-request queue, connection bindings) is a
//! field of [`ServerContext`], which is moved into one dispatcher task.
//! Concurrency is interleaved events on the input channel plus two timer
//! ticks (statistics, liveness sweep) in the same `select!` loop, so
//! exactly one request is being handled at any instant and nothing needs
//! a lock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};
use varbus_core::DaemonConfig;

use crate::delegate::{BlockedRequestQueue, TransactionTable};
use crate::dispatch;
use crate::events::{ConnId, ServerEvent};
use crate::metrics::DaemonMetrics;
use crate::registry::{ClientId, ClientRegistry};
use crate::store::VariableStore;
use crate::sweeper;

/// All shared server state, owned by the dispatcher task.
pub struct ServerContext {
    /// Daemon configuration.
    pub config: DaemonConfig,
    /// The variable table, tag registry, and query cursors.
    pub store: VariableStore,
    /// Live client registrations.
    pub registry: ClientRegistry,
    /// In-flight delegation transactions.
    pub txns: TransactionTable,
    /// Requesters parked awaiting a delegate.
    pub blocked: BlockedRequestQueue,
    /// Request connection → client binding.
    pub bindings: HashMap<ConnId, ClientId>,
    /// Push-channel connection → client binding.
    pub notify_bindings: HashMap<ConnId, ClientId>,
    /// Metrics handle.
    pub metrics: DaemonMetrics,
    started: Instant,
}

impl ServerContext {
    /// Creates a context sized from the configuration.
    #[must_use]
    pub fn new(config: DaemonConfig, metrics: DaemonMetrics) -> Self {
        let store = VariableStore::new(config.max_variables);
        let registry = ClientRegistry::new(config.max_clients);
        Self {
            config,
            store,
            registry,
            txns: TransactionTable::new(),
            blocked: BlockedRequestQueue::new(),
            bindings: HashMap::new(),
            notify_bindings: HashMap::new(),
            metrics,
            started: Instant::now(),
        }
    }

    /// The client bound to a request connection, if any.
    #[must_use]
    pub fn client_for_conn(&self, conn: ConnId) -> Option<ClientId> {
        self.bindings.get(&conn).copied()
    }

    /// Time since the context was created.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Tears down a client: recycles the registration, destroys its query
    /// cursors, discards its parked queue entries, and unbinds its
    /// connections. Idempotent.
    pub fn drop_client(&mut self, client: ClientId) {
        if let Some(pid) = self.registry.disconnect(client) {
            self.store.drop_contexts_for(pid);
        }
        self.blocked.drop_for_client(client);
        self.bindings.retain(|_, bound| *bound != client);
        self.notify_bindings.retain(|_, bound| *bound != client);
        self.metrics.set_clients(self.registry.live_count());
    }

    /// Handles a connection teardown event.
    pub fn drop_conn(&mut self, conn: ConnId) {
        if let Some(client) = self.bindings.remove(&conn) {
            debug!(conn, client, "request connection closed");
            self.drop_client(client);
        } else if let Some(client) = self.notify_bindings.remove(&conn) {
            debug!(conn, client, "notify channel closed");
            if let Some(reg) = self.registry.get_mut(client) {
                reg.notify = None;
            }
        }
    }

    fn log_stats(&self) {
        info!(
            uptime_secs = self.uptime().as_secs(),
            variables = self.store.len(),
            clients = self.registry.live_count(),
            transactions = self.txns.len(),
            blocked = self.blocked.len(),
            cursors = self.store.context_count(),
            "periodic statistics"
        );
    }

    /// Runs the dispatch loop until the event channel closes.
    ///
    /// This is the single logical actor of the server: transport tasks
    /// only decode and forward.
    pub async fn run(mut self, mut events: mpsc::Receiver<ServerEvent>) {
        let mut sweep = interval(Duration::from_secs(self.config.sweep_interval_secs));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats = interval(Duration::from_secs(self.config.stats_interval_secs.max(1)));
        stats.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("event channel closed; dispatcher exiting");
                        break;
                    };
                    dispatch::handle_event(&mut self, event);
                }
                _ = sweep.tick() => {
                    let reclaimed = sweeper::sweep(&mut self);
                    if reclaimed > 0 {
                        info!(reclaimed, "liveness sweep reclaimed registrations");
                    }
                }
                _ = stats.tick() => self.log_stats(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TransportKind;
    use crate::metrics::MetricsRegistry;

    fn context() -> ServerContext {
        let metrics = MetricsRegistry::new().unwrap().daemon_metrics();
        ServerContext::new(DaemonConfig::default(), metrics)
    }

    #[test]
    fn drop_client_is_idempotent() {
        let mut ctx = context();
        let id = ctx
            .registry
            .connect(123, 0, TransportKind::Local, 64)
            .unwrap();
        ctx.bindings.insert(1, id);
        ctx.drop_client(id);
        assert_eq!(ctx.registry.live_count(), 0);
        assert!(ctx.bindings.is_empty());
        ctx.drop_client(id);
        assert_eq!(ctx.registry.live_count(), 0);
    }

    #[test]
    fn notify_conn_teardown_clears_channel_only() {
        let mut ctx = context();
        let id = ctx
            .registry
            .connect(123, 0, TransportKind::Local, 64)
            .unwrap();
        ctx.bindings.insert(1, id);
        ctx.notify_bindings.insert(2, id);
        let (tx, _rx) = mpsc::channel(1);
        ctx.registry.get_mut(id).unwrap().notify = Some(tx);

        ctx.drop_conn(2);
        let reg = ctx.registry.get(id).unwrap();
        assert!(reg.notify.is_none());
        // The registration itself survives its notify channel.
        assert_eq!(ctx.registry.live_count(), 1);

        ctx.drop_conn(1);
        assert_eq!(ctx.registry.live_count(), 0);
    }
}
