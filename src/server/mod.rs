//! The server context: process-wide state threaded through the registry,
//! admission pipeline, invoker and scheduler.
//!
//! There is deliberately no ambient global. Everything the four core
//! components share — nesting state, cached clock, propagation buffer,
//! dirty counters, pause/loading/busy states — lives on [`Server`] and is
//! passed explicitly, so each gate and the flush semantics unit-test without
//! a live reactor.

pub mod interfaces;

use crate::client::{Client, ClientId, ClientTable};
use crate::command::registry::CommandRegistry;
use crate::core::config::Config;
use crate::core::time::ClockCache;
use crate::exec::ExecState;
use crate::propagate::PropagationBuffer;
use crate::sched::CronState;
use bytes::Bytes;
use interfaces::{
    AccessControl, BackgroundJobs, ClusterMap, Dataset, DurableLog, FixedIoPool, InlineJobs,
    IoPool, MemoryDataset, MemoryLog, PermitAll, ReplicaStream, SingleNode, StaticReplicas,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Dataset load in progress, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loading {
    None,
    /// Full synchronous load; almost everything is denied.
    Sync,
    /// Background load; only a narrower set of commands is denied.
    Async,
}

/// Long-running script/module state.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusyState {
    /// A long-running operation holds the server; non-exempt commands are
    /// rejected busy.
    pub active: bool,
    /// The long-running operation is yielding control; non-exempt commands
    /// are postponed instead.
    pub yielding: bool,
}

/// Scope of a global client pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseScope {
    All,
    Writes,
}

/// An active client pause.
#[derive(Debug, Clone, Copy)]
pub struct Pause {
    pub scope: PauseScope,
    pub until_ms: u64,
}

/// Replication role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica { link_up: bool },
}

impl Role {
    pub fn is_replica(&self) -> bool {
        matches!(self, Role::Replica { .. })
    }
}

/// Shutdown request flag plus sequencing state.
///
/// Signal handlers only flip the atomic flag; all sequencing happens on the
/// reactor inside the maintenance cron.
#[derive(Debug)]
pub struct ShutdownState {
    requested: Arc<AtomicBool>,
    /// Deadline for the replica drain once sequencing has started.
    pub deadline_ms: Option<u64>,
}

impl ShutdownState {
    fn new() -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            deadline_ms: None,
        }
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.requested.clone())
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Async-signal-safe shutdown trigger.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Process-wide counters beyond the per-command ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerStats {
    pub commands_processed: u64,
    pub peak_memory: u64,
    pub expired_keys: u64,
    pub evicted_clients: u64,
}

/// One entry of the monitor feed, addressed to a registered monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEvent {
    /// Monitor connection this entry is for.
    pub monitor: ClientId,
    pub ts_us: u64,
    pub db: u32,
    /// Issuing client.
    pub client: ClientId,
    pub argv: Vec<Bytes>,
}

/// The server context.
pub struct Server {
    pub config: Config,
    pub registry: CommandRegistry,
    pub exec: Arc<ExecState>,
    pub(crate) prop_buf: PropagationBuffer,
    pub dataset: Box<dyn Dataset>,
    pub log: Box<dyn DurableLog>,
    pub replicas: Box<dyn ReplicaStream>,
    pub acl: Box<dyn AccessControl>,
    pub cluster: Box<dyn ClusterMap>,
    pub jobs: Box<dyn BackgroundJobs>,
    pub io_pool: Box<dyn IoPool>,
    pub clients: ClientTable,

    pub loading: Loading,
    pub busy: BusyState,
    pub pause: Option<Pause>,
    pub role: Role,
    pub shutdown: ShutdownState,
    pub cron: CronState,
    pub stats: ServerStats,
    /// Global propagation switch; when false nothing reaches the log.
    pub propagation_enabled: bool,

    pub(crate) monitors: Vec<ClientId>,
    pub(crate) monitor_feed: Vec<MonitorEvent>,
    pub(crate) outbox: Vec<(ClientId, crate::admission::Admission)>,
    /// Descriptor of the in-flight top-level command, for flush framing.
    pub(crate) top_level: Option<Arc<crate::command::CommandDescriptor>>,
    pub(crate) last_misconf_warn_ms: u64,
}

impl Server {
    /// Build a server over the in-memory collaborator implementations.
    pub fn new(config: Config) -> Self {
        let registry = CommandRegistry::builtin(&config.latency);
        Self::with_registry(config, registry)
    }

    /// Build a server with an explicit registry (extended command tables).
    pub fn with_registry(config: Config, registry: CommandRegistry) -> Self {
        let databases = config.server.databases as usize;
        let cron = CronState::new(&config);
        Self {
            config,
            registry,
            exec: Arc::new(ExecState::new()),
            prop_buf: PropagationBuffer::new(),
            dataset: Box::new(MemoryDataset::new(databases)),
            log: Box::new(MemoryLog::disabled()),
            replicas: Box::new(StaticReplicas::none()),
            acl: Box::new(PermitAll),
            cluster: Box::new(SingleNode),
            jobs: Box::new(InlineJobs::new()),
            io_pool: Box::new(FixedIoPool::new(1)),
            clients: ClientTable::new(),
            loading: Loading::None,
            busy: BusyState::default(),
            pause: None,
            role: Role::Primary,
            shutdown: ShutdownState::new(),
            cron,
            stats: ServerStats::default(),
            propagation_enabled: true,
            monitors: Vec::new(),
            monitor_feed: Vec::new(),
            outbox: Vec::new(),
            top_level: None,
            last_misconf_warn_ms: 0,
        }
    }

    pub fn with_dataset(mut self, dataset: impl Dataset + 'static) -> Self {
        self.dataset = Box::new(dataset);
        self
    }

    pub fn with_log(mut self, log: impl DurableLog + 'static) -> Self {
        self.log = Box::new(log);
        self
    }

    pub fn with_replicas(mut self, replicas: impl ReplicaStream + 'static) -> Self {
        self.replicas = Box::new(replicas);
        self
    }

    pub fn with_acl(mut self, acl: impl AccessControl + 'static) -> Self {
        self.acl = Box::new(acl);
        self
    }

    pub fn with_cluster(mut self, cluster: impl ClusterMap + 'static) -> Self {
        self.cluster = Box::new(cluster);
        self
    }

    pub fn with_jobs(mut self, jobs: impl BackgroundJobs + 'static) -> Self {
        self.jobs = Box::new(jobs);
        self
    }

    pub fn with_io_pool(mut self, pool: impl IoPool + 'static) -> Self {
        self.io_pool = Box::new(pool);
        self
    }

    /// The cached clock frozen per execution unit.
    pub fn clock(&self) -> &ClockCache {
        self.exec.clock()
    }

    /// Pause client activity until the given unix-millisecond instant.
    pub fn pause_clients(&mut self, scope: PauseScope, until_ms: u64) {
        self.pause = Some(Pause { scope, until_ms });
    }

    /// The pause scope in force at `now_ms`, if any. An elapsed pause is
    /// cleared on the way out.
    pub fn active_pause(&mut self, now_ms: u64) -> Option<PauseScope> {
        match self.pause {
            Some(pause) if pause.until_ms > now_ms => Some(pause.scope),
            Some(_) => {
                self.pause = None;
                None
            }
            None => None,
        }
    }

    /// Register a client for the monitor feed.
    pub fn register_monitor(&mut self, id: ClientId) {
        if !self.monitors.contains(&id) {
            self.monitors.push(id);
        }
    }

    pub fn unregister_monitor(&mut self, id: ClientId) {
        self.monitors.retain(|m| *m != id);
    }

    /// Drain the pending monitor feed.
    pub fn take_monitor_feed(&mut self) -> Vec<MonitorEvent> {
        std::mem::take(&mut self.monitor_feed)
    }

    /// Drain pending structured outcomes for the protocol layer.
    pub fn take_outbox(&mut self) -> Vec<(ClientId, crate::admission::Admission)> {
        std::mem::take(&mut self.outbox)
    }

    /// Sample the dataset memory peak.
    pub(crate) fn track_memory_peak(&mut self) {
        let used = self.dataset.memory_used();
        if used > self.stats.peak_memory {
            self.stats.peak_memory = used;
        }
    }

    /// Evict clients while aggregate buffer memory exceeds the policy.
    ///
    /// `current`, when given, is the in-flight client (held outside the
    /// table); returns false when the policy freed that very client, in
    /// which case processing must stop with no reply.
    pub(crate) fn evict_clients_for_memory(&mut self, current: Option<&Client>) -> bool {
        let limit = self.config.memory.client_eviction_bytes;
        if limit == 0 {
            return true;
        }
        let mut current_fp = current.map_or(0, Client::footprint);
        let current_id = current.map(|c| c.id);
        let mut current_alive = current.is_some();
        let mut total = self.clients.total_footprint() + current_fp;
        let mut survived = true;

        while total > limit {
            let table_victim = self.clients.heaviest();
            let table_fp = table_victim
                .and_then(|id| self.clients.get(id))
                .map_or(0, Client::footprint);

            if table_victim.is_some() && (!current_alive || table_fp >= current_fp) {
                let id = match table_victim {
                    Some(id) => id,
                    None => break,
                };
                if let Some(victim) = self.clients.remove(id) {
                    tracing::warn!(client = victim.id, footprint = victim.footprint(),
                        "evicting client over memory policy");
                    total = total.saturating_sub(victim.footprint());
                    self.stats.evicted_clients += 1;
                    self.outbox
                        .push((id, crate::admission::Admission::Disconnected));
                }
            } else if current_alive {
                tracing::warn!(client = ?current_id,
                    "evicting the issuing client over memory policy");
                total = total.saturating_sub(current_fp);
                current_fp = 0;
                current_alive = false;
                survived = false;
                self.stats.evicted_clients += 1;
            } else {
                break;
            }
        }
        survived
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_expires() {
        let mut srv = Server::new(Config::default());
        srv.pause_clients(PauseScope::Writes, 1_000);
        assert_eq!(srv.active_pause(500), Some(PauseScope::Writes));
        assert_eq!(srv.active_pause(1_500), None);
        // Cleared once elapsed.
        assert!(srv.pause.is_none());
    }

    #[test]
    fn shutdown_handle_sets_flag() {
        let srv = Server::new(Config::default());
        assert!(!srv.shutdown.requested());
        srv.shutdown.handle().request();
        assert!(srv.shutdown.requested());
    }

    #[test]
    fn client_eviction_frees_heaviest_first() {
        let mut config = Config::default();
        config.memory.client_eviction_bytes = 40 * 1024;
        let mut srv = Server::with_registry(config, CommandRegistry::builtin(&Default::default()));

        let mut small = Client::new(1, 0);
        small.output_buf_capacity = 4 * 1024;
        let mut big = Client::new(2, 0);
        big.output_buf_capacity = 64 * 1024;
        srv.clients.insert(small);
        srv.clients.insert(big);

        assert!(srv.evict_clients_for_memory(None));
        assert!(srv.clients.get(1).is_some());
        assert!(srv.clients.get(2).is_none());
        assert_eq!(srv.stats.evicted_clients, 1);
    }
}
