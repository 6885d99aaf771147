//! The periodic scheduler.
//!
//! Background maintenance runs on the same reactor as command processing:
//! the fixed-rate maintenance cron, the adaptive client-maintenance cron and
//! the pre/post-sleep hooks that bracket every poll of the event loop. None
//! of this ever overlaps a command invocation.

pub mod reactor;

use crate::admission::Admission;
use crate::client::{ClientId, INPUT_BUF_DEFAULT, OUTPUT_BUF_MIN};
use crate::command::BlockCondition;
use crate::core::config::Config;
use crate::core::time::unix_ms;
use crate::propagate::PropTarget;
use crate::server::interfaces::{JobKind, LogState};
use crate::server::Server;
use bytes::Bytes;
use std::time::{Duration, Instant};

/// Ring size for instantaneous throughput metrics.
const METRIC_SAMPLES: usize = 16;

/// Fewest clients the client cron visits per cycle.
const CLIENTS_CRON_MIN_QUOTA: usize = 5;
/// Most clients the client cron visits per cycle.
const CLIENTS_CRON_MAX_QUOTA: usize = 200;

/// Output-buffer peaks are reset this often so transient spikes don't pin
/// buffers large.
const OUTPUT_PEAK_RESET_MS: u64 = 5_000;

/// Bytes of replication backlog trimmed per pre-sleep pass.
const BACKLOG_TRIM_BUDGET: usize = 64 * 1024;

/// Elapsed-microsecond budget for one incremental per-database pass.
const DB_WORK_BUDGET_US: u128 = 1_000;

/// Expired keys collected per database per cron tick.
const EXPIRE_BATCH: usize = 20;

const IO_JOBS_PER_WORKER: usize = 8;
const IO_WORKERS_MAX: usize = 8;

/// Instantaneous per-second rate sampled from a monotonic counter into a
/// fixed ring.
#[derive(Debug)]
pub struct InstantMetric {
    last_sample_ms: u64,
    last_value: u64,
    samples: [u64; METRIC_SAMPLES],
    idx: usize,
    primed: bool,
}

impl InstantMetric {
    fn new() -> Self {
        Self {
            last_sample_ms: 0,
            last_value: 0,
            samples: [0; METRIC_SAMPLES],
            idx: 0,
            primed: false,
        }
    }

    fn sample(&mut self, now_ms: u64, value: u64) {
        if !self.primed {
            self.last_sample_ms = now_ms;
            self.last_value = value;
            self.primed = true;
            return;
        }
        let dt = now_ms.saturating_sub(self.last_sample_ms);
        if dt == 0 {
            return;
        }
        let rate = value.saturating_sub(self.last_value) * 1000 / dt;
        self.samples[self.idx] = rate;
        self.idx = (self.idx + 1) % METRIC_SAMPLES;
        self.last_sample_ms = now_ms;
        self.last_value = value;
    }

    /// Mean of the sampled per-second rates.
    pub fn per_sec(&self) -> u64 {
        self.samples.iter().sum::<u64>() / METRIC_SAMPLES as u64
    }
}

/// Scheduler state carried on the server context.
#[derive(Debug)]
pub struct CronState {
    /// Completed maintenance ticks.
    pub cronloops: u64,
    /// Coarse clock advanced per tick, used for object aging.
    pub aging_clock: u32,
    pub ops_metric: InstantMetric,
    pub dirty_metric: InstantMetric,
    expire_cursor: usize,
    rehash_cursor: usize,
    clients_cursor: ClientId,
    last_output_reset_ms: u64,
    last_save_ms: u64,
    last_save_dirty: u64,
}

impl CronState {
    pub fn new(_config: &Config) -> Self {
        Self {
            cronloops: 0,
            aging_clock: 0,
            ops_metric: InstantMetric::new(),
            dirty_metric: InstantMetric::new(),
            expire_cursor: 0,
            rehash_cursor: 0,
            clients_cursor: 0,
            last_output_reset_ms: 0,
            last_save_ms: unix_ms(),
            last_save_dirty: 0,
        }
    }
}

/// Whether the reactor keeps running after a maintenance tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronOutcome {
    Continue,
    /// Shutdown sequencing finished; the reactor exits.
    Exit,
}

/// What the pre-sleep hook decided about blocking on I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepDecision {
    /// False while connections still hold buffered output or replica acks
    /// are outstanding; the reactor then polls instead of parking.
    pub should_block: bool,
}

impl Server {
    /// One fixed-rate maintenance tick.
    pub fn cron_tick(&mut self) -> CronOutcome {
        self.exec.clock().refresh();
        let now = self.clock().cached_ms();
        self.cron.cronloops += 1;
        self.cron.aging_clock = self.cron.aging_clock.wrapping_add(1);

        let ops = self.stats.commands_processed;
        let dirty = self.dataset.dirty();
        self.cron.ops_metric.sample(now, ops);
        self.cron.dirty_metric.sample(now, dirty);

        // Blocked commands can always be released by their timeout.
        self.expire_blocked_clients(now);

        if self.shutdown.requested() {
            return self.shutdown_tick(now);
        }

        // Reap finished background children and dispatch per kind.
        while let Some(done) = self.jobs.poll_completed() {
            match done.kind {
                JobKind::Snapshot => {
                    self.cron.last_save_dirty = self.dataset.dirty();
                    self.cron.last_save_ms = now;
                    tracing::info!(ok = done.ok, "snapshot child finished");
                }
                JobKind::LogRewrite => {
                    self.log.rewrite_done(done.ok);
                    tracing::info!(ok = done.ok, "log rewrite child finished");
                }
                JobKind::Auxiliary => {
                    tracing::debug!(ok = done.ok, "auxiliary child finished");
                }
            }
        }

        // At most one background child at a time; a pending log rewrite
        // wins over a fresh snapshot.
        if self.jobs.active().is_none() {
            if self.log.state() == LogState::RewriteScheduled {
                self.jobs.spawn(JobKind::LogRewrite);
            } else if self.should_snapshot(now) {
                tracing::info!("save point reached, spawning snapshot child");
                self.jobs.spawn(JobKind::Snapshot);
            } else if self.log_rewrite_due() {
                self.log.schedule_rewrite();
            }
        }

        self.databases_cron(now);
        CronOutcome::Continue
    }

    fn shutdown_tick(&mut self, now: u64) -> CronOutcome {
        if self.shutdown.deadline_ms.is_none() {
            let deadline = now + self.config.shutdown.replica_drain_timeout_ms;
            self.shutdown.deadline_ms = Some(deadline);
            tracing::info!(deadline, "shutdown requested, waiting for replica drain");
        }
        let offset = self.replicas.stream_offset();
        let caught_up = self.replicas.acked_count(offset) == self.replicas.replica_count();
        let deadline_passed = self.shutdown.deadline_ms.is_some_and(|d| now >= d);
        if caught_up || deadline_passed {
            self.log.flush_if_due(now);
            tracing::info!(caught_up, "shutdown sequencing complete");
            return CronOutcome::Exit;
        }
        CronOutcome::Continue
    }

    fn should_snapshot(&self, now: u64) -> bool {
        let changes = self
            .dataset
            .dirty()
            .saturating_sub(self.cron.last_save_dirty);
        let elapsed = now.saturating_sub(self.cron.last_save_ms);
        self.config
            .snapshot
            .save_points
            .iter()
            .any(|sp| changes >= sp.changes && elapsed >= sp.secs * 1000)
    }

    fn log_rewrite_due(&self) -> bool {
        let pct = self.config.durability.rewrite_growth_percent;
        if pct == 0 || self.log.state() != LogState::Active {
            return false;
        }
        let size = self.log.current_size();
        if size < self.config.durability.rewrite_min_bytes {
            return false;
        }
        let base = self.log.size_at_last_rewrite();
        if base == 0 {
            return true;
        }
        (size.saturating_sub(base)) * 100 / base >= pct
    }

    /// Time-budgeted incremental pass over the databases: expiry sweep and
    /// container rehash, round-robined across ticks.
    fn databases_cron(&mut self, now: u64) {
        let started = Instant::now();
        let dbs = self.dataset.db_count();
        if dbs == 0 {
            return;
        }
        let mut visited = 0;
        while visited < dbs && started.elapsed().as_micros() < DB_WORK_BUDGET_US {
            let db = self.cron.expire_cursor % dbs;
            self.cron.expire_cursor = self.cron.expire_cursor.wrapping_add(1);
            visited += 1;

            let expired = self.dataset.expire_cycle(db, now, EXPIRE_BATCH);
            if !expired.is_empty() {
                self.stats.expired_keys += expired.len() as u64;
                // The sweep is its own execution unit; the deletions reach
                // the log and replicas exactly once, in sweep order.
                self.with_unit(|srv| {
                    for key in &expired {
                        srv.propagate(
                            db as i32,
                            vec![Bytes::from_static(b"DEL"), key.clone()],
                            PropTarget::BOTH,
                        );
                    }
                });
            }

            let rehash_db = self.cron.rehash_cursor % dbs;
            self.cron.rehash_cursor = self.cron.rehash_cursor.wrapping_add(1);
            while self.dataset.rehash_step(rehash_db) {
                if started.elapsed().as_micros() >= DB_WORK_BUDGET_US {
                    return;
                }
            }
        }
    }

    /// One adaptive client-maintenance cycle. Returns the delay until the
    /// next cycle, lengthened when the per-cycle quota cap was hit so the
    /// effective rate still visits every client roughly once per second.
    pub fn clients_tick(&mut self) -> Duration {
        let now = unix_ms();
        let count = self.clients.len();
        let target_rate = self.config.clients.target_visit_rate.max(1) as usize;
        let quota = (count / target_rate).clamp(CLIENTS_CRON_MIN_QUOTA, CLIENTS_CRON_MAX_QUOTA);

        let reset_peaks = now.saturating_sub(self.cron.last_output_reset_ms) >= OUTPUT_PEAK_RESET_MS;
        if reset_peaks {
            self.cron.last_output_reset_ms = now;
        }
        let timeout_ms = self.config.clients.timeout_secs * 1000;
        let shrink_threshold = self.config.clients.input_buffer_shrink_bytes;

        let mut to_disconnect = Vec::new();
        for id in self.clients.ids_from(self.cron.clients_cursor, quota) {
            self.cron.clients_cursor = id;
            let Some(client) = self.clients.get_mut(id) else {
                continue;
            };

            if timeout_ms > 0
                && !client.replica_link
                && client.blocked.is_none()
                && now.saturating_sub(client.last_interaction_ms) >= timeout_ms
            {
                to_disconnect.push(id);
                continue;
            }

            // Oversized, mostly idle input buffers give memory back.
            if client.input_buf_capacity > shrink_threshold
                && client.input_buf_len < client.input_buf_capacity / 4
            {
                client.input_buf_capacity =
                    (client.input_buf_capacity / 2).max(client.input_buf_len.max(INPUT_BUF_DEFAULT));
            }

            // Output buffer tracks the observed peak, decaying once the
            // peak resets.
            if client.output_buf_peak > client.output_buf_capacity {
                client.output_buf_capacity = client.output_buf_peak.next_power_of_two();
            } else if client.output_buf_capacity > OUTPUT_BUF_MIN
                && client.output_buf_peak < client.output_buf_capacity / 2
            {
                client.output_buf_capacity = (client.output_buf_capacity / 2).max(OUTPUT_BUF_MIN);
            }
            if reset_peaks {
                client.output_buf_peak = client.output_pending;
            }

            self.clients.rebucket(id);
        }

        for id in to_disconnect {
            tracing::info!(client = id, "disconnecting idle client");
            self.clients.remove(id);
            self.outbox.push((id, Admission::Disconnected));
        }

        let mut rate = target_rate;
        if count / target_rate > CLIENTS_CRON_MAX_QUOTA {
            rate = (count / CLIENTS_CRON_MAX_QUOTA).min(self.config.clients.max_hz as usize);
        }
        Duration::from_millis(1000 / rate.max(1) as u64)
    }

    /// Pre-sleep hook: runs once per reactor iteration before blocking on
    /// I/O.
    pub fn before_sleep(&mut self) -> SleepDecision {
        let now = unix_ms();
        self.log.flush_if_due(now);
        self.wake_blocked_clients();
        self.retry_postponed();
        self.replicas.trim_backlog(BACKLOG_TRIM_BUDGET);
        self.evict_clients_for_memory(None);

        let should_block =
            !self.clients.any_pending_output() && !self.replicas.pending_acks();
        SleepDecision { should_block }
    }

    /// Post-sleep hook: refresh the cached clock, close the yield window,
    /// adapt the I/O worker pool to observed load.
    pub fn after_sleep(&mut self) {
        self.exec.clock().refresh();
        if !self.busy.active {
            self.busy.yielding = false;
        }
        let queued = self.io_pool.queued();
        let target = (queued / IO_JOBS_PER_WORKER).clamp(1, IO_WORKERS_MAX);
        if target != self.io_pool.workers() {
            self.io_pool.resize(target);
        }
    }

    /// Wake blocked clients whose condition fired and re-admit them as
    /// reprocessing attempts.
    fn wake_blocked_clients(&mut self) {
        let events = self.dataset.take_events();
        for id in self.clients.blocked_ids() {
            let ready = match self.clients.get(id).and_then(|c| c.blocked.as_ref()) {
                Some(blocked) => match &blocked.spec.condition {
                    BlockCondition::KeyReady { db, key } => {
                        events.iter().any(|e| e.db == *db && e.key == *key)
                    }
                    BlockCondition::ReplicaAck { offset, count } => {
                        self.replicas.acked_count(*offset) >= *count
                    }
                },
                None => false,
            };
            if ready {
                self.reprocess(id, false);
            }
        }
    }

    /// Release blocked clients whose deadline elapsed; checked every
    /// maintenance tick.
    fn expire_blocked_clients(&mut self, now: u64) {
        for id in self.clients.blocked_ids() {
            let timed_out = self
                .clients
                .get(id)
                .and_then(|c| c.blocked.as_ref())
                .and_then(|b| b.spec.deadline_ms)
                .is_some_and(|deadline| now >= deadline);
            if timed_out {
                self.reprocess(id, true);
            }
        }
    }

    fn reprocess(&mut self, id: ClientId, timed_out: bool) {
        let Some(mut client) = self.clients.take(id) else {
            return;
        };
        client.block_timed_out = timed_out;
        let admission = self.admit(&mut client, None);
        self.finish_admission(id, client, admission);
    }

    /// Retry postponed commands verbatim.
    fn retry_postponed(&mut self) {
        for id in self.clients.postponed_ids() {
            let Some(mut client) = self.clients.take(id) else {
                continue;
            };
            let Some(argv) = client.postponed.take() else {
                self.clients.insert(client);
                continue;
            };
            let admission = self.admit(&mut client, Some(argv));
            self.finish_admission(id, client, admission);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_metric_rates() {
        let mut metric = InstantMetric::new();
        metric.sample(0, 0);
        metric.sample(1000, 500);
        metric.sample(2000, 1500);
        // Two samples: 500/s and 1000/s over a 16-slot ring.
        assert_eq!(metric.per_sec(), (500 + 1000) / 16);
    }

    #[test]
    fn instant_metric_ignores_zero_dt() {
        let mut metric = InstantMetric::new();
        metric.sample(10, 0);
        metric.sample(10, 100);
        assert_eq!(metric.per_sec(), 0);
    }
}
