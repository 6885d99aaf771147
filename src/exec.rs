//! The invocation engine.
//!
//! [`Server::call`] runs one (possibly nested) command invocation: it tracks
//! nesting structurally through an RAII guard, freezes the cached clock on
//! the 0→1 transition, measures the body with the monotonic clock, updates
//! the per-command counters and decides whether and where the command
//! propagates. When the outermost unit ends, the staged ops are flushed in
//! one atomic pass.

use crate::client::Client;
use crate::command::{CommandDescriptor, CommandFlags, CommandOutcome, Reply};
use crate::core::time::ClockCache;
use crate::propagate::{PropOp, PropTarget};
use crate::server::{MonitorEvent, Server};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Process-wide execution-unit state: nesting depth, the clock frozen for
/// the outermost unit, and the per-command out-of-memory snapshot.
#[derive(Debug)]
pub struct ExecState {
    depth: AtomicU32,
    clock: ClockCache,
    oom: AtomicBool,
}

impl ExecState {
    pub fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
            clock: ClockCache::new(),
            oom: AtomicBool::new(false),
        }
    }

    /// Current nesting depth.
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    /// Enter an execution unit. The cached clock is refreshed only on the
    /// 0→1 transition so nested invocations observe the frozen instant.
    pub fn enter(this: &Arc<Self>) -> UnitGuard {
        let prev = this.depth.fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            this.clock.refresh();
        }
        UnitGuard { exec: this.clone() }
    }

    pub fn clock(&self) -> &ClockCache {
        &self.clock
    }

    /// Out-of-memory decision snapshotted at the start of the current
    /// top-level command.
    pub fn oom_snapshot(&self) -> bool {
        self.oom.load(Ordering::Acquire)
    }

    pub fn set_oom_snapshot(&self, oom: bool) {
        self.oom.store(oom, Ordering::Release);
    }
}

impl Default for ExecState {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII execution-unit scope; dropping it decrements nesting, so matched
/// exit is structural rather than a pair of manual calls.
#[derive(Debug)]
pub struct UnitGuard {
    exec: Arc<ExecState>,
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        let prev = self.exec.depth.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "execution unit nesting underflow");
    }
}

/// Caller-granted propagation capability for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFlags(u8);

impl CallFlags {
    /// No propagation permitted regardless of what the command did.
    pub const NONE: Self = Self(0);
    /// Durable-log propagation permitted.
    pub const PROPAGATE_LOG: Self = Self(1 << 0);
    /// Replica-stream propagation permitted.
    pub const PROPAGATE_REPLICAS: Self = Self(1 << 1);
    /// Both targets permitted; the normal path.
    pub const FULL: Self = Self(1 << 0 | 1 << 1);

    pub(crate) fn granted_targets(self) -> PropTarget {
        let mut target = PropTarget::NONE;
        if self.0 & Self::PROPAGATE_LOG.0 != 0 {
            target |= PropTarget::LOG;
        }
        if self.0 & Self::PROPAGATE_REPLICAS.0 != 0 {
            target |= PropTarget::REPLICAS;
        }
        target
    }
}

impl Server {
    /// Run the client's resolved command as one invocation.
    ///
    /// Nested use (a transaction body or any command invoking another) is
    /// the supported composition mechanism: staged propagation accumulates
    /// across the whole unit and flushes once, at the end of the outermost
    /// invocation.
    pub fn call(&mut self, client: &mut Client, flags: CallFlags) -> CommandOutcome {
        let desc = match client.resolved.as_ref() {
            Some(resolved) => resolved.desc.clone(),
            None => panic!("call without a resolved command"),
        };
        let body = match desc.body.clone() {
            Some(body) => body,
            // A descriptor that resolved yet has no body can only mean the
            // table is corrupt; consistency is gone.
            None => panic!("command '{}' resolved with no body", desc.name),
        };

        let top_level = self.exec.depth() == 0;
        if top_level {
            self.top_level = Some(desc.clone());
        }

        // Per-invocation propagation overrides: save, clear, decide, restore.
        let saved_prop = client.prop;
        client.prop.clear();

        let dirty_before = self.dataset.dirty();
        let started = Instant::now();
        let guard = ExecState::enter(&self.exec);
        let outcome = body.invoke(self, client);
        drop(guard);

        let elapsed_us = started.elapsed().as_micros() as u64;
        let dirty_delta = self.dataset.dirty().saturating_sub(dirty_before);
        client.dirty_delta = dirty_delta;

        match &outcome {
            CommandOutcome::Blocked(spec) => {
                // Duration and stats finalize when the client unblocks.
                client.blocked = Some(crate::client::BlockedState {
                    spec: spec.clone(),
                    acc_us: client.blocked.as_ref().map_or(0, |b| b.acc_us) + elapsed_us,
                });
            }
            CommandOutcome::Reply(reply) => {
                let total_us =
                    elapsed_us + client.blocked.take().map_or(0, |b| b.acc_us);
                desc.stats.record_call(total_us, reply.is_error());
                if let Some(histogram) = desc.histogram.as_ref() {
                    histogram.record(total_us);
                }

                self.stage_self_propagation(client, dirty_delta, flags);
                self.feed_monitors(client, &desc);
                self.stats.commands_processed += 1;
                self.track_memory_peak();
            }
        }

        client.prop = saved_prop;

        if self.exec.depth() == 0 {
            self.flush_propagation();
            self.top_level = None;
        }
        outcome
    }

    /// Compute the command's own propagation target and stage its (possibly
    /// rewritten) argument vector after any ops the body staged itself.
    fn stage_self_propagation(&mut self, client: &mut Client, dirty_delta: u64, flags: CallFlags) {
        if client.prop.prevents_all() {
            return;
        }
        let mut target = PropTarget::NONE;
        if dirty_delta > 0 {
            target = PropTarget::BOTH;
        }
        target |= client.prop.force;
        target = target.and(flags.granted_targets());
        target = target.minus(client.prop.suppress);
        if target.is_empty() {
            return;
        }
        let argv = match client.resolved.as_ref() {
            Some(resolved) => resolved.argv.clone(),
            None => return,
        };
        self.prop_buf.push(PropOp {
            db: client.db as i32,
            args: argv,
            target,
        });
    }

    fn feed_monitors(&mut self, client: &Client, desc: &Arc<CommandDescriptor>) {
        if self.monitors.is_empty() || desc.flags.contains(CommandFlags::SKIP_MONITOR) {
            return;
        }
        let Some(resolved) = client.resolved.as_ref() else {
            return;
        };
        let ts_us = self.exec.clock().cached_us();
        let argv = resolved.argv.clone();
        let monitors: Vec<_> = self
            .monitors
            .iter()
            .copied()
            .filter(|m| *m != client.id)
            .collect();
        for monitor in monitors {
            self.monitor_feed.push(MonitorEvent {
                monitor,
                ts_us,
                db: client.db,
                client: client.id,
                argv: argv.clone(),
            });
        }
    }

    /// Run a closure inside a bare execution unit (scheduler-originated
    /// work such as the expiry sweep), flushing staged ops at the end when
    /// this was the outermost unit.
    pub fn with_unit<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let guard = ExecState::enter(&self.exec);
        let result = f(self);
        drop(guard);
        if self.exec.depth() == 0 {
            self.flush_propagation();
        }
        result
    }
}

/// Convenience for bodies that just reply.
pub fn reply(reply: Reply) -> CommandOutcome {
    CommandOutcome::Reply(reply)
}
