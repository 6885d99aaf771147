//! The ordered admission pipeline.
//!
//! Every incoming command passes through a strictly ordered sequence of
//! gates before it may execute. A gate passes, rejects (structured error,
//! transaction poisoned, accumulated duration dropped) or postpones (no side
//! effects, retried verbatim on a later scheduler pass). All rejections
//! happen before any dataset mutation, so a refused command never partially
//! applies.
//!
//! The gate order is load-bearing; reordering changes observable behavior
//! (deferral must precede rejection while yielding, eviction must precede
//! the memory snapshot, and so on).

use crate::client::{Client, ClientId, Resolved};
use crate::command::{CommandFlags, CommandOutcome, Reply};
use crate::core::config::HandoverPolicy;
use crate::core::error::{PostponeReason, RejectReason};
use crate::core::time::unix_ms;
use crate::exec::CallFlags;
use crate::server::interfaces::{slot_for_key, LogState, SlotOwner};
use crate::server::{Loading, PauseScope, Role, Server};
use bytes::Bytes;

/// Rate limit for the privileged-writer warning while the durable log is in
/// a failed state.
const MISCONF_WARN_PERIOD_MS: u64 = 10_000;

/// Structured outcome of one admission attempt, rendered to wire format by
/// the protocol layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Accepted and executed; carries the reply.
    Dispatched(Reply),
    /// Accumulated into the client's open transaction.
    Queued,
    /// Refused by a gate.
    Rejected(RejectReason),
    /// Deferred with no side effects; retried on a later scheduler pass.
    Postponed(PostponeReason),
    /// The command transitioned the client to the blocked state.
    Blocked,
    /// The issuing client was freed mid-admission; no reply may be sent.
    Disconnected,
}

impl Server {
    /// Run the admission pipeline for one command.
    ///
    /// `input` carries the raw argument vector of a fresh command; `None`
    /// marks a reprocessing attempt for a client whose command was resolved
    /// by a prior admission (it was blocked) — resolution and the one-time
    /// pre-filters are skipped in that case.
    pub fn admit(&mut self, client: &mut Client, input: Option<Vec<Bytes>>) -> Admission {
        match input {
            None => {
                // Gate 1: reprocessing — the resolved command is reused.
                if client.resolved.is_none() {
                    return Admission::Rejected(RejectReason::UnknownCommand {
                        name: String::new(),
                    });
                }
            }
            Some(argv) => {
                client.reset_command_state();
                client.postponed = None;

                // Gate 2: while the server is yielding out of a long-running
                // operation, everything not explicitly allowed is postponed
                // before resolution gets the chance to reject it.
                if self.busy.yielding {
                    let allowed = self
                        .registry
                        .resolve(&argv, false)
                        .map(|d| d.flags.contains(CommandFlags::ALLOW_BUSY))
                        .unwrap_or(false);
                    if !allowed {
                        client.postponed = Some(argv);
                        return Admission::Postponed(PostponeReason::BusyYield);
                    }
                }

                // Gate 3: resolution, existence and arity.
                let desc = match self.registry.resolve(&argv, false) {
                    Ok(desc) => desc,
                    Err(reason) => return self.reject(client, reason),
                };
                let arity_ok = desc.arity_ok(argv.len());
                let name = desc.name.clone();
                client.resolved = Some(Resolved { desc, argv });
                if !arity_ok {
                    return self.reject(client, RejectReason::WrongArity { name });
                }
            }
        }

        let desc = match client.resolved.as_ref() {
            Some(resolved) => resolved.desc.clone(),
            None => {
                return Admission::Rejected(RejectReason::UnknownCommand {
                    name: String::new(),
                })
            }
        };
        let argc = client.resolved.as_ref().map_or(0, |r| r.argv.len());

        // Gate 4: protected commands.
        if desc.flags.contains(CommandFlags::PROTECTED)
            && !self.config.server.enable_protected_commands
        {
            let name = desc.name.clone();
            return self.reject(client, RejectReason::ProtectedCommand { name });
        }

        // Gate 5: authentication.
        if self.config.server.require_auth
            && !client.authenticated
            && !desc.flags.contains(CommandFlags::NO_AUTH)
        {
            return self.reject(client, RejectReason::AuthRequired);
        }

        // Gate 6: some commands are forbidden inside a transaction.
        if client.in_multi() && desc.flags.contains(CommandFlags::NO_MULTI) {
            let name = desc.name.clone();
            return self.reject(client, RejectReason::ForbiddenInTransaction { name });
        }

        // Gate 7: permission check.
        let denial = match client.resolved.as_ref() {
            Some(resolved) => self.acl.check(client, &desc, &resolved.argv).err(),
            None => None,
        };
        if let Some(denial) = denial {
            tracing::warn!(
                client = client.id,
                command = %desc.name,
                arg_index = ?denial.arg_index,
                reason = %denial.reason,
                "permission denied"
            );
            return self.reject(
                client,
                RejectReason::NoPermission {
                    reason: denial.reason,
                    arg_index: denial.arg_index,
                },
            );
        }

        // Gate 8: cluster slot ownership and redirection.
        if self.cluster.enabled() && !desc.keys.is_keyless() && !client.from_primary {
            let slots: Vec<u16> = match client.resolved.as_ref() {
                Some(resolved) => desc
                    .keys
                    .key_indexes(argc)
                    .into_iter()
                    .map(|idx| slot_for_key(&resolved.argv[idx]))
                    .collect(),
                None => Vec::new(),
            };
            if let Some(&slot) = slots.first() {
                if slots.iter().any(|s| *s != slot) {
                    return self.reject(client, RejectReason::CrossSlot);
                }
                match self.cluster.owner_of(slot) {
                    SlotOwner::Local => {}
                    SlotOwner::Unknown => {
                        return self.reject(client, RejectReason::ClusterDown)
                    }
                    SlotOwner::Remote(target) => {
                        // During a coordinated role handover the policy knob
                        // decides between deferral and a redirect that might
                        // loop.
                        if self.cluster.handover_in_progress()
                            && self.config.replication.handover_policy
                                == HandoverPolicy::Postpone
                        {
                            return self.postpone(client, PostponeReason::RoleHandover);
                        }
                        return self
                            .reject(client, RejectReason::ClusterRedirect { slot, target });
                    }
                }
            }
        }

        // Gate 9: resource-pressure client eviction may free the very client
        // issuing the command; abort with no reply when it does.
        if !self.evict_clients_for_memory(Some(&*client)) {
            client.closing = true;
            return Admission::Disconnected;
        }

        // Gate 10: memory admission. The over-limit decision is snapshotted
        // once per top-level command so nested operations observe a stable
        // answer. Replication-source clients are never memory-rejected.
        if self.config.memory.max_bytes > 0 && !client.from_primary {
            if self.exec.depth() == 0 {
                let max = self.config.memory.max_bytes;
                let mut over = self.dataset.memory_used() > max;
                if over {
                    self.dataset.reclaim(max);
                    over = self.dataset.memory_used() > max;
                }
                self.exec.set_oom_snapshot(over);
            }
            if self.exec.oom_snapshot() && desc.flags.contains(CommandFlags::DENY_OOM) {
                return self.reject(client, RejectReason::OutOfMemory);
            }
        }

        // Gate 11: standing durable-log failure denies ordinary writes.
        if desc.flags.contains(CommandFlags::WRITE)
            && self.log.state() != LogState::Off
            && self.log.last_error().is_some()
        {
            if client.from_primary {
                let now = unix_ms();
                if now.saturating_sub(self.last_misconf_warn_ms) >= MISCONF_WARN_PERIOD_MS {
                    self.last_misconf_warn_ms = now;
                    tracing::warn!(
                        command = %desc.name,
                        "applying replicated write despite durable log error"
                    );
                }
            } else {
                return self.reject(client, RejectReason::DurabilityError);
            }
        }

        // Gate 12: insufficient healthy replicas.
        let min_replicas = self.config.replication.min_replicas_to_write;
        if desc.flags.contains(CommandFlags::WRITE)
            && min_replicas > 0
            && self.role == Role::Primary
        {
            let healthy = self.replicas.good_replica_count() as u32;
            if healthy < min_replicas {
                return self.reject(
                    client,
                    RejectReason::InsufficientReplicas {
                        required: min_replicas,
                        healthy,
                    },
                );
            }
        }

        // Gate 13: read-only replica refuses ordinary writes.
        if desc.flags.contains(CommandFlags::WRITE)
            && self.role.is_replica()
            && self.config.replication.read_only_replica
            && !client.from_primary
        {
            return self.reject(client, RejectReason::ReadOnlyReplica);
        }

        // Gate 14: legacy subscribe-only mode.
        if client.subscribed_channels > 0
            && !client.resp3
            && !desc.flags.contains(CommandFlags::PUBSUB_OK)
        {
            return self.reject(client, RejectReason::SubscriberRestricted);
        }

        // Gate 15: replica with a broken upstream link and stale reads off.
        if let Role::Replica { link_up: false } = self.role {
            if !self.config.replication.serve_stale_data
                && !desc.flags.contains(CommandFlags::STALE_OK)
            {
                return self.reject(client, RejectReason::UpstreamLinkDown);
            }
        }

        // Gate 16: loading state; the asynchronous deny-list is narrower.
        match self.loading {
            Loading::Sync if !desc.flags.contains(CommandFlags::LOADING_OK) => {
                return self.reject(client, RejectReason::LoadingInProgress);
            }
            Loading::Async if desc.flags.contains(CommandFlags::NO_ASYNC_LOADING) => {
                return self.reject(client, RejectReason::LoadingInProgress);
            }
            _ => {}
        }

        // Gate 17: busy script or module call.
        if self.busy.active && !desc.flags.contains(CommandFlags::ALLOW_BUSY) {
            return self.reject(client, RejectReason::BusyUpstream);
        }

        // Gate 18: replica links may not touch the keyspace themselves.
        if client.replica_link && !desc.keys.is_keyless() {
            return self.reject(client, RejectReason::ReplicaKeyspaceViolation);
        }

        // Gate 19: global pause.
        let now = unix_ms();
        if let Some(scope) = self.active_pause(now) {
            let applies = match scope {
                PauseScope::All => true,
                PauseScope::Writes => {
                    desc.flags.contains(CommandFlags::WRITE)
                        || desc.flags.contains(CommandFlags::MAY_REPLICATE)
                }
            };
            if applies && !client.from_primary {
                return self.postpone(client, PostponeReason::Paused);
            }
        }

        // Gate 20: transaction accumulation, else immediate invocation.
        if client.in_multi() && !desc.flags.contains(CommandFlags::MULTI_CONTROL) {
            if let Some(resolved) = client.resolved.take() {
                if let Some(multi) = client.multi.as_mut() {
                    multi.queued.push(resolved);
                }
            }
            return Admission::Queued;
        }

        match self.call(client, CallFlags::FULL) {
            CommandOutcome::Reply(reply) => Admission::Dispatched(reply),
            CommandOutcome::Blocked(_) => Admission::Blocked,
        }
    }

    /// Common rejection path: per-command counter, transaction poisoning,
    /// accumulated-duration drop.
    fn reject(&mut self, client: &mut Client, reason: RejectReason) -> Admission {
        if let Some(resolved) = client.resolved.as_ref() {
            resolved.desc.stats.record_rejected();
        }
        if let Some(multi) = client.multi.as_mut() {
            multi.poisoned = true;
        }
        client.blocked = None;
        client.resolved = None;
        Admission::Rejected(reason)
    }

    /// Common postponement path: stash the verbatim argument vector for a
    /// later retry and leave no other trace of the attempt.
    fn postpone(&mut self, client: &mut Client, reason: PostponeReason) -> Admission {
        if client.postponed.is_none() {
            client.postponed = client.resolved.take().map(|resolved| resolved.argv);
        }
        Admission::Postponed(reason)
    }

    /// Process one parsed command from the I/O bridge for a table-resident
    /// client. The structured outcome lands in the outbox.
    pub fn handle_input(&mut self, id: ClientId, argv: Vec<Bytes>) {
        let Some(mut client) = self.clients.take(id) else {
            return;
        };
        client.last_interaction_ms = unix_ms();
        let admission = self.admit(&mut client, Some(argv));
        self.finish_admission(id, client, admission);
    }

    /// Route an admission outcome: replies go to the outbox, postponed and
    /// blocked clients wait silently, evicted clients are dropped.
    pub(crate) fn finish_admission(&mut self, id: ClientId, client: Client, admission: Admission) {
        let closing = client.closing;
        match admission {
            Admission::Disconnected => {
                self.outbox.push((id, Admission::Disconnected));
            }
            Admission::Postponed(_) | Admission::Blocked => {
                self.clients.insert(client);
            }
            other => {
                self.outbox.push((id, other));
                if closing {
                    self.outbox.push((id, Admission::Disconnected));
                } else {
                    self.clients.insert(client);
                }
            }
        }
    }
}
