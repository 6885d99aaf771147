//! Client state visible to the command-processing core.
//!
//! The core does not own sockets or buffers' contents; it tracks the
//! per-connection command state (resolved command, transaction queue,
//! blocking condition, propagation overrides) and the buffer accounting the
//! client-maintenance cron operates on.

use crate::command::{BlockSpec, CommandDescriptor};
use crate::propagate::PropTarget;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type ClientId = u64;

/// Default capacity assumed for a fresh connection's input buffer.
pub const INPUT_BUF_DEFAULT: usize = 16 * 1024;
/// Floor for the output buffer when shrinking.
pub const OUTPUT_BUF_MIN: usize = 4 * 1024;
/// Fixed per-connection bookkeeping overhead counted into the footprint.
const CLIENT_OVERHEAD: usize = 1024;

/// Smallest footprint bit width that gets its own memory bucket.
const BUCKET_MIN_BITS: u32 = 10;
/// Largest footprint bit width that gets its own memory bucket.
const BUCKET_MAX_BITS: u32 = 32;
/// Number of client memory buckets.
pub const MEM_BUCKETS: usize = (BUCKET_MAX_BITS - BUCKET_MIN_BITS + 1) as usize;

/// Memory bucket index for a footprint: the number of significant bits,
/// clamped to the fixed range. Eviction scans walk buckets, not clients.
pub fn mem_bucket_for(footprint: u64) -> usize {
    let bits = 64 - footprint.max(1).leading_zeros();
    (bits.clamp(BUCKET_MIN_BITS, BUCKET_MAX_BITS) - BUCKET_MIN_BITS) as usize
}

/// Per-command propagation overrides.
///
/// Saved, cleared and restored around every invocation so a nested call
/// cannot leak its overrides into the enclosing command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropOverride {
    /// Targets the command forces even without dirtying the dataset.
    pub force: PropTarget,
    /// Targets the command suppresses; both targets suppressed means
    /// propagation is prevented entirely.
    pub suppress: PropTarget,
}

impl PropOverride {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn prevents_all(&self) -> bool {
        self.suppress.contains(PropTarget::BOTH)
    }
}

/// A resolved command: descriptor plus the (possibly rewritten) argument
/// vector, index 0 being the command token.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub desc: Arc<CommandDescriptor>,
    pub argv: Vec<Bytes>,
}

/// Open transaction state.
#[derive(Debug, Default)]
pub struct MultiState {
    pub queued: Vec<Resolved>,
    /// Set when a queued command was rejected; EXEC aborts.
    pub poisoned: bool,
}

/// State of a blocked client.
#[derive(Debug, Clone)]
pub struct BlockedState {
    pub spec: BlockSpec,
    /// Microseconds already spent in prior attempts, finalized on unblock.
    pub acc_us: u64,
}

/// One connected client as seen by the core.
#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    pub name: Option<String>,
    /// Selected logical database.
    pub db: u32,
    pub authenticated: bool,
    /// Privileged replication-source link (our primary feeding us).
    pub from_primary: bool,
    /// An outgoing replica's connection to us.
    pub replica_link: bool,
    /// Negotiated modern protocol; legacy connections are restricted while
    /// subscribed.
    pub resp3: bool,

    /// Currently resolved command, kept across blocking for reprocessing.
    pub resolved: Option<Resolved>,
    /// Raw argument vector of a postponed command, retried verbatim.
    pub postponed: Option<Vec<Bytes>>,
    pub multi: Option<MultiState>,
    pub blocked: Option<BlockedState>,
    /// Set when the blocked deadline fired; the body replies accordingly.
    pub block_timed_out: bool,
    pub prop: PropOverride,
    /// Dataset mutations observed during the last command.
    pub dirty_delta: u64,

    pub subscribed_channels: usize,
    pub closing: bool,

    // Buffer accounting maintained by the protocol layer, consumed by the
    // client cron.
    pub last_interaction_ms: u64,
    pub input_buf_capacity: usize,
    pub input_buf_len: usize,
    pub output_buf_capacity: usize,
    pub output_buf_peak: usize,
    pub output_pending: usize,
}

impl Client {
    pub fn new(id: ClientId, now_ms: u64) -> Self {
        Self {
            id,
            name: None,
            db: 0,
            authenticated: false,
            from_primary: false,
            replica_link: false,
            resp3: false,
            resolved: None,
            postponed: None,
            multi: None,
            blocked: None,
            block_timed_out: false,
            prop: PropOverride::default(),
            dirty_delta: 0,
            subscribed_channels: 0,
            closing: false,
            last_interaction_ms: now_ms,
            input_buf_capacity: INPUT_BUF_DEFAULT,
            input_buf_len: 0,
            output_buf_capacity: OUTPUT_BUF_MIN,
            output_buf_peak: 0,
            output_pending: 0,
        }
    }

    /// Approximate memory attributable to this connection.
    pub fn footprint(&self) -> u64 {
        (self.input_buf_capacity
            + self.output_buf_capacity
            + self.name.as_ref().map_or(0, |n| n.len())
            + CLIENT_OVERHEAD) as u64
    }

    /// Whether the client sits inside an open transaction.
    pub fn in_multi(&self) -> bool {
        self.multi.is_some()
    }

    /// Replace the argument vector the propagation path will stage.
    ///
    /// Commands with non-deterministic argument forms (relative expirations)
    /// rewrite themselves into an absolute form before replication.
    pub fn rewrite_args(&mut self, argv: Vec<Bytes>) {
        if let Some(resolved) = self.resolved.as_mut() {
            resolved.argv = argv;
        }
    }

    /// Reset transient per-command state ahead of a fresh admission.
    pub fn reset_command_state(&mut self) {
        self.resolved = None;
        self.dirty_delta = 0;
        self.prop.clear();
    }
}

/// The connected-client table, bucketed by memory footprint so eviction
/// scans are O(buckets) rather than O(clients).
#[derive(Default)]
pub struct ClientTable {
    clients: BTreeMap<ClientId, Client>,
    buckets: [Vec<ClientId>; MEM_BUCKETS],
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn insert(&mut self, client: Client) {
        let id = client.id;
        let bucket = mem_bucket_for(client.footprint());
        self.buckets[bucket].push(id);
        self.clients.insert(id, client);
    }

    /// Remove a client for exclusive processing; reinsert with
    /// [`ClientTable::insert`].
    pub fn take(&mut self, id: ClientId) -> Option<Client> {
        let client = self.clients.remove(&id)?;
        self.unbucket(id);
        Some(client)
    }

    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.take(id)
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    /// Up to `count` client ids starting after `cursor`, wrapping around.
    pub fn ids_from(&self, cursor: ClientId, count: usize) -> Vec<ClientId> {
        if self.clients.is_empty() || count == 0 {
            return Vec::new();
        }
        let mut out: Vec<ClientId> = self
            .clients
            .range(cursor.wrapping_add(1)..)
            .take(count)
            .map(|(id, _)| *id)
            .collect();
        if out.len() < count {
            out.extend(
                self.clients
                    .range(..=cursor)
                    .take(count - out.len())
                    .map(|(id, _)| *id),
            );
        }
        out
    }

    /// Re-derive a client's memory bucket after its buffers changed.
    pub fn rebucket(&mut self, id: ClientId) {
        let Some(footprint) = self.clients.get(&id).map(Client::footprint) else {
            return;
        };
        self.unbucket(id);
        self.buckets[mem_bucket_for(footprint)].push(id);
    }

    pub fn bucket_of(&self, id: ClientId) -> Option<usize> {
        self.buckets.iter().position(|b| b.contains(&id))
    }

    /// The heaviest client, found by scanning buckets from the top.
    pub fn heaviest(&self) -> Option<ClientId> {
        for bucket in self.buckets.iter().rev() {
            if let Some(id) = bucket
                .iter()
                .max_by_key(|id| self.clients.get(*id).map_or(0, Client::footprint))
            {
                return Some(*id);
            }
        }
        None
    }

    pub fn total_footprint(&self) -> u64 {
        self.clients.values().map(Client::footprint).sum()
    }

    pub fn any_pending_output(&self) -> bool {
        self.clients.values().any(|c| c.output_pending > 0)
    }

    /// Ids of clients currently blocked.
    pub fn blocked_ids(&self) -> Vec<ClientId> {
        self.clients
            .values()
            .filter(|c| c.blocked.is_some())
            .map(|c| c.id)
            .collect()
    }

    /// Ids of clients with a postponed command awaiting retry.
    pub fn postponed_ids(&self) -> Vec<ClientId> {
        self.clients
            .values()
            .filter(|c| c.postponed.is_some())
            .map(|c| c.id)
            .collect()
    }

    fn unbucket(&mut self, id: ClientId) {
        for bucket in self.buckets.iter_mut() {
            if let Some(pos) = bucket.iter().position(|b| *b == id) {
                bucket.swap_remove(pos);
                return;
            }
        }
    }
}
