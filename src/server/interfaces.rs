//! External collaborator interfaces.
//!
//! The core consumes these subsystems through traits: the storage engine's
//! container, the durable log, the replica stream, the permission subsystem,
//! the cluster slot map, background child processes and the I/O worker pool.
//! Each trait ships a simple in-memory implementation so the core runs and
//! tests without a live server around it.

use crate::client::Client;
use crate::command::CommandDescriptor;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// A key-mutation notification drained by the pre-sleep hook to wake
/// blocked clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub db: usize,
    pub key: Bytes,
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Missing,
    Persistent,
    Remaining(u64),
}

/// The storage engine's key/value container, as the core sees it.
///
/// The dirty counter is the sole authoritative signal of "did this mutate":
/// it increases monotonically by one per key-level mutation.
pub trait Dataset: Send {
    fn dirty(&self) -> u64;
    fn db_count(&self) -> usize;
    fn key_count(&self, db: usize) -> usize;
    fn get(&mut self, db: usize, key: &[u8], now_ms: u64) -> Option<Bytes>;
    fn contains(&mut self, db: usize, key: &[u8], now_ms: u64) -> bool;
    fn set(&mut self, db: usize, key: Bytes, value: Bytes, expire_at_ms: Option<u64>);
    fn del(&mut self, db: usize, key: &[u8]) -> bool;
    /// Set an absolute expiration; false when the key does not exist.
    fn expire(&mut self, db: usize, key: &[u8], at_ms: u64) -> bool;
    fn ttl(&self, db: usize, key: &[u8], now_ms: u64) -> Ttl;
    /// Drop every key in every database, returning how many were removed.
    fn flush_all(&mut self) -> u64;
    fn memory_used(&self) -> u64;
    /// Attempt to reclaim memory down to `target_bytes`; returns bytes freed.
    fn reclaim(&mut self, target_bytes: u64) -> u64;
    /// One incremental resize/rehash step; true while more work remains.
    fn rehash_step(&mut self, db: usize) -> bool;
    /// Remove up to `budget` expired keys from one database, returning them.
    fn expire_cycle(&mut self, db: usize, now_ms: u64, budget: usize) -> Vec<Bytes>;
    /// Drain pending key-mutation notifications.
    fn take_events(&mut self) -> Vec<KeyEvent>;
}

/// Durable log state as consumed by the admission pipeline and flush path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    Off,
    Active,
    /// A rewrite was requested and awaits a free background slot.
    RewriteScheduled,
}

/// Standing asynchronous log failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogError {
    Write,
    Fsync,
}

/// The durable command log. Formats and file handling are out of scope;
/// the core only feeds frames and consults state.
pub trait DurableLog: Send {
    fn state(&self) -> LogState;
    /// Append one command frame. `db` of -1 means no database selector is
    /// needed (transaction markers).
    fn feed(&mut self, db: i32, args: &[Bytes]);
    fn schedule_rewrite(&mut self);
    fn rewrite_done(&mut self, ok: bool);
    fn last_error(&self) -> Option<LogError>;
    fn clear_error(&mut self);
    fn flush_if_due(&mut self, now_ms: u64);
    fn current_size(&self) -> u64;
    fn size_at_last_rewrite(&self) -> u64;
}

/// The replica stream: connected replicas, backlog and acknowledgements.
pub trait ReplicaStream: Send {
    fn replica_count(&self) -> usize;
    /// Replicas that are healthy and caught up.
    fn good_replica_count(&self) -> usize;
    fn has_backlog(&self) -> bool;
    fn feed(&mut self, db: i32, args: &[Bytes]);
    /// Current end offset of the stream.
    fn stream_offset(&self) -> u64;
    /// Replicas that have acknowledged at least `offset`.
    fn acked_count(&self, offset: u64) -> usize;
    /// Whether acknowledgement probes are outstanding.
    fn pending_acks(&self) -> bool;
    /// Trim up to `budget_bytes` from the backlog; returns bytes trimmed.
    fn trim_backlog(&mut self, budget_bytes: usize) -> usize;
}

/// A denial from the permission subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclDenial {
    pub reason: String,
    /// Index of the offending argument, when one can be named.
    pub arg_index: Option<usize>,
}

/// The permission subsystem: a single check call per command.
pub trait AccessControl: Send {
    fn check(
        &self,
        client: &Client,
        desc: &CommandDescriptor,
        argv: &[Bytes],
    ) -> Result<(), AclDenial>;
}

/// Number of cluster slots.
pub const SLOT_COUNT: u16 = 16384;

const SLOT_HASH_SEED: u64 = 0x9ae1;

/// Slot for a key. A `{tag}` substring, when present and non-empty, is
/// hashed instead of the whole key so related keys can share a slot.
pub fn slot_for_key(key: &[u8]) -> u16 {
    let hashed = match hash_tag(key) {
        Some(tag) => tag,
        None => key,
    };
    let mut hasher = XxHash64::with_seed(SLOT_HASH_SEED);
    hasher.write(hashed);
    (hasher.finish() % SLOT_COUNT as u64) as u16
}

fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|b| *b == b'{')?;
    let close = key[open + 1..].iter().position(|b| *b == b'}')?;
    if close == 0 {
        return None;
    }
    Some(&key[open + 1..open + 1 + close])
}

/// Who serves a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOwner {
    Local,
    Remote(String),
    Unknown,
}

/// The cluster subsystem, reduced to slot ownership.
pub trait ClusterMap: Send {
    fn enabled(&self) -> bool;
    fn owner_of(&self, slot: u16) -> SlotOwner;
    /// Whether a coordinated primary/replica role handover is in progress.
    fn handover_in_progress(&self) -> bool;
}

/// Kinds of forked background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Snapshot,
    LogRewrite,
    Auxiliary,
}

/// A reaped background child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedJob {
    pub kind: JobKind,
    pub ok: bool,
}

/// Forked background children: at most one active at a time, reaped by the
/// maintenance cron and dispatched to the matching completion handler.
pub trait BackgroundJobs: Send {
    fn active(&self) -> Option<JobKind>;
    /// Start a child; false when one is already running.
    fn spawn(&mut self, kind: JobKind) -> bool;
    fn poll_completed(&mut self) -> Option<CompletedJob>;
}

/// The I/O worker pool, resized by the post-sleep hook from observed load.
pub trait IoPool: Send {
    fn queued(&self) -> usize;
    fn workers(&self) -> usize;
    fn resize(&mut self, workers: usize);
}

// ============================================================================
// In-memory implementations
// ============================================================================

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expire_at_ms: Option<u64>,
}

/// Hash-map dataset with lazy and cyclic expiration. Rehashing is a no-op;
/// the container reports no pending resize work.
pub struct MemoryDataset {
    dbs: Vec<HashMap<Bytes, Entry>>,
    dirty: u64,
    bytes: u64,
    events: Vec<KeyEvent>,
}

impl MemoryDataset {
    pub fn new(db_count: usize) -> Self {
        Self {
            dbs: (0..db_count.max(1)).map(|_| HashMap::new()).collect(),
            dirty: 0,
            bytes: 0,
            events: Vec::new(),
        }
    }

    fn touch(&mut self, db: usize, key: &Bytes) {
        self.dirty += 1;
        self.events.push(KeyEvent {
            db,
            key: key.clone(),
        });
    }

    fn entry_live(entry: &Entry, now_ms: u64) -> bool {
        entry.expire_at_ms.map_or(true, |at| at > now_ms)
    }
}

impl Dataset for MemoryDataset {
    fn dirty(&self) -> u64 {
        self.dirty
    }

    fn db_count(&self) -> usize {
        self.dbs.len()
    }

    fn key_count(&self, db: usize) -> usize {
        self.dbs.get(db).map_or(0, HashMap::len)
    }

    fn get(&mut self, db: usize, key: &[u8], now_ms: u64) -> Option<Bytes> {
        // Expired entries are merely hidden here; the scheduler's expiry
        // sweep performs the actual deletion so the mutation is counted and
        // propagated exactly once.
        let entry = self.dbs.get(db)?.get(key)?;
        Self::entry_live(entry, now_ms).then(|| entry.value.clone())
    }

    fn contains(&mut self, db: usize, key: &[u8], now_ms: u64) -> bool {
        self.get(db, key, now_ms).is_some()
    }

    fn set(&mut self, db: usize, key: Bytes, value: Bytes, expire_at_ms: Option<u64>) {
        let Some(map) = self.dbs.get_mut(db) else {
            return;
        };
        let added = (key.len() + value.len()) as u64;
        if let Some(old) = map.insert(
            key.clone(),
            Entry {
                value,
                expire_at_ms,
            },
        ) {
            self.bytes = self
                .bytes
                .saturating_sub((key.len() + old.value.len()) as u64);
        }
        self.bytes += added;
        self.touch(db, &key);
    }

    fn del(&mut self, db: usize, key: &[u8]) -> bool {
        let Some(map) = self.dbs.get_mut(db) else {
            return false;
        };
        match map.remove(key) {
            Some(old) => {
                self.bytes = self
                    .bytes
                    .saturating_sub((key.len() + old.value.len()) as u64);
                let key = Bytes::copy_from_slice(key);
                self.touch(db, &key);
                true
            }
            None => false,
        }
    }

    fn expire(&mut self, db: usize, key: &[u8], at_ms: u64) -> bool {
        let Some(map) = self.dbs.get_mut(db) else {
            return false;
        };
        match map.get_mut(key) {
            Some(entry) => {
                entry.expire_at_ms = Some(at_ms);
                let key = Bytes::copy_from_slice(key);
                self.touch(db, &key);
                true
            }
            None => false,
        }
    }

    fn ttl(&self, db: usize, key: &[u8], now_ms: u64) -> Ttl {
        match self.dbs.get(db).and_then(|m| m.get(key)) {
            None => Ttl::Missing,
            Some(entry) if !Self::entry_live(entry, now_ms) => Ttl::Missing,
            Some(entry) => match entry.expire_at_ms {
                None => Ttl::Persistent,
                Some(at) => Ttl::Remaining(at - now_ms),
            },
        }
    }

    fn flush_all(&mut self) -> u64 {
        let mut removed = 0;
        for db in self.dbs.iter_mut() {
            removed += db.len() as u64;
            db.clear();
        }
        self.dirty += removed;
        self.bytes = 0;
        removed
    }

    fn memory_used(&self) -> u64 {
        self.bytes
    }

    fn reclaim(&mut self, target_bytes: u64) -> u64 {
        // Only expired entries are reclaimable here.
        let before = self.bytes;
        let now = crate::core::time::unix_ms();
        for db in 0..self.dbs.len() {
            if self.bytes <= target_bytes {
                break;
            }
            self.expire_cycle(db, now, usize::MAX);
        }
        before - self.bytes
    }

    fn rehash_step(&mut self, _db: usize) -> bool {
        false
    }

    fn expire_cycle(&mut self, db: usize, now_ms: u64, budget: usize) -> Vec<Bytes> {
        let Some(map) = self.dbs.get(db) else {
            return Vec::new();
        };
        let expired: Vec<Bytes> = map
            .iter()
            .filter(|(_, entry)| !Self::entry_live(entry, now_ms))
            .take(budget)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.del(db, key);
        }
        expired
    }

    fn take_events(&mut self) -> Vec<KeyEvent> {
        std::mem::take(&mut self.events)
    }
}

/// One frame fed to a sink, retained for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub db: i32,
    pub args: Vec<Bytes>,
}

/// In-memory durable log.
pub struct MemoryLog {
    state: LogState,
    error: Option<LogError>,
    records: Vec<Frame>,
    bytes: u64,
    base_bytes: u64,
    pub flushes: u64,
    last_flush_ms: u64,
    flush_interval_ms: u64,
}

impl MemoryLog {
    pub fn active() -> Self {
        Self::with_state(LogState::Active)
    }

    pub fn disabled() -> Self {
        Self::with_state(LogState::Off)
    }

    fn with_state(state: LogState) -> Self {
        Self {
            state,
            error: None,
            records: Vec::new(),
            bytes: 0,
            base_bytes: 0,
            flushes: 0,
            last_flush_ms: 0,
            flush_interval_ms: 1000,
        }
    }

    pub fn set_error(&mut self, error: Option<LogError>) {
        self.error = error;
    }

    pub fn records(&self) -> &[Frame] {
        &self.records
    }
}

impl DurableLog for MemoryLog {
    fn state(&self) -> LogState {
        self.state
    }

    fn feed(&mut self, db: i32, args: &[Bytes]) {
        self.bytes += args.iter().map(|a| a.len() as u64).sum::<u64>();
        self.records.push(Frame {
            db,
            args: args.to_vec(),
        });
    }

    fn schedule_rewrite(&mut self) {
        if self.state == LogState::Active {
            self.state = LogState::RewriteScheduled;
        }
    }

    fn rewrite_done(&mut self, ok: bool) {
        if self.state != LogState::Off {
            self.state = LogState::Active;
        }
        if ok {
            self.base_bytes = self.bytes;
        }
    }

    fn last_error(&self) -> Option<LogError> {
        self.error
    }

    fn clear_error(&mut self) {
        self.error = None;
    }

    fn flush_if_due(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.last_flush_ms) >= self.flush_interval_ms {
            self.flushes += 1;
            self.last_flush_ms = now_ms;
        }
    }

    fn current_size(&self) -> u64 {
        self.bytes
    }

    fn size_at_last_rewrite(&self) -> u64 {
        self.base_bytes
    }
}

/// Replica stream with a fixed, test-settable population.
pub struct StaticReplicas {
    count: usize,
    good: usize,
    backlog: bool,
    offset: u64,
    acked: Vec<u64>,
    frames: Vec<Frame>,
    backlog_bytes: usize,
}

impl StaticReplicas {
    pub fn none() -> Self {
        Self::new(0, 0)
    }

    pub fn new(count: usize, good: usize) -> Self {
        Self {
            count,
            good,
            backlog: count > 0,
            offset: 0,
            acked: vec![0; count],
            frames: Vec::new(),
            backlog_bytes: 0,
        }
    }

    pub fn with_backlog(mut self, backlog: bool) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn set_acked(&mut self, replica: usize, offset: u64) {
        if let Some(slot) = self.acked.get_mut(replica) {
            *slot = offset;
        }
    }

    pub fn ack_all(&mut self) {
        let offset = self.offset;
        for slot in self.acked.iter_mut() {
            *slot = offset;
        }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

impl ReplicaStream for StaticReplicas {
    fn replica_count(&self) -> usize {
        self.count
    }

    fn good_replica_count(&self) -> usize {
        self.good
    }

    fn has_backlog(&self) -> bool {
        self.backlog
    }

    fn feed(&mut self, db: i32, args: &[Bytes]) {
        let len: usize = args.iter().map(Bytes::len).sum();
        self.offset += len as u64;
        self.backlog_bytes += len;
        self.frames.push(Frame {
            db,
            args: args.to_vec(),
        });
    }

    fn stream_offset(&self) -> u64 {
        self.offset
    }

    fn acked_count(&self, offset: u64) -> usize {
        self.acked.iter().filter(|a| **a >= offset).count()
    }

    fn pending_acks(&self) -> bool {
        let offset = self.offset;
        self.count > 0 && self.acked.iter().any(|a| *a < offset)
    }

    fn trim_backlog(&mut self, budget_bytes: usize) -> usize {
        let trimmed = self.backlog_bytes.min(budget_bytes);
        self.backlog_bytes -= trimmed;
        trimmed
    }
}

/// Permission subsystem that allows everything.
pub struct PermitAll;

impl AccessControl for PermitAll {
    fn check(
        &self,
        _client: &Client,
        _desc: &CommandDescriptor,
        _argv: &[Bytes],
    ) -> Result<(), AclDenial> {
        Ok(())
    }
}

/// Deny-list permission subsystem: whole commands and key prefixes.
#[derive(Default)]
pub struct StaticAcl {
    denied_commands: HashSet<String>,
    denied_key_prefixes: Vec<Bytes>,
}

impl StaticAcl {
    pub fn deny_command(mut self, name: &str) -> Self {
        self.denied_commands.insert(name.to_ascii_lowercase());
        self
    }

    pub fn deny_key_prefix(mut self, prefix: impl Into<Bytes>) -> Self {
        self.denied_key_prefixes.push(prefix.into());
        self
    }
}

impl AccessControl for StaticAcl {
    fn check(
        &self,
        _client: &Client,
        desc: &CommandDescriptor,
        argv: &[Bytes],
    ) -> Result<(), AclDenial> {
        if self.denied_commands.contains(&desc.name) {
            return Err(AclDenial {
                reason: format!("command '{}' is not permitted", desc.name),
                arg_index: None,
            });
        }
        for idx in desc.keys.key_indexes(argv.len()) {
            let key = &argv[idx];
            if self
                .denied_key_prefixes
                .iter()
                .any(|p| key.starts_with(p.as_ref()))
            {
                return Err(AclDenial {
                    reason: "key is not permitted".to_string(),
                    arg_index: Some(idx),
                });
            }
        }
        Ok(())
    }
}

/// Cluster map for a non-clustered deployment.
pub struct SingleNode;

impl ClusterMap for SingleNode {
    fn enabled(&self) -> bool {
        false
    }

    fn owner_of(&self, _slot: u16) -> SlotOwner {
        SlotOwner::Local
    }

    fn handover_in_progress(&self) -> bool {
        false
    }
}

/// Cluster map with explicit remote and unknown slot sets.
#[derive(Default)]
pub struct StaticCluster {
    remote_slots: HashMap<u16, String>,
    unknown_slots: HashSet<u16>,
    handover: bool,
}

impl StaticCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remote(mut self, slot: u16, target: impl Into<String>) -> Self {
        self.remote_slots.insert(slot, target.into());
        self
    }

    pub fn unknown(mut self, slot: u16) -> Self {
        self.unknown_slots.insert(slot);
        self
    }

    pub fn handover(mut self, in_progress: bool) -> Self {
        self.handover = in_progress;
        self
    }
}

impl ClusterMap for StaticCluster {
    fn enabled(&self) -> bool {
        true
    }

    fn owner_of(&self, slot: u16) -> SlotOwner {
        if self.unknown_slots.contains(&slot) {
            return SlotOwner::Unknown;
        }
        match self.remote_slots.get(&slot) {
            Some(target) => SlotOwner::Remote(target.clone()),
            None => SlotOwner::Local,
        }
    }

    fn handover_in_progress(&self) -> bool {
        self.handover
    }
}

/// Background jobs that complete on the next poll.
#[derive(Default)]
pub struct InlineJobs {
    active: Option<JobKind>,
    completed: VecDeque<CompletedJob>,
    /// Every spawn, for test inspection.
    pub spawned: Vec<JobKind>,
}

impl InlineJobs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackgroundJobs for InlineJobs {
    fn active(&self) -> Option<JobKind> {
        self.active
    }

    fn spawn(&mut self, kind: JobKind) -> bool {
        if self.active.is_some() {
            return false;
        }
        self.active = Some(kind);
        self.spawned.push(kind);
        true
    }

    fn poll_completed(&mut self) -> Option<CompletedJob> {
        if let Some(kind) = self.active.take() {
            self.completed.push_back(CompletedJob { kind, ok: true });
        }
        self.completed.pop_front()
    }
}

/// Fixed-size I/O pool with no queue visibility.
pub struct FixedIoPool {
    workers: usize,
}

impl FixedIoPool {
    pub fn new(workers: usize) -> Self {
        Self { workers }
    }
}

impl IoPool for FixedIoPool {
    fn queued(&self) -> usize {
        0
    }

    fn workers(&self) -> usize {
        self.workers
    }

    fn resize(&mut self, workers: usize) {
        self.workers = workers;
    }
}
