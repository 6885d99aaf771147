//! Command descriptors, dispatch surface and reply values.
//!
//! Every command the server understands is described once, at startup, by a
//! [`CommandDescriptor`]: its signed arity, behavior flags, ACL categories,
//! key range and execution body. Descriptors live behind `Arc` in the
//! registry, are never destroyed during the process lifetime, and carry the
//! per-command counters the invoker maintains.
//!
//! Dispatch is a closed set: each builtin implements [`CommandBody`] and is
//! addressed through the registry by descriptor, giving O(1) dispatch
//! without function-pointer tables.

pub mod registry;
pub mod table;

use crate::client::Client;
use crate::core::error::RejectReason;
use crate::server::Server;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Behavior flag bitset for a command descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandFlags(u32);

impl CommandFlags {
    pub const NONE: Self = Self(0);
    /// May mutate the dataset.
    pub const WRITE: Self = Self(1 << 0);
    /// Never mutates the dataset.
    pub const READONLY: Self = Self(1 << 1);
    /// Rejected while used memory exceeds the ceiling.
    pub const DENY_OOM: Self = Self(1 << 2);
    /// Administrative command.
    pub const ADMIN: Self = Self(1 << 3);
    /// Does not require authentication.
    pub const NO_AUTH: Self = Self(1 << 4);
    /// Disabled unless protected commands are enabled by configuration.
    pub const PROTECTED: Self = Self(1 << 5);
    /// Allowed during a synchronous dataset load.
    pub const LOADING_OK: Self = Self(1 << 6);
    /// Denied during an asynchronous (background) dataset load.
    pub const NO_ASYNC_LOADING: Self = Self(1 << 7);
    /// Allowed on a replica whose upstream link is down.
    pub const STALE_OK: Self = Self(1 << 8);
    /// Allowed while a long-running script or module call is active.
    pub const ALLOW_BUSY: Self = Self(1 << 9);
    /// Allowed while the connection is in subscribe-only mode.
    pub const PUBSUB_OK: Self = Self(1 << 10);
    /// Forbidden while a transaction is open.
    pub const NO_MULTI: Self = Self(1 << 11);
    /// Transaction-control command; never queued into a transaction.
    pub const MULTI_CONTROL: Self = Self(1 << 12);
    /// Touches arbitrary keys; its multi-op flush skips transaction framing.
    pub const ARBITRARY_KEYS: Self = Self(1 << 13);
    /// May replicate even without dirtying the dataset.
    pub const MAY_REPLICATE: Self = Self(1 << 14);
    /// Excluded from the monitor feed.
    pub const SKIP_MONITOR: Self = Self(1 << 15);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for CommandFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for CommandFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// ACL category bitset attached to a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AclCategories(u32);

impl AclCategories {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const ADMIN: Self = Self(1 << 2);
    pub const FAST: Self = Self(1 << 3);
    pub const SLOW: Self = Self(1 << 4);
    pub const KEYSPACE: Self = Self(1 << 5);
    pub const CONNECTION: Self = Self(1 << 6);
    pub const TRANSACTION: Self = Self(1 << 7);
    pub const PUBSUB: Self = Self(1 << 8);
    pub const DANGEROUS: Self = Self(1 << 9);
    pub const BLOCKING: Self = Self(1 << 10);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AclCategories {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Positions of key arguments within the full argument vector
/// (index 0 is the command token itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeySpec {
    /// Index of the first key; 0 means the command is keyless.
    pub first: usize,
    /// Index of the last key; negative counts back from the end
    /// (-1 is the final argument).
    pub last: i32,
    /// Distance between consecutive keys.
    pub step: usize,
}

impl KeySpec {
    pub const NONE: Self = Self {
        first: 0,
        last: 0,
        step: 0,
    };

    pub const fn single(index: usize) -> Self {
        Self {
            first: index,
            last: index as i32,
            step: 1,
        }
    }

    pub const fn trailing(first: usize) -> Self {
        Self {
            first,
            last: -1,
            step: 1,
        }
    }

    pub const fn is_keyless(&self) -> bool {
        self.first == 0
    }

    /// Indexes of the key arguments for an argument vector of `argc` tokens.
    pub fn key_indexes(&self, argc: usize) -> Vec<usize> {
        if self.is_keyless() || self.step == 0 {
            return Vec::new();
        }
        let last = if self.last < 0 {
            let back = (-self.last) as usize;
            if back > argc {
                return Vec::new();
            }
            argc - back
        } else {
            self.last as usize
        };
        (self.first..=last.min(argc.saturating_sub(1)))
            .step_by(self.step)
            .collect()
    }
}

/// Externally observable per-command counters.
#[derive(Debug, Default)]
pub struct CommandStats {
    calls: AtomicU64,
    rejected_calls: AtomicU64,
    failed_calls: AtomicU64,
    usec_total: AtomicU64,
}

/// Point-in-time copy of a descriptor's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatsSnapshot {
    pub calls: u64,
    pub rejected_calls: u64,
    pub failed_calls: u64,
    pub usec_total: u64,
}

impl CommandStats {
    pub fn record_call(&self, usec: u64, failed: bool) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.usec_total.fetch_add(usec, Ordering::Relaxed);
        if failed {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rejected(&self) {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.calls.store(0, Ordering::Relaxed);
        self.rejected_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.usec_total.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CommandStatsSnapshot {
        CommandStatsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            usec_total: self.usec_total.load(Ordering::Relaxed),
        }
    }
}

const HISTOGRAM_BUCKETS: usize = 64;

/// Power-of-two bucketed latency histogram.
///
/// Recorded values are clamped to the configured microsecond range before
/// bucketing, so a single pathological sample cannot distort the spread.
#[derive(Debug)]
pub struct LatencyHistogram {
    min_us: u64,
    max_us: u64,
    buckets: [AtomicU64; HISTOGRAM_BUCKETS],
}

impl LatencyHistogram {
    pub fn new(min_us: u64, max_us: u64) -> Self {
        Self {
            min_us,
            max_us,
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn bucket_for(&self, us: u64) -> usize {
        let clamped = us.clamp(self.min_us.max(1), self.max_us);
        (63 - clamped.leading_zeros()) as usize
    }

    pub fn record(&self, us: u64) {
        let idx = self.bucket_for(us);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .sum()
    }

    /// Count of samples whose clamped value fell in the `2^idx..2^(idx+1)`
    /// microsecond bucket.
    pub fn count_at(&self, idx: usize) -> u64 {
        self.buckets[idx].load(Ordering::Relaxed)
    }
}

/// A single registered command (or subcommand).
pub struct CommandDescriptor {
    /// Canonical lowercase name. Subcommands use the `container|sub` form.
    pub name: String,
    /// Signed arity: exact when positive, minimum magnitude when negative.
    /// Counts the command token(s) themselves.
    pub arity: i32,
    pub flags: CommandFlags,
    pub acl: AclCategories,
    pub keys: KeySpec,
    /// One-level subcommand table; present only on container commands.
    pub subcommands: Option<Vec<Arc<CommandDescriptor>>>,
    /// Execution body. Container commands without a bare form have none;
    /// invoking such a descriptor is an internal invariant violation.
    pub body: Option<Arc<dyn CommandBody>>,
    pub stats: CommandStats,
    pub histogram: Option<LatencyHistogram>,
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("flags", &self.flags)
            .finish()
    }
}

impl CommandDescriptor {
    /// Whether `argc` tokens satisfy this descriptor's signed arity.
    pub fn arity_ok(&self, argc: usize) -> bool {
        if self.arity > 0 {
            argc == self.arity as usize
        } else {
            argc >= (-self.arity) as usize
        }
    }

    pub fn is_container(&self) -> bool {
        self.subcommands.is_some()
    }

    pub fn subcommand(&self, name: &str) -> Option<&Arc<CommandDescriptor>> {
        let subs = self.subcommands.as_ref()?;
        let lowered = name.to_ascii_lowercase();
        subs.iter()
            .find(|sub| sub.name.rsplit('|').next() == Some(lowered.as_str()))
    }
}

/// Declarative description used to build descriptors at registry startup.
pub struct CommandSpec {
    pub name: &'static str,
    pub arity: i32,
    pub flags: CommandFlags,
    pub acl: AclCategories,
    pub keys: KeySpec,
    pub body: Option<Arc<dyn CommandBody>>,
    pub subcommands: Vec<CommandSpec>,
}

impl CommandSpec {
    pub fn new(name: &'static str, arity: i32, body: Arc<dyn CommandBody>) -> Self {
        Self {
            name,
            arity,
            flags: CommandFlags::NONE,
            acl: AclCategories::NONE,
            keys: KeySpec::NONE,
            body: Some(body),
            subcommands: Vec::new(),
        }
    }

    pub fn container(name: &'static str, arity: i32) -> Self {
        Self {
            name,
            arity,
            flags: CommandFlags::NONE,
            acl: AclCategories::NONE,
            keys: KeySpec::NONE,
            body: None,
            subcommands: Vec::new(),
        }
    }

    pub fn flags(mut self, flags: CommandFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn acl(mut self, acl: AclCategories) -> Self {
        self.acl = acl;
        self
    }

    pub fn keys(mut self, keys: KeySpec) -> Self {
        self.keys = keys;
        self
    }

    pub fn sub(mut self, sub: CommandSpec) -> Self {
        self.subcommands.push(sub);
        self
    }

    /// Give a container command a bare (no-subcommand) form.
    pub fn bare_body(mut self, body: Arc<dyn CommandBody>) -> Self {
        self.body = Some(body);
        self
    }
}

/// Outcome of running a command body.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// The command completed with a reply.
    Reply(Reply),
    /// The command transitioned the client to the blocked state; the reply
    /// is produced by a later reprocessing attempt.
    Blocked(BlockSpec),
}

/// What a blocked command is waiting for, and until when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSpec {
    pub condition: BlockCondition,
    /// Absolute unix-millisecond deadline; `None` blocks indefinitely.
    pub deadline_ms: Option<u64>,
}

/// A blocked client's unblock condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockCondition {
    /// A key in the given database received a mutation.
    KeyReady { db: usize, key: Bytes },
    /// At least `count` replicas acknowledged the given stream offset.
    ReplicaAck { offset: u64, count: usize },
}

/// Execution body of a command. Implementations form a closed set built at
/// startup; bodies run on the reactor with exclusive access to the server
/// context and the issuing client.
pub trait CommandBody: Send + Sync {
    fn invoke(&self, srv: &mut Server, client: &mut Client) -> CommandOutcome;
}

/// Structured reply value handed to the protocol layer for rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Simple(String),
    Int(i64),
    Bulk(Bytes),
    Array(Vec<Reply>),
    Null,
    Error(ErrorReply),
}

impl Reply {
    pub fn simple(s: impl Into<String>) -> Self {
        Self::Simple(s.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Self::Bulk(data.into())
    }

    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self::Error(ErrorReply {
            code,
            message: message.into(),
        })
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self::error("ERR", message)
    }

    pub fn not_an_integer() -> Self {
        Self::error("ERR", "value is not an integer or out of range")
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl From<RejectReason> for Reply {
    fn from(reason: RejectReason) -> Self {
        Self::Error(ErrorReply {
            code: reason.code(),
            message: reason.to_string(),
        })
    }
}

/// A coded error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: &'static str,
    pub message: String,
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Parse an argument token as UTF-8, if it is.
pub fn arg_str(argv: &[Bytes], index: usize) -> Option<&str> {
    argv.get(index).and_then(|b| std::str::from_utf8(b).ok())
}

/// Parse an argument token as a signed integer.
pub fn arg_int(argv: &[Bytes], index: usize) -> Option<i64> {
    arg_str(argv, index).and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_union_and_contains() {
        let flags = CommandFlags::WRITE | CommandFlags::DENY_OOM;
        assert!(flags.contains(CommandFlags::WRITE));
        assert!(flags.contains(CommandFlags::DENY_OOM));
        assert!(!flags.contains(CommandFlags::ADMIN));
        assert!(CommandFlags::NONE.is_empty());
    }

    #[test]
    fn key_spec_single() {
        let spec = KeySpec::single(1);
        assert_eq!(spec.key_indexes(3), vec![1]);
    }

    #[test]
    fn key_spec_trailing() {
        // DEL key1 key2 key3
        let spec = KeySpec::trailing(1);
        assert_eq!(spec.key_indexes(4), vec![1, 2, 3]);
    }

    #[test]
    fn key_spec_keyless() {
        assert!(KeySpec::NONE.key_indexes(5).is_empty());
    }

    #[test]
    fn histogram_clamps_to_range() {
        let histogram = LatencyHistogram::new(8, 1024);
        histogram.record(1); // below range, clamps to 8
        histogram.record(1 << 20); // above range, clamps to 1024
        assert_eq!(histogram.count_at(3), 1);
        assert_eq!(histogram.count_at(10), 1);
        assert_eq!(histogram.total(), 2);
    }

    #[test]
    fn stats_record_and_reset() {
        let stats = CommandStats::default();
        stats.record_call(120, false);
        stats.record_call(80, true);
        stats.record_rejected();

        let snap = stats.snapshot();
        assert_eq!(snap.calls, 2);
        assert_eq!(snap.failed_calls, 1);
        assert_eq!(snap.rejected_calls, 1);
        assert_eq!(snap.usec_total, 200);

        stats.reset();
        assert_eq!(stats.snapshot().calls, 0);
    }
}
