//! Mutation propagation: staging and atomic flush.
//!
//! During an execution unit, mutation ops accumulate in the propagation
//! buffer in staging order. When nesting returns to zero the buffer is
//! flushed exactly once: each op is routed independently to the durable log
//! and/or the replica stream, wrapped in transaction framing when more than
//! one op is emitted — replay order is semantically significant, so the
//! whole unit must apply atomically on consumers.

use crate::command::CommandFlags;
use crate::server::interfaces::LogState;
use crate::server::Server;
use bytes::Bytes;

/// Propagation target bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PropTarget(u8);

impl PropTarget {
    pub const NONE: Self = Self(0);
    pub const LOG: Self = Self(1 << 0);
    pub const REPLICAS: Self = Self(1 << 1);
    pub const BOTH: Self = Self(1 << 0 | 1 << 1);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn and(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn minus(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for PropTarget {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PropTarget {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One staged mutation op. The buffer owns the argument clones exclusively
/// from staging until flush; they are consumed exactly once.
#[derive(Debug, Clone)]
pub struct PropOp {
    /// Database index, or -1 when no selector is needed.
    pub db: i32,
    pub args: Vec<Bytes>,
    pub target: PropTarget,
}

/// Initial op capacity; the vector doubles on overflow and the capacity is
/// retained across flushes.
const INITIAL_OPS: usize = 8;

/// Ordered accumulation of staged ops for one execution unit.
#[derive(Debug)]
pub struct PropagationBuffer {
    ops: Vec<PropOp>,
}

impl PropagationBuffer {
    pub fn new() -> Self {
        Self {
            ops: Vec::with_capacity(INITIAL_OPS),
        }
    }

    pub fn push(&mut self, op: PropOp) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ops.capacity()
    }

    fn clear(&mut self) {
        self.ops.clear();
    }
}

impl Default for PropagationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Ops currently staged and awaiting the end-of-unit flush.
    pub fn propagation_pending(&self) -> usize {
        self.prop_buf.len()
    }

    /// Stage an op for propagation at the end of the current execution unit.
    ///
    /// Callable only from within an execution unit; argument clones are
    /// taken here and owned by the buffer until flush.
    pub fn propagate(&mut self, db: i32, args: Vec<Bytes>, target: PropTarget) {
        assert!(
            self.exec.depth() > 0,
            "propagation staged outside an execution unit"
        );
        if target.is_empty() {
            return;
        }
        self.prop_buf.push(PropOp { db, args, target });
    }

    /// Flush the staged ops. Runs exactly once per execution unit, when
    /// nesting has returned to zero.
    pub(crate) fn flush_propagation(&mut self) {
        assert!(
            self.exec.depth() == 0,
            "propagation flush inside an execution unit"
        );
        if self.prop_buf.is_empty() {
            return;
        }

        // Per-flush routing permissions: the log is reachable only when
        // enabled and propagation is globally permitted; the replica stream
        // only when someone is listening.
        let log_permitted = self.log.state() != LogState::Off
            && self.propagation_enabled
            && matches!(self.loading, crate::server::Loading::None);
        let replicas_permitted =
            self.replicas.has_backlog() || self.replicas.replica_count() > 0;
        let mut permitted = PropTarget::NONE;
        if log_permitted {
            permitted |= PropTarget::LOG;
        }
        if replicas_permitted {
            permitted |= PropTarget::REPLICAS;
        }

        // Multi-op flushes are wrapped in transaction framing unless the
        // single top-level command that produced them touches arbitrary keys
        // and ran as the direct top-level call (bulk expiry sweeps and the
        // like gain nothing from framing).
        let skip_wrap = self
            .top_level
            .as_ref()
            .is_some_and(|desc| desc.flags.contains(CommandFlags::ARBITRARY_KEYS));
        let wrap = self.prop_buf.len() > 1 && !skip_wrap;

        let mut union = PropTarget::NONE;
        for op in &self.prop_buf.ops {
            union |= op.target.and(permitted);
        }

        if wrap && !union.is_empty() {
            let marker = [Bytes::from_static(b"MULTI")];
            if union.contains(PropTarget::LOG) {
                self.log.feed(-1, &marker);
            }
            if union.contains(PropTarget::REPLICAS) {
                self.replicas.feed(-1, &marker);
            }
        }

        for op in &self.prop_buf.ops {
            let effective = op.target.and(permitted);
            if effective.contains(PropTarget::LOG) {
                self.log.feed(op.db, &op.args);
            }
            if effective.contains(PropTarget::REPLICAS) {
                self.replicas.feed(op.db, &op.args);
            }
        }

        if wrap && !union.is_empty() {
            let marker = [Bytes::from_static(b"EXEC")];
            if union.contains(PropTarget::LOG) {
                self.log.feed(-1, &marker);
            }
            if union.contains(PropTarget::REPLICAS) {
                self.replicas.feed(-1, &marker);
            }
        }

        self.prop_buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_bit_algebra() {
        assert!(PropTarget::BOTH.contains(PropTarget::LOG));
        assert!(PropTarget::BOTH.contains(PropTarget::REPLICAS));
        assert!(!PropTarget::LOG.contains(PropTarget::REPLICAS));
        assert_eq!(PropTarget::BOTH.minus(PropTarget::LOG), PropTarget::REPLICAS);
        assert_eq!(
            PropTarget::LOG.and(PropTarget::REPLICAS),
            PropTarget::NONE
        );
        assert!(PropTarget::NONE.is_empty());
    }

    #[test]
    fn buffer_retains_capacity_across_clear() {
        let mut buf = PropagationBuffer::new();
        for i in 0..100 {
            buf.push(PropOp {
                db: 0,
                args: vec![Bytes::from(format!("op{i}"))],
                target: PropTarget::BOTH,
            });
        }
        let grown = buf.capacity();
        assert!(grown >= 100);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), grown);
    }
}
