//! Rejection taxonomy for the admission pipeline.
//!
//! Every admission gate that denies a command produces one of these reasons.
//! Postponement is deliberately not part of the taxonomy: a postponed command
//! is deferred with no side effects and is not a user-visible error.
//!
//! The `code()` identifiers are stable string constants; the protocol layer
//! prefixes them onto the rendered error line and clients dispatch on them.

use thiserror::Error;

/// Why the admission pipeline refused a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    /// No descriptor registered under this name.
    #[error("unknown command '{name}'")]
    UnknownCommand { name: String },

    /// The container command exists but the subcommand token does not.
    #[error("unknown subcommand '{sub}' for '{name}'")]
    UnknownSubcommand { name: String, sub: String },

    /// Token count violates the descriptor's signed arity.
    #[error("wrong number of arguments for '{name}' command")]
    WrongArity { name: String },

    /// Administrative command disabled by configuration.
    #[error("command '{name}' is protected and disabled by configuration")]
    ProtectedCommand { name: String },

    /// The connection has not authenticated and the command is not exempt.
    #[error("authentication required")]
    AuthRequired,

    /// The permission subsystem denied the command.
    #[error("permission denied: {reason}")]
    NoPermission {
        reason: String,
        /// Index of the offending argument, when the denial names one.
        arg_index: Option<usize>,
    },

    /// The keys hash to a slot served by another node.
    #[error("slot {slot} is served by {target}")]
    ClusterRedirect { slot: u16, target: String },

    /// Multi-key command whose keys map to different slots.
    #[error("keys map to different slots")]
    CrossSlot,

    /// Slot ownership could not be established.
    #[error("slot ownership unknown, cluster is unavailable")]
    ClusterDown,

    /// Write command against a read-only replica.
    #[error("writes are not accepted by a read-only replica")]
    ReadOnlyReplica,

    /// Memory is over the configured ceiling and the command denies OOM.
    #[error("command not allowed when used memory exceeds the ceiling")]
    OutOfMemory,

    /// The durable log has a standing write or fsync error.
    #[error("writes are disabled due to a durable log error")]
    DurabilityError,

    /// Fewer healthy, caught-up replicas than the configured minimum.
    #[error("need {required} healthy replicas, have {healthy}")]
    InsufficientReplicas { required: u32, healthy: u32 },

    /// A synchronous (or narrower asynchronous) dataset load is in progress.
    #[error("dataset load in progress")]
    LoadingInProgress,

    /// A long-running script or module call holds the server.
    #[error("server is busy running a long operation")]
    BusyUpstream,

    /// A replica link may not itself touch the keyspace.
    #[error("replica links may not issue keyspace commands")]
    ReplicaKeyspaceViolation,

    /// Replica with a broken upstream link and stale reads disabled.
    #[error("upstream link is down and stale reads are disabled")]
    UpstreamLinkDown,

    /// Connection is in legacy subscribe-only mode.
    #[error("only subscribe-family commands are allowed in this context")]
    SubscriberRestricted,

    /// Command may not run while a transaction is open.
    #[error("'{name}' is not allowed inside a transaction")]
    ForbiddenInTransaction { name: String },
}

impl RejectReason {
    /// Stable wire error code for this rejection.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownCommand { .. }
            | Self::UnknownSubcommand { .. }
            | Self::WrongArity { .. }
            | Self::ProtectedCommand { .. } => "ERR",
            Self::AuthRequired => "NOAUTH",
            Self::NoPermission { .. } => "NOPERM",
            Self::ClusterRedirect { .. } => "MOVED",
            Self::CrossSlot => "CROSSSLOT",
            Self::ClusterDown => "CLUSTERDOWN",
            Self::ReadOnlyReplica => "READONLY",
            Self::OutOfMemory => "OOM",
            Self::DurabilityError => "MISCONF",
            Self::InsufficientReplicas { .. } => "NOREPLICAS",
            Self::LoadingInProgress => "LOADING",
            Self::BusyUpstream => "BUSY",
            Self::ReplicaKeyspaceViolation => "ERR",
            Self::UpstreamLinkDown => "MASTERDOWN",
            Self::SubscriberRestricted => "ERR",
            Self::ForbiddenInTransaction { .. } => "ERR",
        }
    }
}

/// Why a command was deferred rather than decided.
///
/// A postponed command is retried verbatim on a later scheduler pass; the
/// aborted attempt leaves no side effects and sends nothing to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostponeReason {
    /// The server is yielding control out of a long-running operation.
    BusyYield,
    /// A coordinated primary/replica role handover is in progress.
    RoleHandover,
    /// Client activity is globally paused.
    Paused,
}
