//! Configuration parsing and validation.
//!
//! Configuration is loaded from TOML files. Sections mirror the core's
//! components: the maintenance scheduler, memory admission, replication
//! gates, durability triggers, snapshot save points, client maintenance and
//! the per-command latency histogram.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Lowest accepted maintenance timer rate.
pub const HZ_MIN: u32 = 1;
/// Highest accepted maintenance timer rate.
pub const HZ_MAX: u32 = 500;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Reactor and command-gating settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Memory admission control.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Replication-related admission gates.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Durable log rewrite triggers.
    #[serde(default)]
    pub durability: DurabilityConfig,

    /// Scheduled snapshot save points.
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Client maintenance cron.
    #[serde(default)]
    pub clients: ClientsConfig,

    /// Per-command latency histogram.
    #[serde(default)]
    pub latency: LatencyConfig,

    /// Shutdown sequencing.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Reactor and command-gating settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Maintenance timer rate in ticks per second (1..=500).
    #[serde(default = "default_hz")]
    pub hz: u32,

    /// Number of logical databases.
    #[serde(default = "default_databases")]
    pub databases: u32,

    /// Whether clients must authenticate before ordinary commands.
    #[serde(default)]
    pub require_auth: bool,

    /// Shared password checked by AUTH; credential schemes beyond this live
    /// in the external permission subsystem.
    #[serde(default)]
    pub password: Option<String>,

    /// Whether protected (administrative) commands are enabled.
    #[serde(default)]
    pub enable_protected_commands: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hz: default_hz(),
            databases: default_databases(),
            require_auth: false,
            password: None,
            enable_protected_commands: false,
        }
    }
}

/// Memory admission control.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryConfig {
    /// Dataset memory ceiling in bytes; 0 disables memory admission.
    #[serde(default)]
    pub max_bytes: u64,

    /// Aggregate client-buffer ceiling in bytes; 0 disables client eviction.
    #[serde(default)]
    pub client_eviction_bytes: u64,
}

/// Policy for commands hitting a slot mid-handover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HandoverPolicy {
    /// Defer the command until the handover resolves.
    #[default]
    Postpone,
    /// Emit a redirect immediately, accepting possible redirect loops.
    Redirect,
}

/// Replication-related admission gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Minimum count of healthy, caught-up replicas required for writes;
    /// 0 disables the gate.
    #[serde(default)]
    pub min_replicas_to_write: u32,

    /// Whether a replica refuses writes from ordinary clients.
    #[serde(default = "default_true")]
    pub read_only_replica: bool,

    /// Whether a replica with a broken upstream link keeps serving reads.
    #[serde(default = "default_true")]
    pub serve_stale_data: bool,

    /// What to do with slot traffic during a coordinated role handover.
    #[serde(default)]
    pub handover_policy: HandoverPolicy,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            min_replicas_to_write: 0,
            read_only_replica: true,
            serve_stale_data: true,
            handover_policy: HandoverPolicy::default(),
        }
    }
}

/// Durable log rewrite triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurabilityConfig {
    /// Schedule a log rewrite once the log has grown by this percentage
    /// over its size after the previous rewrite; 0 disables the trigger.
    #[serde(default = "default_rewrite_growth_percent")]
    pub rewrite_growth_percent: u64,

    /// Do not trigger growth-based rewrites below this log size.
    #[serde(default = "default_rewrite_min_bytes")]
    pub rewrite_min_bytes: u64,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            rewrite_growth_percent: default_rewrite_growth_percent(),
            rewrite_min_bytes: default_rewrite_min_bytes(),
        }
    }
}

/// One scheduled snapshot trigger: after `secs` seconds and at least
/// `changes` dataset mutations since the last snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SavePoint {
    pub secs: u64,
    pub changes: u64,
}

/// Scheduled snapshot save points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_save_points")]
    pub save_points: Vec<SavePoint>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            save_points: default_save_points(),
        }
    }
}

/// Client maintenance cron.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientsConfig {
    /// Idle timeout in seconds before a client is disconnected;
    /// 0 disables idle disconnection.
    #[serde(default)]
    pub timeout_secs: u64,

    /// Target client-cron rate in cycles per second. The quota per cycle is
    /// `client_count / target_visit_rate` so every client is visited roughly
    /// once per second.
    #[serde(default = "default_target_visit_rate")]
    pub target_visit_rate: u32,

    /// Ceiling on the effective client-cron rate when the per-cycle quota
    /// cap forces the cycle delay to shrink.
    #[serde(default = "default_clients_max_hz")]
    pub max_hz: u32,

    /// Input buffers above this capacity are candidates for shrinking when
    /// mostly unused.
    #[serde(default = "default_input_shrink_bytes")]
    pub input_buffer_shrink_bytes: usize,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 0,
            target_visit_rate: default_target_visit_rate(),
            max_hz: default_clients_max_hz(),
            input_buffer_shrink_bytes: default_input_shrink_bytes(),
        }
    }
}

/// Per-command latency histogram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyConfig {
    /// Whether descriptors carry a latency histogram at all.
    #[serde(default = "default_true")]
    pub histogram_enabled: bool,

    /// Recorded values are clamped to at least this many microseconds.
    #[serde(default = "default_latency_min_us")]
    pub min_us: u64,

    /// Recorded values are clamped to at most this many microseconds.
    #[serde(default = "default_latency_max_us")]
    pub max_us: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            histogram_enabled: true,
            min_us: default_latency_min_us(),
            max_us: default_latency_max_us(),
        }
    }
}

/// Shutdown sequencing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long the shutdown state machine waits for replicas to catch up
    /// before exiting regardless.
    #[serde(default = "default_drain_timeout_ms")]
    pub replica_drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            replica_drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

fn default_hz() -> u32 {
    10
}

fn default_databases() -> u32 {
    16
}

fn default_true() -> bool {
    true
}

fn default_rewrite_growth_percent() -> u64 {
    100
}

fn default_rewrite_min_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_save_points() -> Vec<SavePoint> {
    vec![
        SavePoint {
            secs: 3600,
            changes: 1,
        },
        SavePoint {
            secs: 300,
            changes: 100,
        },
        SavePoint {
            secs: 60,
            changes: 10_000,
        },
    ]
}

fn default_target_visit_rate() -> u32 {
    10
}

fn default_clients_max_hz() -> u32 {
    HZ_MAX
}

fn default_input_shrink_bytes() -> usize {
    32 * 1024
}

fn default_latency_min_us() -> u64 {
    1
}

fn default_latency_max_us() -> u64 {
    30_000_000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if !(HZ_MIN..=HZ_MAX).contains(&self.server.hz) {
            anyhow::bail!(
                "server.hz must be within {}..={}, got {}",
                HZ_MIN,
                HZ_MAX,
                self.server.hz
            );
        }
        if self.server.databases == 0 {
            anyhow::bail!("server.databases must be at least 1");
        }
        if self.clients.target_visit_rate == 0 {
            anyhow::bail!("clients.target_visit_rate must be at least 1");
        }
        if !(HZ_MIN..=HZ_MAX).contains(&self.clients.max_hz) {
            anyhow::bail!(
                "clients.max_hz must be within {}..={}, got {}",
                HZ_MIN,
                HZ_MAX,
                self.clients.max_hz
            );
        }
        if self.latency.min_us >= self.latency.max_us {
            anyhow::bail!(
                "latency.min_us ({}) must be below latency.max_us ({})",
                self.latency.min_us,
                self.latency.max_us
            );
        }
        Ok(())
    }
}
