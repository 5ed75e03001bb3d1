//! Configuration types for cachemeta
//!
//! Deserialized from the TOML file given to `cachemeta-meta --config`.
//! Every field has a serde default so partial files are accepted.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the metadata service
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub events: EventStreamConfig,
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Config {
    /// Resolve paths that were left relative to the node data directory
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.node.data_dir.join("metadata.redb")
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    #[serde(default = "default_node_name")]
    pub name: String,
    /// Data directory for the local metadata store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            data_dir: default_data_dir(),
        }
    }
}

/// Consistency engine tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// A heartbeat older than this forces clients to retry
    #[serde(default = "default_heartbeat_staleness_secs")]
    pub heartbeat_staleness_secs: u64,
    /// Interval between checkpoints while ready as master
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    /// Number of concurrent replay workers
    #[serde(default = "default_max_event_parallelism")]
    pub max_event_parallelism: usize,
    /// Bounded replay queue capacity (backpressure limit)
    #[serde(default = "default_replay_queue_capacity")]
    pub replay_queue_capacity: usize,
    /// Largest blob body accepted by PutBlob
    #[serde(default = "default_max_blob_size")]
    pub max_blob_size: usize,
    /// Selectors returned per GetLevelSelectors level
    #[serde(default = "default_selector_page_size")]
    pub selector_page_size: usize,
    /// Machines without a heartbeat for this long are reported inactive
    #[serde(default = "default_machine_inactive_secs")]
    pub machine_inactive_secs: u64,
}

impl ServiceConfig {
    #[must_use]
    pub const fn heartbeat_staleness(&self) -> Duration {
        Duration::from_secs(self.heartbeat_staleness_secs)
    }

    #[must_use]
    pub const fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    #[must_use]
    pub const fn machine_inactive(&self) -> Duration {
        Duration::from_secs(self.machine_inactive_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            heartbeat_staleness_secs: default_heartbeat_staleness_secs(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            max_event_parallelism: default_max_event_parallelism(),
            replay_queue_capacity: default_replay_queue_capacity(),
            max_blob_size: default_max_blob_size(),
            selector_page_size: default_selector_page_size(),
            machine_inactive_secs: default_machine_inactive_secs(),
        }
    }
}

/// Event stream configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventStreamConfig {
    /// Directory holding the log segments (shared between replicas)
    #[serde(default = "default_events_dir")]
    pub dir: PathBuf,
    /// Segment size that triggers rotation on the next checkpoint
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: u64,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            dir: default_events_dir(),
            max_segment_size: default_max_segment_size(),
        }
    }
}

/// Checkpoint storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory holding checkpoints and the registry (shared between replicas)
    #[serde(default = "default_checkpoints_dir")]
    pub dir: PathBuf,
    /// Number of checkpoints kept after a successful creation
    #[serde(default = "default_retained")]
    pub retained: usize,
    /// Checkpoint file of the cluster management store
    #[serde(default = "default_cluster_state_path")]
    pub cluster_state_path: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoints_dir(),
            retained: default_retained(),
            cluster_state_path: default_cluster_state_path(),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Status endpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_status_listen")]
    pub listen: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            listen: default_status_listen(),
        }
    }
}

fn default_node_name() -> String {
    "cachemeta-node".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/cachemeta")
}

fn default_heartbeat_staleness_secs() -> u64 {
    60
}

fn default_checkpoint_interval_secs() -> u64 {
    300
}

fn default_max_event_parallelism() -> usize {
    8
}

fn default_replay_queue_capacity() -> usize {
    1000
}

fn default_max_blob_size() -> usize {
    1024 * 1024 // 1 MB
}

fn default_selector_page_size() -> usize {
    100
}

fn default_machine_inactive_secs() -> u64 {
    30 * 60
}

fn default_events_dir() -> PathBuf {
    PathBuf::from("/var/lib/cachemeta/events")
}

fn default_max_segment_size() -> u64 {
    64 * 1024 * 1024 // 64 MB
}

fn default_checkpoints_dir() -> PathBuf {
    PathBuf::from("/var/lib/cachemeta/checkpoints")
}

fn default_retained() -> usize {
    3
}

fn default_cluster_state_path() -> PathBuf {
    PathBuf::from("/var/lib/cachemeta/checkpoints/cluster_state.bin")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_status_listen() -> String {
    "0.0.0.0:9101".to_string()
}
