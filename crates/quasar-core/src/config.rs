//! Storage Configuration
//!
//! Settings recognised by the storage engine, deserialised from the
//! node's configuration file.
//!
//! ## Options
//!
//! - **ceph_conf**: path to the object-store client configuration
//! - **data_pool** / **hot_pool**: pool names for bulk data and the hot
//!   tier (superblock placement in clustered deployments)
//! - **read_cache_mib**: chunk cache budget in MiB; values below 40 are
//!   raised to 40 at initialisation (one chunk per read handle, plus
//!   headroom)
//! - **coalesce_max_points**: pending-record count that triggers a
//!   synchronous commit
//! - **coalesce_max_interval_ms**: maximum age of a pending batch before
//!   the timer commits it
//!
//! ## Usage
//!
//! ```ignore
//! use quasar_core::StorageConfig;
//!
//! // Development config: small cache, fast coalescing
//! let config = StorageConfig {
//!     data_pool: "quasar-dev".to_string(),
//!     read_cache_mib: 64,
//!     coalesce_max_interval_ms: 500,
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the object-store client config file.
    #[serde(default = "default_ceph_conf")]
    pub ceph_conf: String,

    /// Pool holding data objects, superblocks and stream metadata.
    #[serde(default = "default_pool")]
    pub data_pool: String,

    /// Pool for the hot tier. Reserved for deployments that place
    /// superblocks on faster media; the single-pool layout ignores it.
    #[serde(default = "default_pool")]
    pub hot_pool: String,

    /// Chunk read cache budget in MiB (floor 40, applied at init).
    #[serde(default = "default_read_cache_mib")]
    pub read_cache_mib: u64,

    /// Commit a pending batch once it holds this many records.
    #[serde(default = "default_coalesce_max_points")]
    pub coalesce_max_points: usize,

    /// Commit a pending batch after this many milliseconds.
    #[serde(default = "default_coalesce_max_interval_ms")]
    pub coalesce_max_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ceph_conf: default_ceph_conf(),
            data_pool: default_pool(),
            hot_pool: default_pool(),
            read_cache_mib: default_read_cache_mib(),
            coalesce_max_points: default_coalesce_max_points(),
            coalesce_max_interval_ms: default_coalesce_max_interval_ms(),
        }
    }
}

fn default_ceph_conf() -> String {
    "/etc/ceph/ceph.conf".to_string()
}

fn default_pool() -> String {
    "quasar".to_string()
}

fn default_read_cache_mib() -> u64 {
    256
}

fn default_coalesce_max_points() -> usize {
    16384
}

fn default_coalesce_max_interval_ms() -> u64 {
    5000
}

/// Read-only view of cluster membership.
///
/// The storage layer never moves streams between nodes; it only refuses
/// work for streams this node does not own. The predicate must be cheap
/// and non-blocking - it sits on the ingest hot path.
pub trait ClusterState: Send + Sync {
    fn we_hold_write_lock_for(&self, uuid: &Uuid) -> bool;
}

/// Single-node deployment: every stream belongs to this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoloCluster;

impl ClusterState for SoloCluster {
    fn we_hold_write_lock_for(&self, _uuid: &Uuid) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = StorageConfig::default();
        assert_eq!(cfg.data_pool, "quasar");
        assert_eq!(cfg.hot_pool, "quasar");
        assert_eq!(cfg.read_cache_mib, 256);
        assert_eq!(cfg.coalesce_max_points, 16384);
        assert_eq!(cfg.coalesce_max_interval_ms, 5000);
    }

    #[test]
    fn test_partial_deserialisation_fills_defaults() {
        let cfg: StorageConfig =
            serde_json::from_str(r#"{"data_pool": "ssd", "coalesce_max_points": 100}"#)
                .expect("deserialize");
        assert_eq!(cfg.data_pool, "ssd");
        assert_eq!(cfg.coalesce_max_points, 100);
        assert_eq!(cfg.coalesce_max_interval_ms, 5000);
    }

    #[test]
    fn test_serde_roundtrip() {
        let cfg = StorageConfig {
            read_cache_mib: 40,
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: StorageConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.read_cache_mib, 40);
    }

    #[test]
    fn test_solo_cluster_owns_everything() {
        let c = SoloCluster;
        assert!(c.we_hold_write_lock_for(&Uuid::new_v4()));
    }
}
