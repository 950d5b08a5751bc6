//! Configuration for the heatline pipeline.
//!
//! Every struct has documented defaults and deserializes with
//! `#[serde(default)]`, so a JSON file only needs the fields it overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HeatlineError, Result};

/// Which coordinate correction to apply to all incoming geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// WGS-84 → GCJ-02 polynomial correction
    #[default]
    Gcj02,
    /// No correction (venues outside the distorted region, tests)
    Identity,
}

/// Configuration for the segment heat aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Grid cell edge length in meters.
    /// Default: 10.0 meters
    pub grid_cell_meters: f64,

    /// Also assign segments to their nearest path edge.
    /// Default: true
    pub snap_to_network: bool,

    /// Maximum point-to-edge distance for a snap to count.
    /// Default: 15.0 meters
    pub max_snap_distance_m: f64,

    /// Count at which a segment reaches full heat. `None` normalizes against
    /// the busiest segment of the venue instead.
    /// Default: Some(20)
    pub count_ceiling: Option<u64>,

    /// Samples with a worse accuracy radius are dropped.
    /// Default: 30.0 meters
    pub max_accuracy_m: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            grid_cell_meters: 10.0,
            snap_to_network: true,
            max_snap_distance_m: 15.0,
            count_ceiling: Some(20),
            max_accuracy_m: 30.0,
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.grid_cell_meters.is_finite() && self.grid_cell_meters > 0.0) {
            return Err(HeatlineError::config("grid_cell_meters must be positive"));
        }
        if !(self.max_snap_distance_m.is_finite() && self.max_snap_distance_m >= 0.0) {
            return Err(HeatlineError::config(
                "max_snap_distance_m must be non-negative",
            ));
        }
        if self.count_ceiling == Some(0) {
            return Err(HeatlineError::config("count_ceiling must be at least 1"));
        }
        if !(self.max_accuracy_m.is_finite() && self.max_accuracy_m > 0.0) {
            return Err(HeatlineError::config("max_accuracy_m must be positive"));
        }
        Ok(())
    }
}

/// Neighbor search strategy for DBSCAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborIndex {
    /// O(n²) scan, fine for venue batches
    #[default]
    Linear,
    /// R-tree backed radius queries for larger batches
    RTree,
}

/// Configuration for DBSCAN clustering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Neighborhood radius in coordinate degrees.
    /// Default: 0.0001 (~11 meters)
    pub eps_degrees: f64,

    /// Minimum neighborhood size (including the point itself) for a core point.
    /// Default: 3
    pub min_points: usize,

    /// Neighbor search strategy.
    /// Default: Linear
    pub index: NeighborIndex,

    /// Largest batch accepted by [`TrajectoryClusterer`](crate::TrajectoryClusterer).
    /// Default: Some(5000)
    pub max_batch_points: Option<usize>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            eps_degrees: 0.0001,
            min_points: 3,
            index: NeighborIndex::Linear,
            max_batch_points: Some(5000),
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.eps_degrees.is_finite() && self.eps_degrees > 0.0) {
            return Err(HeatlineError::config("eps_degrees must be positive"));
        }
        if self.min_points == 0 {
            return Err(HeatlineError::config("min_points must be at least 1"));
        }
        Ok(())
    }
}

/// Padding of the mask's outer ring around the venue bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskPadding {
    /// Fraction of the box width/height added on each side
    Ratio(f64),
    /// Fixed margin in degrees on each side
    Absolute(f64),
}

/// Configuration for the mask polygon builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    /// Default: Ratio(0.5)
    pub padding: MaskPadding,

    /// Number of venue masks kept cached.
    /// Default: 32
    pub cache_capacity: usize,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            padding: MaskPadding::Ratio(0.5),
            cache_capacity: 32,
        }
    }
}

impl MaskConfig {
    pub fn validate(&self) -> Result<()> {
        let value = match self.padding {
            MaskPadding::Ratio(r) => r,
            MaskPadding::Absolute(d) => d,
        };
        if !(value.is_finite() && value > 0.0) {
            return Err(HeatlineError::config("mask padding must be positive"));
        }
        if self.cache_capacity == 0 {
            return Err(HeatlineError::config("cache_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Retry policy for the write-behind flusher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// First retry delay after a failed write.
    /// Default: 250 ms
    pub retry_base_ms: u64,

    /// Upper bound for the exponential backoff.
    /// Default: 30000 ms
    pub retry_max_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: 250,
            retry_max_ms: 30_000,
        }
    }
}

impl PersistenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry_base_ms == 0 || self.retry_max_ms < self.retry_base_ms {
            return Err(HeatlineError::config(
                "retry_base_ms must be positive and not exceed retry_max_ms",
            ));
        }
        Ok(())
    }
}

/// Configuration for uploading completed sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the backend; sessions are POSTed to `{endpoint}/sessions`.
    /// Default: None (sync disabled)
    pub endpoint: Option<String>,

    /// API key sent as HTTP basic auth.
    pub api_key: Option<String>,

    /// Attempts after which a queued session is no longer retried.
    /// Default: 8
    pub max_attempts: u32,

    /// First retry delay; doubles per failed attempt.
    /// Default: 30 seconds
    pub retry_base_secs: u64,

    /// Parallel uploads per pass.
    /// Default: 4
    pub concurrency: usize,

    /// Request timeout.
    /// Default: 30 seconds
    pub timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            max_attempts: 8,
            retry_base_secs: 30,
            concurrency: 4,
            timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    /// Delay before the next attempt once `attempts` uploads have failed.
    pub fn backoff_secs(&self, attempts: u32) -> u64 {
        self.retry_base_secs
            .saturating_mul(1u64 << attempts.saturating_sub(1).min(10))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatlineConfig {
    pub transform: TransformKind,
    pub aggregator: AggregatorConfig,
    pub cluster: ClusterConfig,
    pub mask: MaskConfig,
    pub persistence: PersistenceConfig,
    pub sync: SyncConfig,
}

impl HeatlineConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: HeatlineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            HeatlineError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.aggregator.validate()?;
        self.cluster.validate()?;
        self.mask.validate()?;
        self.persistence.validate()?;
        Ok(())
    }
}
