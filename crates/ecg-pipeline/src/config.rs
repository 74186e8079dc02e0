//! Pipeline configuration

use crate::fabric::FabricTiming;
use crate::frame::FrameReaderConfig;
use ecg_core::{config_error, EcgError, EcgResult, MARKER, SAMPLES_PER_PACKET};
use ecg_processing::{CascadeConfig, WindowingConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::time::Duration;

/// Tunables of the whole acquisition pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of each bounded data queue
    pub queue_capacity: usize,
    /// Upper bound on any blocking receive, and the shutdown latency
    pub poll_interval_ms: u64,
    /// Bytes scanned per resynchronization attempt
    pub resync_budget: usize,
    /// Time allowed for the rest of a frame once its first byte arrived
    pub frame_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    /// How long to wait for the device's READY line at startup
    pub boot_wait_ms: u64,
    /// How long a session may wait for in-flight windows after it ended
    pub drain_grace_ms: u64,
    pub backpressure_warn_after: u32,
    pub join_timeout_ms: u64,
    pub windowing: WindowingConfig,
    pub cascade: CascadeConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            poll_interval_ms: 100,
            resync_budget: 1000,
            frame_timeout_ms: 1000,
            ack_timeout_ms: 100,
            boot_wait_ms: 250,
            drain_grace_ms: 2000,
            backpressure_warn_after: 10,
            join_timeout_ms: 5000,
            windowing: WindowingConfig::default(),
            cascade: CascadeConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> EcgResult<()> {
        if self.queue_capacity == 0 {
            return Err(config_error!("queue capacity must be positive"));
        }
        if self.poll_interval_ms == 0 || self.frame_timeout_ms == 0 {
            return Err(config_error!("poll interval and frame timeout must be positive"));
        }
        if self.resync_budget < MARKER.len() {
            return Err(config_error!(
                "resync budget {} is shorter than the marker",
                self.resync_budget
            ));
        }
        if self.windowing.samples_per_packet != SAMPLES_PER_PACKET {
            return Err(config_error!(
                "packets carry {} samples on the wire, not {}",
                SAMPLES_PER_PACKET,
                self.windowing.samples_per_packet
            ));
        }
        self.windowing.validate()?;
        self.cascade.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn boot_wait(&self) -> Duration {
        Duration::from_millis(self.boot_wait_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn reader(&self) -> FrameReaderConfig {
        FrameReaderConfig {
            resync_budget: self.resync_budget,
            poll_interval: self.poll_interval(),
            frame_timeout: Duration::from_millis(self.frame_timeout_ms),
        }
    }

    pub fn timing(&self) -> FabricTiming {
        FabricTiming {
            poll_interval: self.poll_interval(),
            backpressure_warn_after: self.backpressure_warn_after,
        }
    }

    pub fn to_json(&self) -> EcgResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| EcgError::Serialization {
            reason: e.to_string(),
        })
    }

    pub fn from_json(json: &str) -> EcgResult<Self> {
        serde_json::from_str(json).map_err(|e| EcgError::Serialization {
            reason: e.to_string(),
        })
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> EcgResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| config_error!("cannot read {}: {}", path.display(), e))?;
        let config = Self::from_json(&json)?;
        config.validate()?;
        Ok(config)
    }
}
