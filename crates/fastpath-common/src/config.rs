//! Engine Configuration

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FastpathConfig {
    /// Element graph settings
    pub graph: GraphConfig,
    /// Polling loop settings
    pub driver: DriverConfig,
    /// Attached coprocessor devices
    pub devices: Vec<VDeviceConfig>,
}

impl FastpathConfig {
    /// Load from file
    pub fn load(path: &str) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to file
    pub fn save(&self, path: &str) -> ConfigResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> ConfigResult<()> {
        if self.graph.queue_capacity == 0 {
            return Err(ConfigError::Invalid("graph.queue_capacity must be > 0".into()));
        }
        if self.driver.scan_interval == 0 || self.driver.poll_interval == 0 {
            return Err(ConfigError::Invalid("driver intervals must be > 0".into()));
        }

        let mut seen = HashSet::new();
        for dev in &self.devices {
            dev.validate()?;
            if !seen.insert(dev.device_id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device id {}",
                    dev.device_id
                )));
            }
        }
        Ok(())
    }
}

/// Element graph configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Initial capacity of the work queue
    pub queue_capacity: usize,
    /// Maximum number of elements in one graph
    pub max_elements: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_elements: 256,
        }
    }
}

/// Per-thread polling loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Scan offloadable elements every N iterations
    pub scan_interval: u32,
    /// Poll devices for completions every N iterations
    pub poll_interval: u32,
    /// Sleep after an iteration that did no work (microseconds, 0 = spin)
    pub idle_backoff_us: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            scan_interval: 1,
            poll_interval: 1,
            idle_backoff_us: 0,
        }
    }
}

/// Coprocessor virtual device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VDeviceConfig {
    /// Device identifier
    pub device_id: u32,
    /// Master rendezvous address (port 0 = pick an ephemeral port)
    pub master_addr: String,
    /// Tasks allowed in flight at once
    pub pipeline_depth: u32,
    /// Worker threads per physical core
    pub ht_per_core: usize,
    /// Cores the worker pool runs on
    pub cores: Vec<usize>,
    /// Packet bound per worker per round
    pub max_packets_per_worker: u32,
    /// Preferred number of packets per offload task
    pub offload_batch_size: u32,
    /// Completion slots in the poll ring
    pub poll_ring_len: usize,
    /// Upper bound on a task-done wait (milliseconds)
    pub task_timeout_ms: u64,
    /// Pin worker and master threads to `cores`
    pub pin_threads: bool,
}

impl Default for VDeviceConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            master_addr: "127.0.0.1:0".into(),
            pipeline_depth: 4,
            ht_per_core: 1,
            cores: vec![0],
            max_packets_per_worker: 256,
            offload_batch_size: 64,
            poll_ring_len: 16,
            task_timeout_ms: 5_000,
            pin_threads: false,
        }
    }
}

impl VDeviceConfig {
    /// Total worker threads (`cores × ht_per_core`)
    pub fn num_worker_threads(&self) -> usize {
        self.cores.len() * self.ht_per_core
    }

    /// Task-done wait bound
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Check value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        let id = self.device_id;
        if self.pipeline_depth == 0 {
            return Err(ConfigError::Invalid(format!("device {id}: pipeline_depth must be > 0")));
        }
        if self.ht_per_core == 0 {
            return Err(ConfigError::Invalid(format!("device {id}: ht_per_core must be > 0")));
        }
        if self.cores.is_empty() {
            return Err(ConfigError::Invalid(format!("device {id}: no cores assigned")));
        }
        if self.max_packets_per_worker == 0 {
            return Err(ConfigError::Invalid(format!(
                "device {id}: max_packets_per_worker must be > 0"
            )));
        }
        if self.poll_ring_len < self.pipeline_depth as usize {
            return Err(ConfigError::Invalid(format!(
                "device {id}: poll ring ({}) shorter than pipeline depth ({})",
                self.poll_ring_len, self.pipeline_depth
            )));
        }
        if self.task_timeout_ms == 0 {
            return Err(ConfigError::Invalid(format!("device {id}: task_timeout_ms must be > 0")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let mut config = FastpathConfig::default();
        config.devices.push(VDeviceConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.devices[0].num_worker_threads(), 1);
    }

    #[test]
    fn test_rejects_short_poll_ring() {
        let dev = VDeviceConfig {
            pipeline_depth: 8,
            poll_ring_len: 4,
            ..Default::default()
        };
        assert!(matches!(dev.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_duplicate_devices() {
        let mut config = FastpathConfig::default();
        config.devices.push(VDeviceConfig::default());
        config.devices.push(VDeviceConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "devices": [ { "device_id": 3, "cores": [0, 1], "ht_per_core": 2 } ] }"#;
        let config: FastpathConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.graph.queue_capacity, 256);
        assert_eq!(config.devices[0].device_id, 3);
        assert_eq!(config.devices[0].num_worker_threads(), 4);
        assert_eq!(config.devices[0].pipeline_depth, 4);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("fastpath-config-{}.json", std::process::id()));
        let path = path.to_string_lossy().into_owned();

        let mut config = FastpathConfig::default();
        config.driver.scan_interval = 4;
        config.save(&path).unwrap();

        let loaded = FastpathConfig::load(&path).unwrap();
        assert_eq!(loaded.driver.scan_interval, 4);
        let _ = std::fs::remove_file(&path);
    }
}
