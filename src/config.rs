use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::NetworkConditions;
use crate::raft::{RaftConfig, RaftError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub cluster_size: usize,
    pub raft: RaftConfig,
    pub run_duration_ms: u64,
    /// Fixes every random draw (timeouts, message loss) when set.
    pub seed: Option<u64>,
    pub network: NetworkConfig,
    pub metrics_path: Option<PathBuf>,
    pub event_log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub drop_rate: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            min_latency_ms: 0,
            max_latency_ms: 0,
        }
    }
}

impl NetworkConfig {
    pub fn conditions(&self) -> NetworkConditions {
        NetworkConditions::lossy(self.drop_rate).with_latency(
            Duration::from_millis(self.min_latency_ms),
            Duration::from_millis(self.max_latency_ms),
        )
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            cluster_size: 9,
            raft: RaftConfig::default(),
            run_duration_ms: 12_000,
            seed: None,
            network: NetworkConfig::default(),
            metrics_path: None,
            event_log_path: None,
        }
    }
}

impl SimulationConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RaftError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, RaftError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_millis(self.run_duration_ms)
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.cluster_size == 0 {
            return Err(RaftError::InvalidConfig(
                "cluster_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.network.drop_rate) {
            return Err(RaftError::InvalidConfig(format!(
                "drop_rate {} is outside [0, 1]",
                self.network.drop_rate
            )));
        }
        if self.network.min_latency_ms > self.network.max_latency_ms {
            return Err(RaftError::InvalidConfig(format!(
                "min_latency_ms ({}) exceeds max_latency_ms ({})",
                self.network.min_latency_ms, self.network.max_latency_ms
            )));
        }
        self.raft.validate()
    }
}
