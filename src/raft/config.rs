use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::timer::TimeoutRange;
use super::RaftError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub election_timeout_min: u64, // in milliseconds
    pub election_timeout_max: u64, // in milliseconds
    pub heartbeat_interval: u64,   // in milliseconds
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
        }
    }
}

impl RaftConfig {
    pub fn new(election_timeout_min: u64, election_timeout_max: u64, heartbeat_interval: u64) -> Self {
        Self {
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
        }
    }

    pub fn election_timeout(&self) -> TimeoutRange {
        TimeoutRange::new(
            Duration::from_millis(self.election_timeout_min),
            Duration::from_millis(self.election_timeout_max),
        )
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    /// Checks the timing invariants the election relies on.
    ///
    /// The heartbeat interval must be strictly shorter than the smallest
    /// election timeout, otherwise followers of a healthy leader would still
    /// start elections.
    pub fn validate(&self) -> Result<(), RaftError> {
        if self.election_timeout_min == 0 {
            return Err(RaftError::InvalidConfig(
                "election_timeout_min must be positive".to_string(),
            ));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election_timeout_min ({}) exceeds election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 {
            return Err(RaftError::InvalidConfig(
                "heartbeat_interval must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat_interval ({}) must be shorter than election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.heartbeat_interval * 2 > self.election_timeout_min {
            log::warn!(
                "heartbeat_interval {}ms is more than half of election_timeout_min {}ms; \
                 followers may time out under message delay",
                self.heartbeat_interval,
                self.election_timeout_min
            );
        }
        Ok(())
    }
}
