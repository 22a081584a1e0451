//! Configuration for the device simulator.

use std::path::Path;

use hbmsim_core::Residency;
use serde::{Deserialize, Serialize};

/// Errors loading a [`SimConfig`] from disk.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Simulator knobs.
///
/// Budgets are byte capacities per tier. `None` means unbounded, which is
/// the default for both tiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Maximum bytes resident in SRAM at once.
    pub sram_budget_bytes: Option<usize>,

    /// Maximum bytes resident in HBM at once.
    pub hbm_budget_bytes: Option<usize>,

    /// Log every operation's output values at debug level, as if each
    /// `run` were called with its debug flag set.
    pub trace_values: bool,
}

impl SimConfig {
    /// No budgets, no value tracing.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Cap SRAM at `bytes`.
    pub fn with_sram_budget(mut self, bytes: usize) -> Self {
        self.sram_budget_bytes = Some(bytes);
        self
    }

    /// Cap HBM at `bytes`.
    pub fn with_hbm_budget(mut self, bytes: usize) -> Self {
        self.hbm_budget_bytes = Some(bytes);
        self
    }

    /// Budget for `tier`, if any.
    pub fn budget(&self, tier: Residency) -> Option<usize> {
        match tier {
            Residency::Hbm => self.hbm_budget_bytes,
            Residency::Sram => self.sram_budget_bytes,
        }
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parse a config from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}
