//! Per-session audio configuration.

use consort_core::{ChannelLayout, HostError, Precision, Result};
use serde::{Deserialize, Serialize};

const MIN_SAMPLE_RATE: f64 = 8_000.0;
const MAX_SAMPLE_RATE: f64 = 384_000.0;

/// How the host renders the unit a session is bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub sample_rate: f64,
    /// Largest block the host will ever render.
    pub block_size: usize,
    pub precision: Precision,
    pub inputs: usize,
    pub outputs: usize,
    pub aux_inputs: usize,
    pub aux_outputs: usize,
    /// Capacity of the FIFO carrying module notifications to the audio thread.
    pub notification_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100.0,
            block_size: 64,
            precision: Precision::Single,
            inputs: 2,
            outputs: 2,
            aux_inputs: 0,
            aux_outputs: 0,
            notification_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(HostError::InvalidConfig(format!(
                "sample rate {} Hz out of range ({}-{} Hz)",
                self.sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            )));
        }
        if self.block_size == 0 {
            return Err(HostError::InvalidConfig("block_size must be non-zero".into()));
        }
        if self.notification_capacity == 0 {
            return Err(HostError::InvalidConfig(
                "notification_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Channel layout to configure a module with: the host's counts, capped
    /// by what the module declares.
    pub fn layout_for(&self, module: &ChannelLayout) -> ChannelLayout {
        ChannelLayout {
            inputs: self.inputs.min(module.inputs),
            outputs: self.outputs.min(module.outputs),
            aux_inputs: self.aux_inputs.min(module.aux_inputs),
            aux_outputs: self.aux_outputs.min(module.aux_outputs),
        }
    }
}
