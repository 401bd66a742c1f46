//! Process-wide host configuration.

use consort_core::error::{HostError, Result};
use consort_core::pipeline::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const CACHE_FILE_NAME: &str = "plugin_cache.ini";
pub const PROBE_SERVER_NAME: &str = "probe-server";

/// How candidate modules are loaded while probing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeMode {
    /// Load in this process. Fast, but a crashing module takes the host down.
    InProcess,
    /// Load in a short-lived child process running `executable`.
    Subprocess { executable: PathBuf },
}

impl ProbeMode {
    /// Subprocess probing when a `probe-server` sits next to the running
    /// executable, in-process otherwise.
    pub fn detect() -> Self {
        match default_probe_executable() {
            Some(executable) if executable.is_file() => ProbeMode::Subprocess { executable },
            _ => ProbeMode::InProcess,
        }
    }
}

/// `probe-server` in the directory of the current executable.
pub fn default_probe_executable() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    Some(dir.join(format!("{}{}", PROBE_SERVER_NAME, std::env::consts::EXE_SUFFIX)))
}

/// Per-user settings directory (`<data-local>/consort`).
pub fn default_settings_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("consort")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory holding the cache file.
    pub settings_dir: PathBuf,
    pub cache_file_name: String,
    pub probe_mode: ProbeMode,
    /// Upper bound for one probe child.
    pub probe_timeout: Duration,
    /// Probes in flight at once during a parallel search.
    pub parallel_probes: usize,
    /// Verify the binary's CPU architecture before loading it.
    pub check_architecture: bool,
    /// Pipeline worker threads. 0 means the host pumps `run_nrt` itself.
    pub worker_threads: usize,
    pub command_queue_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            settings_dir: default_settings_dir(),
            cache_file_name: CACHE_FILE_NAME.to_string(),
            probe_mode: ProbeMode::detect(),
            probe_timeout: Duration::from_secs(30),
            parallel_probes: 8,
            check_architecture: true,
            worker_threads: 1,
            command_queue_capacity: 256,
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cache_file_name.is_empty() {
            return Err(HostError::InvalidConfig("cache_file_name is empty".into()));
        }
        if self.parallel_probes == 0 || self.parallel_probes > 64 {
            return Err(HostError::InvalidConfig(format!(
                "parallel_probes {} out of range (1-64)",
                self.parallel_probes
            )));
        }
        if self.probe_timeout.is_zero() {
            return Err(HostError::InvalidConfig("probe_timeout must be non-zero".into()));
        }
        if self.command_queue_capacity == 0 {
            return Err(HostError::InvalidConfig(
                "command_queue_capacity must be non-zero".into(),
            ));
        }
        if let ProbeMode::Subprocess { executable } = &self.probe_mode {
            if executable.as_os_str().is_empty() {
                return Err(HostError::InvalidConfig("probe executable path is empty".into()));
            }
        }
        Ok(())
    }

    pub fn cache_path(&self) -> PathBuf {
        self.settings_dir.join(&self.cache_file_name)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            worker_threads: self.worker_threads,
            queue_capacity: self.command_queue_capacity,
        }
    }
}
