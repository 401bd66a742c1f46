//! Builder for configuring and constructing a `ConsortHost`.

use crate::{ConsortHost, Result};
use consort_core::{ModuleLoader, Precision, WindowSystem};
use consort_plugin::{DylibLoader, HostConfig, HostContext, ProbeMode};
use consort_session::SessionConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Process-wide settings (cache location, probing, worker threads) and the
/// audio settings new sessions are created with.
///
/// Without an explicit loader, modules are opened through a [`DylibLoader`]
/// with no ABI adapters, which can validate and probe entry points but not
/// instantiate plugins.
///
/// # Example
///
/// ```ignore
/// use consort::prelude::*;
///
/// let host = ConsortHost::builder()
///     .loader(Arc::new(DylibLoader::new().with_adapter(vst2_adapter)))
///     .sample_rate(48000.0)
///     .block_size(256)
///     .build()?;
///
/// let report = host.search(&SearchRequest::new(["/opt/plugins"]))?;
/// let mut session = host.session().replies(Arc::new(tx)).build()?;
/// ```
pub struct ConsortHostBuilder {
    config: HostConfig,
    session: SessionConfig,
    loader: Option<Arc<dyn ModuleLoader>>,
    windows: Option<Arc<dyn WindowSystem>>,
}

impl Default for ConsortHostBuilder {
    fn default() -> Self {
        Self {
            config: HostConfig::default(),
            session: SessionConfig::default(),
            loader: None,
            windows: None,
        }
    }
}

impl ConsortHostBuilder {
    /// Replace every process-wide setting at once.
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// Default: the per-user data directory.
    pub fn settings_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.settings_dir = dir.into();
        self
    }

    /// Default: subprocess if a `probe-server` sits next to the executable.
    pub fn probe_mode(mut self, mode: ProbeMode) -> Self {
        self.config.probe_mode = mode;
        self
    }

    /// Default: 30 s
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    /// Default: 8
    pub fn parallel_probes(mut self, width: usize) -> Self {
        self.config.parallel_probes = width;
        self
    }

    /// Default: true
    pub fn check_architecture(mut self, check: bool) -> Self {
        self.config.check_architecture = check;
        self
    }

    /// 0 means the host drives the worker side itself through
    /// [`ConsortHost::run_workers`].
    ///
    /// Default: 1
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.config.worker_threads = count;
        self
    }

    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Needed for plugin editors.
    pub fn window_system(mut self, windows: Arc<dyn WindowSystem>) -> Self {
        self.windows = Some(windows);
        self
    }

    /// Audio settings for every session, replacing the individual setters below.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session = config;
        self
    }

    /// Default: 44100.0
    pub fn sample_rate(mut self, sample_rate: f64) -> Self {
        self.session.sample_rate = sample_rate;
        self
    }

    /// Default: 64
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.session.block_size = block_size;
        self
    }

    /// Default: single
    pub fn precision(mut self, precision: Precision) -> Self {
        self.session.precision = precision;
        self
    }

    /// Default: 2 in, 2 out
    pub fn channels(mut self, inputs: usize, outputs: usize) -> Self {
        self.session.inputs = inputs;
        self.session.outputs = outputs;
        self
    }

    /// Default: none
    pub fn aux_channels(mut self, inputs: usize, outputs: usize) -> Self {
        self.session.aux_inputs = inputs;
        self.session.aux_outputs = outputs;
        self
    }

    pub fn build(self) -> Result<ConsortHost> {
        self.session.validate()?;
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(DylibLoader::new()));
        let context = HostContext::new(self.config, loader)?;
        Ok(ConsortHost::new(context, self.session, self.windows))
    }
}
