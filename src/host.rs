//! ConsortHost: the process-wide context plus the defaults sessions are built from.

use crate::builder::ConsortHostBuilder;
use crate::{Error, Result};
use consort_core::{HostError, PluginDescriptor, RtToken, WindowSystem};
use consort_plugin::{
    HostContext, PluginRegistry, ProbeResult, SearchCallback, SearchReport, SearchRequest,
};
use consort_session::{PluginSession, ReplySink, SessionBuilder, SessionConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Entry point of a plugin host.
///
/// One per process. It owns the [`HostContext`] (registry, cache, prober and
/// command pipeline) that every session shares.
///
/// The audio thread calls [`ConsortHost::process_commands`] once per block,
/// before rendering its sessions, so async commands can complete.
///
/// # Example
///
/// ```ignore
/// use consort::prelude::*;
///
/// let host = ConsortHost::builder().sample_rate(48000.0).build()?;
/// host.search(&SearchRequest::new(["/opt/plugins"]))?;
///
/// let (tx, replies) = crossbeam::channel::bounded(256);
/// let mut session = host.create_session(Arc::new(tx))?;
/// session.open("Reverb", false);
///
/// // audio callback
/// let rt = RtToken::audio_thread();
/// host.process_commands(&rt);
/// session.process(&mut buffers, &BlockAutomation::none());
/// ```
pub struct ConsortHost {
    context: Arc<HostContext>,
    session_config: SessionConfig,
    windows: Option<Arc<dyn WindowSystem>>,
}

impl ConsortHost {
    pub fn builder() -> ConsortHostBuilder {
        ConsortHostBuilder::default()
    }

    pub(crate) fn new(
        context: Arc<HostContext>,
        session_config: SessionConfig,
        windows: Option<Arc<dyn WindowSystem>>,
    ) -> Self {
        Self {
            context,
            session_config,
            windows,
        }
    }

    pub fn context(&self) -> &Arc<HostContext> {
        &self.context
    }

    pub fn registry(&self) -> &PluginRegistry {
        self.context.registry()
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.session_config
    }

    pub fn cache_path(&self) -> PathBuf {
        self.context.cache_path()
    }

    /// Every plugin the registry knows, in key order.
    pub fn plugins(&self) -> Vec<Arc<PluginDescriptor>> {
        self.context.registry().plugins()
    }

    /// Look a plugin up by key or module path without probing.
    pub fn find_plugin(&self, key: &str) -> Option<Arc<PluginDescriptor>> {
        self.context.registry().find_plugin(key)
    }

    /// Search on the calling thread. Blocks until every candidate is probed.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchReport> {
        Ok(self.context.search(request, None)?)
    }

    /// Search on a pipeline worker; `done` receives the report there.
    pub fn search_async(&self, request: SearchRequest, done: SearchCallback) -> Result<()> {
        self.context.search_async(request, done).map_err(|e| {
            Error::Host(HostError::Busy(format!("search was not queued: {:?}", e)))
        })
    }

    /// Probe one module, answering from the registry when it is already known.
    pub fn probe(&self, path: impl AsRef<Path>) -> ProbeResult {
        self.context.probe_one(path.as_ref())
    }

    pub fn save_cache(&self) -> Result<()> {
        Ok(self.context.save_cache()?)
    }

    pub fn clear_cache(&self, remove_file: bool) -> Result<()> {
        Ok(self.context.clear_cache(remove_file)?)
    }

    /// A session builder preset with the host's audio settings and window system.
    pub fn session(&self) -> SessionBuilder {
        let builder = PluginSession::builder(Arc::clone(&self.context))
            .config(self.session_config.clone());
        match &self.windows {
            Some(windows) => builder.window_system(Arc::clone(windows)),
            None => builder,
        }
    }

    pub fn create_session(&self, replies: Arc<dyn ReplySink>) -> Result<PluginSession> {
        Ok(self.session().replies(replies).build()?)
    }

    /// Complete async commands on the audio thread. Call once per block.
    pub fn process_commands(&self, rt: &RtToken) -> usize {
        self.context.pipeline().run_rt(rt)
    }

    /// Run queued worker stages on the calling thread, for hosts built
    /// with zero worker threads.
    pub fn run_workers(&self) -> usize {
        self.context.pipeline().run_nrt()
    }

    /// Commands submitted and not yet released, across every session.
    pub fn commands_in_flight(&self) -> usize {
        self.context.pipeline().in_flight()
    }

    /// Drive the pipeline until every command is released, for offline use
    /// where the caller is also the audio thread.
    pub fn wait_idle(&self, rt: &RtToken, timeout: Duration) -> bool {
        self.context.pipeline().wait_idle(rt, timeout)
    }
}

impl std::fmt::Debug for ConsortHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsortHost")
            .field("context", &self.context)
            .field("session_config", &self.session_config)
            .field("editors", &self.windows.is_some())
            .finish()
    }
}
