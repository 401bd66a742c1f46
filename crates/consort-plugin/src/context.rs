//! Process-wide host state.
//!
//! One [`HostContext`] is built at startup and handed (as `Arc`) to every
//! session. It owns the plugin registry, the prober, the command pipeline and
//! the "search in progress" flag, and is torn down explicitly by dropping it.

use crate::cache::CacheFile;
use crate::config::HostConfig;
use crate::factory::Factory;
use crate::probe::{block_on, ProbeResult, ProbeStatus, Prober};
use crate::registry::PluginRegistry;
use crate::search::{default_search_paths, search};
use consort_core::descriptor::PluginDescriptor;
use consort_core::error::{HostError, Result};
use consort_core::pipeline::{AsyncCommand, CommandPipeline, Liveness, SubmitError};
use consort_core::plugin::ModuleLoader;
use consort_core::AtomicFlag;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchFlags {
    /// Also walk the platform's standard plugin directories.
    pub use_default_paths: bool,
    /// Log every probe result at info level.
    pub verbose: bool,
    /// Write the cache file when the search finishes.
    pub save_cache: bool,
    /// Probe several modules at once.
    pub parallel: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub paths: Vec<PathBuf>,
    /// Paths (and everything below them) to leave alone.
    pub exclude: Vec<PathBuf>,
    pub flags: SearchFlags,
}

impl SearchRequest {
    pub fn new(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn flags(mut self, flags: SearchFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn exclude(mut self, path: impl Into<PathBuf>) -> Self {
        self.exclude.push(path.into());
        self
    }
}

/// What a search found.
#[derive(Debug, Default)]
pub struct SearchReport {
    /// Every plugin found, newly probed or already known.
    pub found: Vec<Arc<PluginDescriptor>>,
    pub failed: Vec<PathBuf>,
    pub crashed: Vec<PathBuf>,
    /// Denylisted paths that were not probed again.
    pub skipped: Vec<PathBuf>,
}

pub type SearchCallback = Box<dyn FnOnce(Result<SearchReport>) + Send>;
pub type ProbeCallback = Box<dyn FnOnce(ProbeResult) + Send>;

/// Resets the searching flag when a search ends, however it ends.
struct SearchGuard<'a>(&'a AtomicFlag);

impl Drop for SearchGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

pub struct HostContext {
    config: HostConfig,
    registry: PluginRegistry,
    prober: Arc<Prober>,
    pipeline: CommandPipeline,
    searching: AtomicFlag,
}

impl Liveness for HostContext {
    fn is_alive(&self) -> bool {
        true
    }
}

fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl HostContext {
    /// Build the context and read the cache file if there is one.
    pub fn new(config: HostConfig, loader: Arc<dyn ModuleLoader>) -> Result<Arc<Self>> {
        config.validate()?;
        let prober = Arc::new(Prober::from_config(loader, &config));
        let pipeline = CommandPipeline::new(config.pipeline_config());
        let context = Arc::new(Self {
            config,
            registry: PluginRegistry::new(),
            prober,
            pipeline,
            searching: AtomicFlag::new(false),
        });

        let cache = context.cache_path();
        if cache.is_file() {
            match CacheFile::load(&cache) {
                Ok(file) => context.registry.load_cache_file(file),
                Err(e) => tracing::warn!("Ignoring plugin cache {}: {}", cache.display(), e),
            }
        }
        tracing::info!(
            "Host context ready: {} modules known, probe mode {:?}",
            context.registry.num_factories(),
            context.prober.mode()
        );
        Ok(context)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &CommandPipeline {
        &self.pipeline
    }

    pub fn prober(&self) -> &Arc<Prober> {
        &self.prober
    }

    pub fn loader(&self) -> &Arc<dyn ModuleLoader> {
        self.prober.loader()
    }

    pub fn cache_path(&self) -> PathBuf {
        self.config.cache_path()
    }

    pub fn is_searching(&self) -> bool {
        self.searching.get()
    }

    /// Walk the requested directories and probe every module not yet known.
    ///
    /// Only one search runs at a time; a second concurrent call gets
    /// [`HostError::Busy`].
    pub fn search(
        &self,
        request: &SearchRequest,
        mut progress: Option<&mut dyn FnMut(&ProbeResult)>,
    ) -> Result<SearchReport> {
        if !self.searching.try_raise() {
            return Err(HostError::Busy("a plugin search is already running".into()));
        }
        let _searching = SearchGuard(&self.searching);
        let _probing = self.registry.begin_probe();

        let mut roots = request.paths.clone();
        if request.flags.use_default_paths {
            roots.extend(default_search_paths());
        }
        let exclude: Vec<PathBuf> = request.exclude.iter().map(|p| absolute(p)).collect();

        let mut report = SearchReport::default();
        let mut seen = HashSet::new();
        let mut to_probe = Vec::new();
        for root in &roots {
            tracing::debug!("Searching {}", root.display());
            for candidate in search(root) {
                let candidate = absolute(&candidate);
                if !seen.insert(candidate.clone()) {
                    continue;
                }
                if exclude.iter().any(|ex| candidate.starts_with(ex)) {
                    continue;
                }
                if let Some(factory) = self.registry.find_factory(&candidate) {
                    report.found.extend(factory.plugins().iter().cloned());
                } else if self.registry.is_exception(&candidate) {
                    if request.flags.verbose {
                        tracing::info!("Skipping {} (failed before)", candidate.display());
                    }
                    report.skipped.push(candidate);
                } else {
                    to_probe.push(candidate);
                }
            }
        }

        let verbose = request.flags.verbose;
        let mut on_result = |result: &ProbeResult| {
            log_result(result, verbose);
            if let Some(progress) = progress.as_mut() {
                progress(result);
            }
        };

        let results = if request.flags.parallel && to_probe.len() > 1 {
            block_on(self.prober.probe_parallel(to_probe, &mut on_result))?
        } else {
            to_probe
                .iter()
                .map(|path| {
                    let result = self.prober.probe_blocking(path);
                    on_result(&result);
                    result
                })
                .collect()
        };

        for result in results {
            match result.status {
                ProbeStatus::Success => report.found.extend(result.plugins.iter().cloned()),
                ProbeStatus::Fail => report.failed.push(result.path.clone()),
                ProbeStatus::Crash => report.crashed.push(result.path.clone()),
            }
            self.record(&result);
        }

        tracing::info!(
            "Plugin search done: {} found, {} failed, {} crashed, {} skipped",
            report.found.len(),
            report.failed.len(),
            report.crashed.len(),
            report.skipped.len()
        );

        if request.flags.save_cache {
            if let Err(e) = self.save_cache() {
                tracing::error!("Failed to write plugin cache: {}", e);
            }
        }
        Ok(report)
    }

    /// Run [`HostContext::search`] on the pipeline's worker and report through `done`.
    pub fn search_async(
        self: &Arc<Self>,
        request: SearchRequest,
        done: SearchCallback,
    ) -> std::result::Result<(), SubmitError> {
        let cmd = AsyncCommand::new("search", Arc::clone(self), (request, Some(done))).stage2(
            |ctx, (request, done)| {
                if let (Some(ctx), Some(done)) = (ctx, done.take()) {
                    done(ctx.search(request, None));
                }
                false
            },
        );
        self.pipeline.submit(cmd)
    }

    /// Probe a single module, answering from the registry when it is known.
    ///
    /// A path is loaded at most once until the cache is cleared; denylisted
    /// paths are not retried.
    pub fn probe_one(&self, path: &Path) -> ProbeResult {
        let path = absolute(path);
        if let Some(factory) = self.registry.find_factory(&path) {
            return ProbeResult::cached(&factory);
        }
        if self.registry.is_exception(&path) {
            return ProbeResult::failed(
                &path,
                HostError::Other(format!("{} failed to probe before", path.display())),
            );
        }
        let _probing = self.registry.begin_probe();
        let result = self.prober.probe_blocking(&path);
        log_result(&result, false);
        self.record(&result);
        result
    }

    pub fn probe_one_async(
        self: &Arc<Self>,
        path: PathBuf,
        done: ProbeCallback,
    ) -> std::result::Result<(), SubmitError> {
        let cmd = AsyncCommand::new("probe", Arc::clone(self), (path, Some(done))).stage2(
            |ctx, (path, done)| {
                if let (Some(ctx), Some(done)) = (ctx, done.take()) {
                    done(ctx.probe_one(path));
                }
                false
            },
        );
        self.pipeline.submit(cmd)
    }

    /// Enter a probe result into the registry or the denylist.
    fn record(&self, result: &ProbeResult) {
        if let Some(factory) = result.to_factory() {
            self.registry.register(Arc::new(factory));
        } else if result.should_denylist() {
            self.registry.add_exception(&result.path);
        }
    }

    /// Find the factory and descriptor for a plugin key or module path,
    /// probing the path on a cache miss.
    pub fn resolve(&self, key: &str) -> Result<(Arc<Factory>, Arc<PluginDescriptor>)> {
        let lookup = |desc: Arc<PluginDescriptor>| {
            self.registry
                .find_factory(&desc.path)
                .map(|factory| (factory, Arc::clone(&desc)))
                .ok_or_else(|| HostError::PluginNotFound(key.to_string()))
        };

        if let Some(desc) = self.registry.find_plugin(key) {
            return lookup(desc);
        }
        let path = absolute(Path::new(key));
        if let Some(desc) = self.registry.find_plugin(&path.to_string_lossy()) {
            return lookup(desc);
        }
        if !path.exists() {
            return Err(HostError::PluginNotFound(key.to_string()));
        }

        let mut result = self.probe_one(&path);
        if let Some(err) = result.error.take() {
            return Err(err);
        }
        match result.plugins.as_slice() {
            [single] => lookup(Arc::clone(single)),
            [] => Err(HostError::NoPlugins(path)),
            many => Err(HostError::PluginNotFound(format!(
                "{} contains {} plugins; open one by name",
                key,
                many.len()
            ))),
        }
    }

    /// Drop every known plugin and exception, optionally deleting the cache file.
    pub fn clear_cache(&self, remove_file: bool) -> Result<()> {
        if self.is_searching() {
            return Err(HostError::Busy(
                "cannot clear the plugin cache while a search is in progress".into(),
            ));
        }
        self.registry.clear()?;
        if remove_file {
            let path = self.cache_path();
            match fs::remove_file(&path) {
                Ok(()) => tracing::info!("Removed plugin cache {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn save_cache(&self) -> Result<()> {
        self.registry.to_cache_file().save(&self.cache_path())
    }
}

fn log_result(result: &ProbeResult, verbose: bool) {
    match (&result.status, &result.error) {
        (ProbeStatus::Success, _) => {
            let names: Vec<&str> = result.plugins.iter().map(|p| p.name.as_str()).collect();
            if verbose {
                tracing::info!("Probed {}: {}", result.path.display(), names.join(", "));
            } else {
                tracing::debug!("Probed {}: {}", result.path.display(), names.join(", "));
            }
        }
        (status, Some(err)) => {
            tracing::warn!("Probe of {} {}: {}", result.path.display(), status, err)
        }
        (status, None) => tracing::warn!("Probe of {} {}", result.path.display(), status),
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("registry", &self.registry)
            .field("prober", &self.prober)
            .field("searching", &self.is_searching())
            .finish()
    }
}
