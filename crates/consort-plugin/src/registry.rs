//! Process-wide plugin registry.
//!
//! Maps module paths to [`Factory`]s and lookup keys to descriptors, and
//! keeps the denylist of paths known to fail. Every operation takes the same
//! lock; registry traffic is rare compared to audio-rate work.
//!
//! A plugin is registered under its name (suffixed with `.vst3` for VST3)
//! and, when its module contains exactly one plugin, also under its path.

use crate::cache::CacheFile;
use crate::factory::Factory;
use consort_core::descriptor::PluginDescriptor;
use consort_core::error::{HostError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Default)]
struct RegistryInner {
    factories: HashMap<PathBuf, Arc<Factory>>,
    plugins: HashMap<String, Arc<PluginDescriptor>>,
    exceptions: BTreeSet<PathBuf>,
    active_probes: usize,
}

#[derive(Default)]
pub struct PluginRegistry {
    inner: Mutex<RegistryInner>,
}

/// Marks a probe or search in progress; [`PluginRegistry::clear`] refuses
/// while any guard is alive.
pub struct ProbeGuard<'a> {
    registry: &'a PluginRegistry,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.registry.inner.lock();
        inner.active_probes = inner.active_probes.saturating_sub(1);
    }
}

/// Fill in the lookup keys of freshly probed descriptors from one module.
pub fn assign_keys(plugins: &mut [PluginDescriptor]) {
    let single = plugins.len() == 1;
    for desc in plugins.iter_mut() {
        desc.keys = vec![desc.key()];
        if single {
            desc.keys.push(desc.path.to_string_lossy().into_owned());
        }
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_factory(&self, path: impl Into<PathBuf>, factory: Arc<Factory>) {
        self.inner.lock().factories.insert(path.into(), factory);
    }

    pub fn find_factory(&self, path: &Path) -> Option<Arc<Factory>> {
        self.inner.lock().factories.get(path).cloned()
    }

    pub fn add_plugin(&self, key: impl Into<String>, descriptor: Arc<PluginDescriptor>) {
        let key = key.into();
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.plugins.get(&key) {
            if previous.path != descriptor.path {
                tracing::warn!(
                    "Plugin key '{}' now points to {} (was {})",
                    key,
                    descriptor.path.display(),
                    previous.path.display()
                );
            }
        }
        inner.plugins.insert(key, descriptor);
    }

    pub fn find_plugin(&self, key: &str) -> Option<Arc<PluginDescriptor>> {
        self.inner.lock().plugins.get(key).cloned()
    }

    pub fn add_exception(&self, path: impl Into<PathBuf>) {
        self.inner.lock().exceptions.insert(path.into());
    }

    pub fn is_exception(&self, path: &Path) -> bool {
        self.inner.lock().exceptions.contains(path)
    }

    pub fn remove_exception(&self, path: &Path) -> bool {
        self.inner.lock().exceptions.remove(path)
    }

    pub fn exceptions(&self) -> Vec<PathBuf> {
        self.inner.lock().exceptions.iter().cloned().collect()
    }

    /// Add a factory and every key of every plugin it holds.
    pub fn register(&self, factory: Arc<Factory>) {
        let mut inner = self.inner.lock();
        for desc in factory.plugins() {
            if desc.keys.is_empty() {
                inner.plugins.insert(desc.key(), Arc::clone(desc));
            }
            for key in &desc.keys {
                inner.plugins.insert(key.clone(), Arc::clone(desc));
            }
        }
        inner.exceptions.remove(factory.path());
        inner
            .factories
            .insert(factory.path().to_path_buf(), factory);
    }

    /// Every distinct descriptor, ordered by key.
    pub fn plugins(&self) -> Vec<Arc<PluginDescriptor>> {
        let inner = self.inner.lock();
        let mut unique: BTreeMap<String, Arc<PluginDescriptor>> = BTreeMap::new();
        for factory in inner.factories.values() {
            for desc in factory.plugins() {
                unique.insert(desc.key(), Arc::clone(desc));
            }
        }
        unique.into_values().collect()
    }

    pub fn num_factories(&self) -> usize {
        self.inner.lock().factories.len()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.factories.is_empty() && inner.exceptions.is_empty()
    }

    pub fn begin_probe(&self) -> ProbeGuard<'_> {
        self.inner.lock().active_probes += 1;
        ProbeGuard { registry: self }
    }

    pub fn is_probing(&self) -> bool {
        self.inner.lock().active_probes > 0
    }

    /// Drop every factory, descriptor and exception.
    ///
    /// Refused with [`HostError::Busy`] while a probe or search is running.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.active_probes > 0 {
            return Err(HostError::Busy(
                "cannot clear the plugin cache while a search is in progress".into(),
            ));
        }
        let factories = inner.factories.len();
        inner.factories.clear();
        inner.plugins.clear();
        inner.exceptions.clear();
        tracing::debug!("Cleared plugin registry ({} modules)", factories);
        Ok(())
    }

    /// Snapshot for persistence, ordered by path so the file is stable.
    pub fn to_cache_file(&self) -> CacheFile {
        let inner = self.inner.lock();
        let mut factories: Vec<&Arc<Factory>> = inner.factories.values().collect();
        factories.sort_by(|a, b| a.path().cmp(b.path()));
        CacheFile {
            plugins: factories
                .iter()
                .flat_map(|f| f.plugins().iter().map(|p| (**p).clone()))
                .collect(),
            exceptions: inner.exceptions.iter().cloned().collect(),
        }
    }

    /// Merge a cache file into the registry. Modules are not loaded.
    pub fn load_cache_file(&self, file: CacheFile) {
        let mut by_path: BTreeMap<PathBuf, Vec<Arc<PluginDescriptor>>> = BTreeMap::new();
        for desc in file.plugins {
            by_path
                .entry(desc.path.clone())
                .or_default()
                .push(Arc::new(desc));
        }
        for (path, plugins) in by_path {
            self.register(Arc::new(Factory::new(path, plugins, None)));
        }
        let mut inner = self.inner.lock();
        inner.exceptions.extend(file.exceptions);
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PluginRegistry")
            .field("factories", &inner.factories.len())
            .field("plugins", &inner.plugins.len())
            .field("exceptions", &inner.exceptions.len())
            .finish()
    }
}
