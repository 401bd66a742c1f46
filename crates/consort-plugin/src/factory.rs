//! One binary module and the plugins it contains.

use consort_core::descriptor::{PluginDescriptor, PluginFormat};
use consort_core::error::{HostError, LoadStage, Result};
use consort_core::plugin::{Module, ModuleLoader, PluginInstance};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A module path with its descriptors.
///
/// Created when a module is first probed (or read back from the cache). The
/// module itself is loaded lazily on the first instantiation, so a factory
/// restored from the cache or probed in a child process costs nothing until
/// a session opens one of its plugins.
pub struct Factory {
    path: PathBuf,
    format: Option<PluginFormat>,
    plugins: Vec<Arc<PluginDescriptor>>,
    module: Mutex<Option<Arc<dyn Module>>>,
}

impl Factory {
    pub fn new(
        path: impl Into<PathBuf>,
        plugins: Vec<Arc<PluginDescriptor>>,
        module: Option<Arc<dyn Module>>,
    ) -> Self {
        let path = path.into();
        let format = plugins
            .first()
            .and_then(|p| p.format)
            .or_else(|| PluginFormat::from_path(&path));
        Self {
            path,
            format,
            plugins,
            module: Mutex::new(module),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> Option<PluginFormat> {
        self.format
    }

    pub fn plugins(&self) -> &[Arc<PluginDescriptor>] {
        &self.plugins
    }

    pub fn num_plugins(&self) -> usize {
        self.plugins.len()
    }

    /// Plugin by name, or the only plugin when `name` is `None`.
    pub fn find(&self, name: Option<&str>) -> Option<&Arc<PluginDescriptor>> {
        match name {
            Some(name) => self.plugins.iter().find(|p| p.name == name),
            None if self.plugins.len() == 1 => self.plugins.first(),
            None => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.module.lock().is_some()
    }

    /// The loaded module, loading it through `loader` on first use.
    pub fn module(&self, loader: &dyn ModuleLoader) -> Result<Arc<dyn Module>> {
        let mut slot = self.module.lock();
        if let Some(module) = slot.as_ref() {
            return Ok(Arc::clone(module));
        }
        tracing::debug!("Loading module {}", self.path.display());
        let module = loader.load(&self.path)?;
        *slot = Some(Arc::clone(&module));
        Ok(module)
    }

    /// Create a live instance of one of this factory's plugins.
    pub fn instantiate(
        &self,
        descriptor: &PluginDescriptor,
        loader: &dyn ModuleLoader,
    ) -> Result<Box<dyn PluginInstance>> {
        let module = self.module(loader)?;
        match catch_unwind(AssertUnwindSafe(|| module.instantiate(descriptor))) {
            Ok(result) => result,
            Err(_) => Err(HostError::load_failed(
                &self.path,
                LoadStage::Instantiation,
                format!("module panicked while creating '{}'", descriptor.name),
            )),
        }
    }
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("plugins", &self.plugins.iter().map(|p| &p.name).collect::<Vec<_>>())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
