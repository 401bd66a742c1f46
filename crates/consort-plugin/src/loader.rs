//! Dynamic-library module loader.
//!
//! [`DylibLoader`] does the format-independent part of loading a module:
//! bundle resolution, the architecture check, `dlopen`/`LoadLibrary`, and
//! the entry-point lookup. Talking to the plugin ABI behind the entry point
//! is delegated to an [`AbiAdapter`] registered for the module's format.

use crate::arch;
use consort_core::descriptor::PluginFormat;
use consort_core::error::{HostError, LoadStage, Result};
use consort_core::plugin::{Module, ModuleLoader};
use libloading::Library;
use std::ffi::c_void;
use std::path::Path;
use std::sync::Arc;

/// Turns an opened library into a [`Module`] for one plugin ABI.
pub trait AbiAdapter: Send + Sync {
    fn format(&self) -> PluginFormat;

    /// `entry` is the exported symbol that was found.
    fn open(&self, path: &Path, library: Library, entry: &'static str) -> Result<Arc<dyn Module>>;
}

/// Exported symbols that mark a module of the given format.
pub fn entry_points(format: PluginFormat) -> &'static [&'static str] {
    match format {
        PluginFormat::Vst2 => &["VSTPluginMain", "main_macho", "main"],
        PluginFormat::Vst3 => &["GetPluginFactory"],
    }
}

#[derive(Default)]
pub struct DylibLoader {
    adapters: Vec<Arc<dyn AbiAdapter>>,
}

impl DylibLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn AbiAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    fn adapter(&self, format: PluginFormat) -> Option<&Arc<dyn AbiAdapter>> {
        self.adapters.iter().find(|a| a.format() == format)
    }
}

impl ModuleLoader for DylibLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn Module>> {
        let format = PluginFormat::from_path(path).ok_or_else(|| {
            HostError::load_failed(path, LoadStage::Scanning, "unrecognized module extension")
        })?;
        let binary = arch::check_architecture(path)?;

        // SAFETY: the architecture matches; running the module's static
        // initializers is inherent to loading a plugin.
        let library = unsafe { Library::new(&binary) }.map_err(|e| {
            HostError::load_failed(path, LoadStage::Opening, format!("Failed to load library: {}", e))
        })?;

        let symbols = entry_points(format);
        let entry = symbols
            .iter()
            .copied()
            // SAFETY: the symbol is only looked up, never called here.
            .find(|symbol| unsafe { library.get::<*const c_void>(symbol.as_bytes()) }.is_ok())
            .ok_or_else(|| HostError::MissingEntryPoint {
                path: path.to_path_buf(),
                symbol: symbols.join(" / "),
            })?;

        let adapter = self.adapter(format).ok_or_else(|| {
            HostError::Unsupported(format!(
                "no {} ABI adapter registered for {}",
                format,
                path.display()
            ))
        })?;
        tracing::debug!("Opened {} module {} ({})", format, path.display(), entry);
        adapter.open(path, library, entry)
    }
}
