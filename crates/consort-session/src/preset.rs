//! Preset data transfer between modules and files or in-memory buffers.

use consort_core::{HostError, PluginInstance, Result};
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Program (one patch) or bank (every program) granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresetKind {
    Program,
    Bank,
}

/// Byte buffer shared with the host (e.g. backing one of its sample buffers).
pub type PresetBuffer = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, Clone)]
pub enum PresetTarget {
    File(PathBuf),
    Buffer(PresetBuffer),
}

impl PresetTarget {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        PresetTarget::File(path.into())
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        match self {
            PresetTarget::File(path) => fs::read(path).map_err(|e| {
                HostError::Preset(format!("cannot read {}: {}", path.display(), e))
            }),
            PresetTarget::Buffer(buffer) => {
                let data = buffer.lock().clone();
                if data.is_empty() {
                    return Err(HostError::Preset("preset buffer is empty".into()));
                }
                Ok(data)
            }
        }
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        match self {
            PresetTarget::File(path) => write_atomic(path, data),
            PresetTarget::Buffer(buffer) => {
                let mut buffer = buffer.lock();
                buffer.clear();
                buffer.extend_from_slice(data);
                Ok(())
            }
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    file.persist(path)
        .map_err(|e| HostError::Preset(format!("cannot write {}: {}", path.display(), e.error)))?;
    Ok(())
}

/// Load preset bytes into the module.
pub fn apply(plugin: &mut dyn PluginInstance, kind: PresetKind, data: &[u8]) -> Result<()> {
    match kind {
        PresetKind::Program => plugin.read_program_data(data),
        PresetKind::Bank => plugin.read_bank_data(data),
    }
}

/// Serialize the module's current program or bank.
pub fn extract(plugin: &mut dyn PluginInstance, kind: PresetKind) -> Result<Vec<u8>> {
    match kind {
        PresetKind::Program => plugin.write_program_data(),
        PresetKind::Bank => plugin.write_bank_data(),
    }
}
