//! Recursive discovery of candidate plugin modules.

use consort_core::descriptor::PluginFormat;
use std::collections::HashSet;
use std::fs::{self, ReadDir};
use std::path::{Path, PathBuf};

/// Module file extensions recognized on this platform.
pub fn module_extensions() -> &'static [&'static str] {
    #[cfg(target_os = "macos")]
    {
        &["vst", "vst3"]
    }

    #[cfg(target_os = "windows")]
    {
        &["dll", "vst3"]
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        &["so", "vst3"]
    }
}

/// Check if a path looks like a plugin module (file or bundle).
pub fn is_plugin_module(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|s| s.to_str()) else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();
    if !module_extensions().contains(&ext.as_str()) {
        return false;
    }
    match PluginFormat::from_path(path) {
        Some(PluginFormat::Vst2) => cfg!(feature = "vst2"),
        Some(PluginFormat::Vst3) => cfg!(feature = "vst3"),
        None => false,
    }
}

/// Bundles are directories that are loaded as a whole.
fn is_bundle(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("vst3") || ext.eq_ignore_ascii_case("vst"))
        .unwrap_or(false)
}

/// Lazy depth-first walk yielding candidate module paths.
///
/// Directories are read only as the iterator advances; unreadable entries are
/// logged and skipped. Bundle directories are yielded, not descended into.
/// Each directory is entered once, so symlink loops end the branch.
pub struct Search {
    root_module: Option<PathBuf>,
    stack: Vec<ReadDir>,
    visited: HashSet<PathBuf>,
}

impl Search {
    /// Push `dir` unless its canonical path was already entered.
    fn enter(&mut self, dir: &Path) {
        let canonical = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        if !self.visited.insert(canonical) {
            tracing::debug!("Already searched {}, skipping", dir.display());
            return;
        }
        match fs::read_dir(dir) {
            Ok(read) => self.stack.push(read),
            Err(e) => tracing::debug!("Cannot read {}: {}", dir.display(), e),
        }
    }
}

impl Iterator for Search {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        if let Some(module) = self.root_module.take() {
            return Some(module);
        }
        loop {
            let dir = self.stack.last_mut()?;
            let Some(entry) = dir.next() else {
                self.stack.pop();
                continue;
            };
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            // follow symlinks: many plugin folders link into vendor directories
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            if meta.is_dir() {
                if is_bundle(&path) {
                    if is_plugin_module(&path) {
                        return Some(path);
                    }
                    continue;
                }
                self.enter(&path);
            } else if is_plugin_module(&path) {
                return Some(path);
            }
        }
    }
}

/// Start a search below `root`. A missing root yields nothing.
///
/// A root that is itself a module yields just that path.
pub fn search(root: &Path) -> Search {
    let mut search = Search {
        root_module: None,
        stack: Vec::new(),
        visited: HashSet::new(),
    };
    if root.is_dir() && !is_bundle(root) {
        search.enter(root);
        if search.stack.is_empty() {
            tracing::warn!("Cannot search {}", root.display());
        }
    } else if root.exists() && is_plugin_module(root) {
        search.root_module = Some(root.to_path_buf());
    }
    search
}

/// Default search paths for the current platform and enabled formats.
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    #[cfg(feature = "vst2")]
    paths.extend(vst2_search_paths());
    #[cfg(feature = "vst3")]
    paths.extend(vst3_search_paths());
    paths
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_default()
}

#[cfg(feature = "vst2")]
fn vst2_search_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Library/Audio/Plug-Ins/VST"),
            home().join("Library/Audio/Plug-Ins/VST"),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        vec![
            PathBuf::from("C:\\Program Files\\VstPlugins"),
            PathBuf::from("C:\\Program Files\\Steinberg\\VstPlugins"),
            PathBuf::from("C:\\Program Files\\Common Files\\VST2"),
            PathBuf::from("C:\\Program Files\\Common Files\\Steinberg\\VST2"),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        vec![
            PathBuf::from("/usr/lib/vst"),
            PathBuf::from("/usr/local/lib/vst"),
            home().join(".vst"),
        ]
    }
}

#[cfg(feature = "vst3")]
fn vst3_search_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Library/Audio/Plug-Ins/VST3"),
            home().join("Library/Audio/Plug-Ins/VST3"),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        vec![PathBuf::from("C:\\Program Files\\Common Files\\VST3")]
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        vec![
            PathBuf::from("/usr/lib/vst3"),
            PathBuf::from("/usr/local/lib/vst3"),
            home().join(".vst3"),
        ]
    }
}
