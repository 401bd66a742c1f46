//! Test helpers for consort-plugin integration tests.
//!
//! The mock loader decides what a module is from its file stem:
//! - `multi*`: shell module with two sub-plugins
//! - `bad*`: load fails with a module error
//! - `panic*`: the module panics while loading
//! - anything else: one plugin named after the capitalized stem

#![allow(dead_code)]

use consort_core::{
    HostError, LoadStage, Module, ModuleLoader, ParamInfo, PluginDescriptor, PluginFormat,
    PluginInstance, Result,
};
use consort_plugin::search::module_extensions;
use consort_plugin::{HostConfig, ProbeMode};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

pub struct MockModule {
    path: PathBuf,
    stem: String,
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl Module for MockModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> PluginFormat {
        PluginFormat::from_path(&self.path).unwrap_or(PluginFormat::Vst2)
    }

    fn probe(&self, shell_id: Option<u32>) -> Result<PluginDescriptor> {
        let desc = |name: &str| {
            PluginDescriptor::new(name, &self.path)
                .vendor("Mock Audio")
                .param(ParamInfo::new("Gain", "dB", 0))
                .param(ParamInfo::new("Mix", "%", 1))
                .program("Default")
        };
        if self.stem.starts_with("multi") {
            return Ok(match shell_id {
                None => PluginDescriptor::new("Multi", &self.path)
                    .shell_entry("Left", 1)
                    .shell_entry("Right", 2),
                Some(1) => desc("Left"),
                Some(_) => desc("Right"),
            });
        }
        Ok(desc(&capitalize(&self.stem)))
    }

    fn instantiate(&self, _descriptor: &PluginDescriptor) -> Result<Box<dyn PluginInstance>> {
        Err(HostError::Other("mock modules cannot be instantiated".into()))
    }
}

/// Counts loads and optionally blocks each load until released.
#[derive(Default)]
pub struct MockLoader {
    pub loads: AtomicUsize,
    gate: Mutex<Option<Receiver<()>>>,
    entered: Mutex<Option<Sender<()>>>,
}

impl MockLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every load wait for a `()` on the returned sender. The receiver
    /// gets a `()` whenever a load starts waiting.
    pub fn gated() -> (Arc<Self>, Sender<()>, Receiver<()>) {
        let (release_tx, release_rx) = mpsc::channel();
        let (entered_tx, entered_rx) = mpsc::channel();
        let loader = Self {
            gate: Mutex::new(Some(release_rx)),
            entered: Mutex::new(Some(entered_tx)),
            ..Default::default()
        };
        (Arc::new(loader), release_tx, entered_rx)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModuleLoader for MockLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn Module>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(entered) = self.entered.lock().unwrap().as_ref() {
            let _ = entered.send(());
        }
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            let _ = gate.recv();
        }

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        if stem.starts_with("bad") {
            return Err(HostError::load_failed(path, LoadStage::Opening, "mock refuses to load"));
        }
        if stem.starts_with("panic") {
            panic!("mock module crashed while loading");
        }
        Ok(Arc::new(MockModule {
            path: path.to_path_buf(),
            stem,
        }))
    }
}

/// In-process probing without the architecture check, cache under `dir`.
pub fn host_config(dir: &Path) -> HostConfig {
    HostConfig {
        settings_dir: dir.join("settings"),
        probe_mode: ProbeMode::InProcess,
        check_architecture: false,
        worker_threads: 1,
        ..Default::default()
    }
}

/// Create empty module files named `<stem>.<native extension>` under `dir`.
pub fn module_files(dir: &Path, stems: &[&str]) -> Vec<PathBuf> {
    std::fs::create_dir_all(dir).unwrap();
    stems
        .iter()
        .map(|stem| {
            let path = dir.join(format!("{}.{}", stem, module_extensions()[0]));
            std::fs::write(&path, b"").unwrap();
            std::fs::canonicalize(&path).unwrap()
        })
        .collect()
}
