//! Test helpers and fixtures for consort integration tests.
//!
//! A gain module stands in for a real plugin binary: every file it is asked
//! to load becomes one plugin named after the capitalized file stem, with a
//! single `Gain` parameter that scales input to output.

#![allow(dead_code)]

use consort::prelude::*;
use consort::{
    Module, ModuleLoader, ParamInfo, PluginDescriptor, PluginFormat, PluginInstance,
    PluginListener, ProcessContext, Rect, Window,
};
use consort::core::{HostError, LoadStage, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default test sample rate
pub const TEST_SAMPLE_RATE: f64 = 48000.0;

/// Standard block size for deterministic testing
pub const TEST_BLOCK_SIZE: usize = 128;

pub struct GainPlugin {
    descriptor: Arc<PluginDescriptor>,
    gain: f32,
}

impl GainPlugin {
    fn render<T: consort::Sample>(&self, buffers: &mut AudioBuffers<'_, '_, T>) {
        let n = buffers.num_samples;
        for (input, output) in buffers.inputs.iter().zip(buffers.outputs.iter_mut()) {
            for (o, i) in output[..n].iter_mut().zip(&input[..n]) {
                *o = T::from_f32(i.to_f32() * self.gain);
            }
        }
    }
}

impl PluginInstance for GainPlugin {
    fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.descriptor
    }

    fn setup(&mut self, _sample_rate: f64, _block_size: usize, _precision: Precision) {}

    fn set_num_channels(&mut self, _inputs: usize, _outputs: usize, _aux_inputs: usize, _aux_outputs: usize) {}

    fn suspend(&mut self) {}

    fn resume(&mut self) {}

    fn set_bypass(&mut self, _mode: BypassMode) {}

    fn process_f32(&mut self, buffers: &mut AudioBuffers<'_, '_, f32>, _ctx: &ProcessContext<'_>) {
        self.render(buffers);
    }

    fn process_f64(&mut self, buffers: &mut AudioBuffers<'_, '_, f64>, _ctx: &ProcessContext<'_>) {
        self.render(buffers);
    }

    fn set_parameter(&mut self, _index: usize, value: f32, _sample_offset: usize) {
        self.gain = value;
    }

    fn set_parameter_string(&mut self, index: usize, text: &str, sample_offset: usize) -> bool {
        text.parse::<f32>()
            .map(|value| self.set_parameter(index, value, sample_offset))
            .is_ok()
    }

    fn get_parameter(&self, _index: usize) -> f32 {
        self.gain
    }

    fn parameter_display(&self, _index: usize) -> String {
        format!("{:.1}", self.gain)
    }

    fn set_program(&mut self, _index: usize) {}

    fn program(&self) -> usize {
        0
    }

    fn program_name(&self, _index: usize) -> String {
        "Default".to_string()
    }

    fn set_program_name(&mut self, _name: &str) {}

    fn read_program_data(&mut self, data: &[u8]) -> Result<()> {
        let bytes: [u8; 4] = data
            .try_into()
            .map_err(|_| HostError::Preset("expected 4 bytes".into()))?;
        self.gain = f32::from_le_bytes(bytes);
        Ok(())
    }

    fn write_program_data(&mut self) -> Result<Vec<u8>> {
        Ok(self.gain.to_le_bytes().to_vec())
    }

    fn read_bank_data(&mut self, data: &[u8]) -> Result<()> {
        self.read_program_data(data)
    }

    fn write_bank_data(&mut self) -> Result<Vec<u8>> {
        self.write_program_data()
    }

    fn vendor_specific(&mut self, _index: i32, _value: isize, _data: &mut [u8], _opt: f32) -> isize {
        0
    }

    fn open_editor(&mut self, _window: &dyn Window) -> Result<()> {
        Err(HostError::Editor("no editor".into()))
    }

    fn close_editor(&mut self) {}

    fn editor_rect(&self) -> Option<Rect> {
        None
    }

    fn set_listener(&mut self, _listener: Option<Arc<dyn PluginListener>>) {}
}

pub struct GainModule {
    path: PathBuf,
    name: String,
}

impl Module for GainModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> PluginFormat {
        PluginFormat::from_path(&self.path).unwrap_or(PluginFormat::Vst2)
    }

    fn probe(&self, _shell_id: Option<u32>) -> Result<PluginDescriptor> {
        Ok(PluginDescriptor::new(self.name.clone(), &self.path)
            .vendor("Consort Tests")
            .param(ParamInfo::new("Gain", "", 0))
            .program("Default"))
    }

    fn instantiate(&self, descriptor: &PluginDescriptor) -> Result<Box<dyn PluginInstance>> {
        Ok(Box::new(GainPlugin {
            descriptor: Arc::new(descriptor.clone()),
            gain: 1.0,
        }))
    }
}

#[derive(Default)]
pub struct GainLoader {
    pub loads: AtomicUsize,
}

impl GainLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModuleLoader for GainLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn Module>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !path.exists() {
            return Err(HostError::load_failed(path, LoadStage::Opening, "no such file"));
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let mut chars = stem.chars();
        let name = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        };
        Ok(Arc::new(GainModule {
            path: path.to_path_buf(),
            name,
        }))
    }
}

/// Host with in-process probing, no architecture check and the cache under `dir`.
/// With `workers == 0` the tests drive the pipeline themselves.
pub fn test_host(dir: &Path, loader: Arc<GainLoader>, workers: usize) -> ConsortHost {
    ConsortHost::builder()
        .settings_dir(dir.join("settings"))
        .probe_mode(ProbeMode::InProcess)
        .check_architecture(false)
        .worker_threads(workers)
        .loader(loader)
        .sample_rate(TEST_SAMPLE_RATE)
        .block_size(TEST_BLOCK_SIZE)
        .build()
        .expect("Failed to create test host")
}

/// Create empty module files named `<stem>.<native extension>` under `dir`.
pub fn module_files(dir: &Path, stems: &[&str]) -> Vec<PathBuf> {
    std::fs::create_dir_all(dir).unwrap();
    stems
        .iter()
        .map(|stem| {
            let ext = consort::plugin::search::module_extensions()[0];
            let path = dir.join(format!("{}.{}", stem, ext));
            std::fs::write(&path, b"").unwrap();
            std::fs::canonicalize(&path).unwrap()
        })
        .collect()
}

/// Render one stereo block of constant `input`.
pub fn render_block(
    session: &mut PluginSession,
    input: f32,
    num_samples: usize,
) -> (ProcessState, Vec<Vec<f32>>) {
    let inputs = vec![vec![input; num_samples]; 2];
    let mut outputs = vec![vec![0.0f32; num_samples]; 2];
    let ins: Vec<&[f32]> = inputs.iter().map(|v| v.as_slice()).collect();
    let mut outs: Vec<&mut [f32]> = outputs.iter_mut().map(|v| v.as_mut_slice()).collect();
    let mut buffers = AudioBuffers {
        inputs: &ins,
        outputs: &mut outs,
        aux_inputs: &[],
        aux_outputs: &mut [],
        num_samples,
    };
    let state = session.process(&mut buffers, &BlockAutomation::none());
    (state, outputs)
}
