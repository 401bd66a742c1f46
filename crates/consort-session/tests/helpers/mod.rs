//! Test helpers for consort-session integration tests.
//!
//! The mock loader decides what a module is from its file stem:
//! - `editor*`: like the default, with an editor window
//! - anything else: three parameters (Gain, Mix, Tone), two programs
//!   (Init, Bright), single precision only
//!
//! Every instance shares one [`PluginStats`] with the loader, so tests can
//! observe what the session did to the module.

#![allow(dead_code)]

use consort_core::{
    AudioBuffers, BypassMode, Module, ModuleLoader, ParamInfo, PluginDescriptor, PluginFlags,
    PluginFormat, PluginInstance, PluginListener, Precision, ProcessContext, Rect, Result,
    RtToken, Window, WindowSystem, HostError, MidiEvent,
};
use consort_plugin::search::module_extensions;
use consort_plugin::{HostConfig, HostContext, ProbeMode};
use consort_session::{BlockAutomation, PluginSession, ProcessState, Reply, SessionConfig};
use crossbeam::channel::{self, Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the session did to the module.
#[derive(Default)]
pub struct PluginStats {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub process_calls: AtomicUsize,
    pub set_parameter_calls: Mutex<Vec<(usize, f32, usize)>>,
    pub bypass: Mutex<Vec<BypassMode>>,
    pub setup: Mutex<Option<(f64, usize, Precision)>>,
    pub channels: Mutex<Option<(usize, usize, usize, usize)>>,
    pub midi_received: Mutex<Vec<MidiEvent>>,
    pub editor_closed: AtomicBool,
    pub editor_closed_on: Mutex<Option<String>>,
    listener: Mutex<Option<Arc<dyn PluginListener>>>,
    preset_gate: Mutex<Option<Receiver<()>>>,
    preset_entered: Mutex<Option<Sender<()>>>,
}

impl PluginStats {
    pub fn parameter_writes(&self, index: usize) -> Vec<(f32, usize)> {
        self.set_parameter_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _, _)| *i == index)
            .map(|&(_, value, offset)| (value, offset))
            .collect()
    }

    /// The listener the session installed on the most recent instance.
    pub fn listener(&self) -> Arc<dyn PluginListener> {
        self.listener.lock().unwrap().clone().expect("no listener installed")
    }

    /// Make program loads block until a `()` arrives on the returned sender.
    /// The receiver gets a `()` when a load starts waiting.
    pub fn gate_presets(&self) -> (Sender<()>, Receiver<()>) {
        let (release_tx, release_rx) = channel::unbounded();
        let (entered_tx, entered_rx) = channel::unbounded();
        *self.preset_gate.lock().unwrap() = Some(release_rx);
        *self.preset_entered.lock().unwrap() = Some(entered_tx);
        (release_tx, entered_rx)
    }

    fn wait_gate(&self) {
        if let Some(entered) = self.preset_entered.lock().unwrap().as_ref() {
            let _ = entered.send(());
        }
        let gate = self.preset_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
    }
}

/// Value the mock writes into every output sample it renders.
pub const MODULE_OUTPUT: f32 = 0.5;

pub struct MockPlugin {
    descriptor: Arc<PluginDescriptor>,
    params: Vec<f32>,
    program: usize,
    programs: Vec<String>,
    stats: Arc<PluginStats>,
    editor_open: bool,
}

impl MockPlugin {
    fn new(descriptor: &PluginDescriptor, stats: Arc<PluginStats>) -> Self {
        stats.created.fetch_add(1, Ordering::SeqCst);
        Self {
            params: vec![0.0; descriptor.num_parameters()],
            programs: descriptor.programs.clone(),
            descriptor: Arc::new(descriptor.clone()),
            program: 0,
            stats,
            editor_open: false,
        }
    }

    fn encode_params(&self) -> Vec<u8> {
        self.params.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn decode_params(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.params.len() * 4 {
            return Err(HostError::Preset(format!("bad program size {}", data.len())));
        }
        for (param, chunk) in self.params.iter_mut().zip(data.chunks_exact(4)) {
            *param = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }

    fn render<T: consort_core::Sample>(&mut self, buffers: &mut AudioBuffers<'_, '_, T>, ctx: &ProcessContext<'_>) {
        self.stats.process_calls.fetch_add(1, Ordering::SeqCst);
        self.stats
            .midi_received
            .lock()
            .unwrap()
            .extend_from_slice(ctx.midi_events);
        for output in buffers.outputs.iter_mut() {
            output[..buffers.num_samples].fill(T::from_f32(MODULE_OUTPUT));
        }
    }
}

impl Drop for MockPlugin {
    fn drop(&mut self) {
        self.stats.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

impl PluginInstance for MockPlugin {
    fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.descriptor
    }

    fn setup(&mut self, sample_rate: f64, block_size: usize, precision: Precision) {
        *self.stats.setup.lock().unwrap() = Some((sample_rate, block_size, precision));
    }

    fn set_num_channels(&mut self, inputs: usize, outputs: usize, aux_inputs: usize, aux_outputs: usize) {
        *self.stats.channels.lock().unwrap() = Some((inputs, outputs, aux_inputs, aux_outputs));
    }

    fn suspend(&mut self) {}

    fn resume(&mut self) {}

    fn set_bypass(&mut self, mode: BypassMode) {
        self.stats.bypass.lock().unwrap().push(mode);
    }

    fn process_f32(&mut self, buffers: &mut AudioBuffers<'_, '_, f32>, ctx: &ProcessContext<'_>) {
        self.render(buffers, ctx);
    }

    fn process_f64(&mut self, buffers: &mut AudioBuffers<'_, '_, f64>, ctx: &ProcessContext<'_>) {
        self.render(buffers, ctx);
    }

    fn set_parameter(&mut self, index: usize, value: f32, sample_offset: usize) {
        self.stats
            .set_parameter_calls
            .lock()
            .unwrap()
            .push((index, value, sample_offset));
        self.params[index] = value;
    }

    fn set_parameter_string(&mut self, index: usize, text: &str, sample_offset: usize) -> bool {
        match text.trim().parse::<f32>() {
            Ok(value) => {
                self.set_parameter(index, value, sample_offset);
                true
            }
            Err(_) => false,
        }
    }

    fn get_parameter(&self, index: usize) -> f32 {
        self.params[index]
    }

    fn parameter_display(&self, index: usize) -> String {
        format!("{:.2}", self.params[index])
    }

    fn set_program(&mut self, index: usize) {
        self.program = index;
    }

    fn program(&self) -> usize {
        self.program
    }

    fn program_name(&self, index: usize) -> String {
        self.programs.get(index).cloned().unwrap_or_default()
    }

    fn set_program_name(&mut self, name: &str) {
        self.programs[self.program] = name.to_string();
    }

    fn read_program_data(&mut self, data: &[u8]) -> Result<()> {
        self.stats.wait_gate();
        self.decode_params(data)
    }

    fn write_program_data(&mut self) -> Result<Vec<u8>> {
        Ok(self.encode_params())
    }

    fn read_bank_data(&mut self, data: &[u8]) -> Result<()> {
        let (&program, params) = data
            .split_first()
            .ok_or_else(|| HostError::Preset("empty bank".into()))?;
        self.decode_params(params)?;
        self.program = program as usize;
        Ok(())
    }

    fn write_bank_data(&mut self) -> Result<Vec<u8>> {
        let mut data = vec![self.program as u8];
        data.extend(self.encode_params());
        Ok(data)
    }

    fn vendor_specific(&mut self, index: i32, value: isize, data: &mut [u8], opt: f32) -> isize {
        data.reverse();
        index as isize + value + opt as isize
    }

    fn open_editor(&mut self, window: &dyn Window) -> Result<()> {
        window.set_title("mock editor");
        self.editor_open = true;
        Ok(())
    }

    fn close_editor(&mut self) {
        self.editor_open = false;
        self.stats.editor_closed.store(true, Ordering::SeqCst);
        *self.stats.editor_closed_on.lock().unwrap() = std::thread::current().name().map(String::from);
    }

    fn editor_rect(&self) -> Option<Rect> {
        self.editor_open.then_some(Rect {
            x: 0,
            y: 0,
            width: 400,
            height: 300,
        })
    }

    fn set_listener(&mut self, listener: Option<Arc<dyn PluginListener>>) {
        if listener.is_some() {
            *self.stats.listener.lock().unwrap() = listener;
        }
    }
}

pub struct MockModule {
    path: PathBuf,
    stem: String,
    stats: Arc<PluginStats>,
}

impl Module for MockModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> PluginFormat {
        PluginFormat::from_path(&self.path).unwrap_or(PluginFormat::Vst2)
    }

    fn probe(&self, _shell_id: Option<u32>) -> Result<PluginDescriptor> {
        let mut name = self.stem.clone();
        if let Some(first) = name.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        Ok(PluginDescriptor::new(name, &self.path)
            .vendor("Mock Audio")
            .param(ParamInfo::new("Gain", "dB", 0))
            .param(ParamInfo::new("Mix", "%", 1))
            .param(ParamInfo::new("Tone", "Hz", 2))
            .program("Init")
            .program("Bright")
            .flag(PluginFlags::HAS_EDITOR, self.stem.starts_with("editor")))
    }

    fn instantiate(&self, descriptor: &PluginDescriptor) -> Result<Box<dyn PluginInstance>> {
        Ok(Box::new(MockPlugin::new(descriptor, Arc::clone(&self.stats))))
    }
}

#[derive(Default)]
pub struct MockLoader {
    pub stats: Arc<PluginStats>,
}

impl MockLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ModuleLoader for MockLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn Module>> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        Ok(Arc::new(MockModule {
            path: path.to_path_buf(),
            stem,
            stats: Arc::clone(&self.stats),
        }))
    }
}

/// Window whose message loop runs until `quit`.
pub struct MockWindow {
    pub visible: AtomicBool,
    pub quit: AtomicBool,
    pub title: Mutex<String>,
    pub geometry: Mutex<Option<Rect>>,
    quit_tx: Sender<()>,
    quit_rx: Receiver<()>,
}

impl Window for MockWindow {
    fn show(&self) {
        self.visible.store(true, Ordering::SeqCst);
    }

    fn hide(&self) {
        self.visible.store(false, Ordering::SeqCst);
    }

    fn bring_to_top(&self) {}

    fn run(&self) {
        let _ = self.quit_rx.recv();
    }

    fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        let _ = self.quit_tx.send(());
    }

    fn set_title(&self, title: &str) {
        *self.title.lock().unwrap() = title.to_string();
    }

    fn set_geometry(&self, rect: Rect) {
        *self.geometry.lock().unwrap() = Some(rect);
    }

    fn native_handle(&self) -> usize {
        0
    }
}

#[derive(Default)]
pub struct MockWindowSystem {
    pub windows: Mutex<Vec<Arc<MockWindow>>>,
}

impl WindowSystem for MockWindowSystem {
    fn create_window(&self) -> Result<Arc<dyn Window>> {
        let (quit_tx, quit_rx) = channel::bounded(1);
        let window = Arc::new(MockWindow {
            visible: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            title: Mutex::new(String::new()),
            geometry: Mutex::new(None),
            quit_tx,
            quit_rx,
        });
        self.windows.lock().unwrap().push(Arc::clone(&window));
        Ok(window)
    }
}

/// Context without worker threads: tests drive the pipeline by hand.
pub fn manual_context(dir: &Path, loader: Arc<MockLoader>) -> Arc<HostContext> {
    let config = HostConfig {
        settings_dir: dir.join("settings"),
        probe_mode: ProbeMode::InProcess,
        check_architecture: false,
        worker_threads: 0,
        ..Default::default()
    };
    HostContext::new(config, loader).unwrap()
}

/// Create an empty module file `<stem>.<native extension>` under `dir`.
pub fn module_file(dir: &Path, stem: &str) -> String {
    let plugins = dir.join("plugins");
    std::fs::create_dir_all(&plugins).unwrap();
    let path = plugins.join(format!("{}.{}", stem, module_extensions()[0]));
    std::fs::write(&path, b"").unwrap();
    std::fs::canonicalize(&path)
        .unwrap()
        .to_string_lossy()
        .into_owned()
}

pub fn session(context: &Arc<HostContext>) -> (PluginSession, Receiver<Reply>) {
    session_with(context, SessionConfig::default())
}

pub fn session_with(context: &Arc<HostContext>, config: SessionConfig) -> (PluginSession, Receiver<Reply>) {
    let (tx, rx) = channel::bounded(1024);
    let session = PluginSession::builder(Arc::clone(context))
        .config(config)
        .replies(Arc::new(tx))
        .build()
        .unwrap();
    (session, rx)
}

/// Run every stage that is ready: stage 2, then stage 3, then stage 4.
pub fn pump(context: &HostContext) {
    let rt = RtToken::audio_thread();
    context.pipeline().run_nrt();
    context.pipeline().run_rt(&rt);
    context.pipeline().run_nrt();
}

pub fn drain(rx: &Receiver<Reply>) -> Vec<Reply> {
    rx.try_iter().collect()
}

/// Open `stem` and complete the open. Returns the replies it produced.
pub fn open(context: &HostContext, session: &mut PluginSession, rx: &Receiver<Reply>, path: &str) -> Vec<Reply> {
    session.open(path, false);
    pump(context);
    drain(rx)
}

/// Render one stereo f32 block of `num_samples` with the given input value.
pub fn render(
    session: &mut PluginSession,
    input: f32,
    num_samples: usize,
    automation: &BlockAutomation<'_>,
) -> (ProcessState, Vec<Vec<f32>>) {
    let inputs = vec![vec![input; num_samples]; 2];
    let mut outputs = vec![vec![9.0f32; num_samples]; 2];
    let ins: Vec<&[f32]> = inputs.iter().map(|v| v.as_slice()).collect();
    let mut outs: Vec<&mut [f32]> = outputs.iter_mut().map(|v| v.as_mut_slice()).collect();
    let mut buffers = AudioBuffers {
        inputs: &ins,
        outputs: &mut outs,
        aux_inputs: &[],
        aux_outputs: &mut [],
        num_samples,
    };
    let state = session.process(&mut buffers, automation);
    (state, outputs)
}
