//! The plugin session: one module bound to one host-side unit.
//!
//! A session is split in two:
//!
//! - [`PluginSession`] lives on the audio thread. It renders blocks, accepts
//!   [`Command`]s and owns the transport and outgoing MIDI queue.
//! - `SessionShared` is reference-counted and shared with every async
//!   command the session has in flight. It owns the module handle behind a
//!   mutex that the audio thread only ever try-locks.
//!
//! Dropping a [`PluginSession`] marks the shared half as dead. Commands still
//! in flight then skip their audio-thread stage, and the module is released
//! on a worker thread.

use crate::automation::{AutomationEngine, BlockAutomation, BusKind, Mapping};
use crate::bypass::{pass_through, zero_fill, ProcessState, StateInputs, WarnOnce};
use crate::command::{Command, NullSink, ParamRef, ParamValue, Reply, ReplySink};
use crate::config::SessionConfig;
use crate::editor::EditorThread;
use crate::notify::{Notification, NotificationQueue, QueueListener};
use crate::preset::{self, PresetKind, PresetTarget};
use consort_core::{
    AsyncCommand, AtomicFlag, AudioBuffers, BypassMode, ChannelLayout, Completion, HostError,
    Liveness, MidiEvent, MidiEventVec, PluginInstance, ProcessContext, Result, RtToken, Sample,
    SysexEvent, TimeInfo, WindowSystem,
};
use consort_plugin::HostContext;
use parking_lot::{Mutex, MutexGuard};
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Sample types a session can render, dispatching to the matching
/// process entry point of the module.
pub trait BlockSample: Sample {
    fn process(
        plugin: &mut dyn PluginInstance,
        buffers: &mut AudioBuffers<'_, '_, Self>,
        ctx: &ProcessContext<'_>,
    );
}

impl BlockSample for f32 {
    #[inline]
    fn process(
        plugin: &mut dyn PluginInstance,
        buffers: &mut AudioBuffers<'_, '_, f32>,
        ctx: &ProcessContext<'_>,
    ) {
        plugin.process_f32(buffers, ctx);
    }
}

impl BlockSample for f64 {
    #[inline]
    fn process(
        plugin: &mut dyn PluginInstance,
        buffers: &mut AudioBuffers<'_, '_, f64>,
        ctx: &ProcessContext<'_>,
    ) {
        plugin.process_f64(buffers, ctx);
    }
}

/// A configured module plus its optional editor thread.
///
/// Must never be dropped on the audio thread.
struct LoadedPlugin {
    instance: ManuallyDrop<Box<dyn PluginInstance>>,
    layout: ChannelLayout,
    editor: Option<EditorThread>,
}

impl LoadedPlugin {
    fn name(&self) -> &str {
        &self.instance.descriptor().name
    }

    fn param_index(&self, param: &ParamRef) -> Option<usize> {
        let index = match param {
            ParamRef::Index(index) => Some(*index).filter(|&i| i < self.instance.num_parameters()),
            ParamRef::Name(name) => self.instance.descriptor().param_index(name),
        };
        if index.is_none() {
            tracing::warn!("{}: unknown parameter {:?}", self.name(), param);
        }
        index
    }

    fn param_reply(&self, index: usize) -> Reply {
        Reply::ParamValue {
            index: Some(index),
            value: self.instance.get_parameter(index),
            display: self.instance.parameter_display(index),
        }
    }

    /// Run the module on the host buffers, limited to the configured channel
    /// counts, then silence the host outputs it did not write.
    fn render<T: BlockSample>(
        &mut self,
        buffers: &mut AudioBuffers<'_, '_, T>,
        ctx: &ProcessContext<'_>,
    ) {
        let layout = self.layout;
        let num_samples = buffers.num_samples;
        let outputs = layout.outputs.min(buffers.outputs.len());
        let aux_outputs = layout.aux_outputs.min(buffers.aux_outputs.len());
        let mut module_buffers = AudioBuffers {
            inputs: &buffers.inputs[..layout.inputs.min(buffers.inputs.len())],
            outputs: &mut buffers.outputs[..outputs],
            aux_inputs: &buffers.aux_inputs[..layout.aux_inputs.min(buffers.aux_inputs.len())],
            aux_outputs: &mut buffers.aux_outputs[..aux_outputs],
            num_samples,
        };
        T::process(&mut **self.instance, &mut module_buffers, ctx);
        zero_fill(buffers.outputs, outputs, num_samples);
        zero_fill(buffers.aux_outputs, aux_outputs, num_samples);
    }
}

impl Drop for LoadedPlugin {
    fn drop(&mut self) {
        // SAFETY: `instance` is not accessed again after this.
        let mut instance = unsafe { ManuallyDrop::take(&mut self.instance) };
        instance.set_listener(None);
        let name = instance.descriptor().name.clone();
        if let Some(mut editor) = self.editor.take() {
            if editor.close(instance).is_none() {
                tracing::warn!("Editor thread of {} dropped the instance", name);
            }
        }
        tracing::debug!("Released {}", name);
    }
}

fn render_bypass<T: BlockSample>(buffers: &mut AudioBuffers<'_, '_, T>) {
    let num_samples = buffers.num_samples;
    pass_through(buffers.inputs, buffers.outputs, num_samples);
    pass_through(buffers.aux_inputs, buffers.aux_outputs, num_samples);
}

/// Everything the audio thread and the workers contend for.
struct RtState {
    plugin: Option<LoadedPlugin>,
    automation: AutomationEngine,
    /// Bypass mode last forwarded to the module.
    applied_bypass: BypassMode,
    precision_warning: WarnOnce,
}

impl RtState {
    fn take_plugin(&mut self) -> Option<LoadedPlugin> {
        let loaded = self.plugin.take()?;
        self.automation.reset(0);
        self.applied_bypass = BypassMode::Off;
        self.precision_warning.reset();
        Some(loaded)
    }
}

/// Clears the suspended flag when dropped, even if the module panicked.
struct SuspendGuard<'a>(&'a AtomicFlag);

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

pub(crate) struct SessionShared {
    config: SessionConfig,
    context: Arc<HostContext>,
    windows: Option<Arc<dyn WindowSystem>>,
    replies: Arc<dyn ReplySink>,
    notifications: Arc<NotificationQueue>,
    rt: Mutex<RtState>,
    alive: AtomicFlag,
    loading: AtomicFlag,
    suspended: AtomicFlag,
    close_pending: AtomicFlag,
    in_flight: AtomicUsize,
}

impl Liveness for SessionShared {
    fn is_alive(&self) -> bool {
        self.alive.get()
    }
}

type SessionCommand<T> = AsyncCommand<SessionShared, T>;

fn finish<T>(owner: Option<&SessionShared>, _data: &mut T) {
    if let Some(shared) = owner {
        shared.command_finished();
    }
}

impl SessionShared {
    fn command<T: Send + 'static>(self: &Arc<Self>, name: &'static str, data: T) -> SessionCommand<T> {
        AsyncCommand::new(name, Arc::clone(self), data)
    }

    /// Submit a session command. Its stage 4 settles the in-flight count.
    fn submit<T: Send + 'static>(&self, cmd: SessionCommand<T>) -> bool {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.context.pipeline().submit(cmd.stage4(finish::<T>)).is_ok()
    }

    fn command_finished(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 && self.close_pending.swap(false) {
            let released = self.rt.lock().take_plugin();
            if released.is_some() {
                tracing::debug!("Running deferred close");
            }
        }
    }

    /// Refuse when suspended, when a worker holds the module or when nothing is loaded.
    fn check(&self, what: &str) -> Option<MutexGuard<'_, RtState>> {
        if self.suspended.get() {
            tracing::warn!("{}: plugin is suspended", what);
            return None;
        }
        let Some(guard) = self.rt.try_lock() else {
            tracing::warn!("{}: plugin is busy", what);
            return None;
        };
        if guard.plugin.is_none() {
            tracing::warn!("{}: no plugin loaded", what);
            return None;
        }
        Some(guard)
    }

    fn with_plugin<R>(
        &self,
        what: &str,
        f: impl FnOnce(&mut LoadedPlugin, &mut AutomationEngine) -> R,
    ) -> Option<R> {
        let mut guard = self.check(what)?;
        let RtState {
            plugin, automation, ..
        } = &mut *guard;
        let loaded = plugin.as_mut()?;
        Some(f(loaded, automation))
    }

    /// Hold the module exclusively with the session marked suspended.
    fn with_suspended<R>(&self, f: impl FnOnce(&mut RtState) -> Result<R>) -> Result<R> {
        self.suspended.set(true);
        let _resume = SuspendGuard(&self.suspended);
        let mut state = self.rt.lock();
        f(&mut state)
    }

    /// Hold the module exclusively, raising the suspended flag only if `suspend`.
    fn with_locked<R>(&self, suspend: bool, f: impl FnOnce(&mut RtState) -> Result<R>) -> Result<R> {
        if suspend {
            self.with_suspended(f)
        } else {
            f(&mut self.rt.lock())
        }
    }

    fn release(&self, loaded: LoadedPlugin) {
        if self.context.pipeline().submit(AsyncCommand::detached("release", loaded)).is_err() {
            tracing::warn!("Release queue full, plugin released on the calling thread");
        }
    }

    fn close(self: &Arc<Self>) {
        if self.in_flight.load(Ordering::Acquire) > 0 {
            self.close_pending.set(true);
            // the last command may have finished in between
            if self.in_flight.load(Ordering::Acquire) > 0 || !self.close_pending.swap(false) {
                tracing::debug!("Close deferred until pending commands finish");
                return;
            }
        }
        match self.rt.try_lock() {
            Some(mut state) => {
                if let Some(loaded) = state.take_plugin() {
                    drop(state);
                    self.release(loaded);
                }
            }
            None => {
                let cmd = self
                    .command("close", None::<LoadedPlugin>)
                    .stage2(|owner, released| {
                        if let Some(shared) = owner {
                            *released = shared.rt.lock().take_plugin();
                        }
                        false
                    });
                self.submit(cmd);
            }
        }
    }

    /// Resolve, instantiate and configure a module. Runs on a worker.
    fn load(&self, path: &str, editor: bool) -> Result<LoadedPlugin> {
        let (factory, descriptor) = self.context.resolve(path)?;
        let loader = Arc::clone(self.context.loader());

        let (editor, mut instance) = match (&self.windows, editor) {
            (Some(windows), true) => {
                let desc = Arc::clone(&descriptor);
                EditorThread::spawn(Arc::clone(windows), descriptor.name.clone(), move || {
                    factory.instantiate(&desc, &*loader)
                })?
            }
            (None, true) => {
                tracing::warn!("No window system, opening {} without editor", descriptor.name);
                (None, factory.instantiate(&descriptor, &*loader)?)
            }
            _ => (None, factory.instantiate(&descriptor, &*loader)?),
        };

        let config = &self.config;
        let layout = config.layout_for(&descriptor.channels);
        instance.setup(config.sample_rate, config.block_size, config.precision);
        instance.set_num_channels(layout.inputs, layout.outputs, layout.aux_inputs, layout.aux_outputs);
        // lets the module allocate its internal buffers
        instance.suspend();
        instance.resume();
        instance.set_listener(Some(Arc::new(QueueListener(Arc::clone(&self.notifications)))));

        tracing::info!("Opened {} ({})", descriptor.name, descriptor.path.display());
        Ok(LoadedPlugin {
            instance: ManuallyDrop::new(instance),
            layout,
            editor,
        })
    }

    fn drain_notifications(&self, mut engine: Option<&mut AutomationEngine>) {
        while let Some(notification) = self.notifications.pop() {
            let reply = match notification {
                Notification::ParamAutomated { index, value } => {
                    if let Some(engine) = engine.as_deref_mut() {
                        engine.record(index, value);
                    }
                    Reply::ParamAutomated { index, value }
                }
                Notification::Latency(samples) => Reply::Latency(samples),
                Notification::Midi(event) => Reply::Midi(event),
                Notification::Sysex(event) => Reply::Sysex(event.data),
            };
            self.replies.send(reply);
        }
        let dropped = self.notifications.take_dropped();
        if dropped > 0 {
            tracing::warn!("{} plugin notifications dropped, queue full", dropped);
        }
    }
}

fn load_preset(state: &mut RtState, kind: PresetKind, data: &[u8]) -> Result<()> {
    let loaded = state.plugin.as_mut().ok_or(HostError::NotLoaded)?;
    preset::apply(&mut **loaded.instance, kind, data)?;
    state.automation.invalidate();
    Ok(())
}

struct OpenJob {
    path: String,
    editor: bool,
    loaded: Option<Result<(LoadedPlugin, AutomationEngine)>>,
    /// Whatever the swap displaced, released with the command.
    released: Option<(Option<LoadedPlugin>, AutomationEngine)>,
}

fn open_stage2(owner: Option<&SessionShared>, job: &mut OpenJob) -> bool {
    let Some(shared) = owner else {
        return false;
    };
    job.loaded = Some(shared.load(&job.path, job.editor).map(|loaded| {
        let engine = AutomationEngine::new(loaded.instance.num_parameters());
        (loaded, engine)
    }));
    true
}

fn open_stage3(_rt: &RtToken, owner: Option<&SessionShared>, job: &mut OpenJob) -> Completion {
    let Some(shared) = owner else {
        return Completion::Done;
    };
    let Some(mut state) = shared.rt.try_lock() else {
        return Completion::Retry;
    };
    shared.loading.set(false);

    match job.loaded.take() {
        Some(Ok((loaded, mut engine))) => {
            let has_editor = loaded.editor.is_some();
            let latency = loaded.instance.latency_samples();
            std::mem::swap(&mut state.automation, &mut engine);
            state.applied_bypass = BypassMode::Off;
            state.precision_warning.reset();
            job.released = Some((state.plugin.replace(loaded), engine));
            drop(state);
            shared.replies.send(Reply::Opened {
                success: true,
                has_editor,
            });
            shared.replies.send(Reply::Latency(latency));
        }
        failed => {
            drop(state);
            if let Some(Err(e)) = &failed {
                tracing::warn!("Couldn't open {}: {}", job.path, e);
            }
            // keep the error so it is freed on the worker
            job.loaded = failed;
            shared.replies.send(Reply::Opened {
                success: false,
                has_editor: false,
            });
        }
    }
    Completion::Done
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Read,
    Write,
}

impl Transfer {
    fn reply(self, ok: bool) -> Reply {
        match self {
            Transfer::Read => Reply::PresetRead(ok),
            Transfer::Write => Reply::PresetWritten(ok),
        }
    }
}

struct PresetJob {
    kind: PresetKind,
    target: PresetTarget,
    transfer: Transfer,
    suspend: bool,
    ok: bool,
}

fn preset_stage2(owner: Option<&SessionShared>, job: &mut PresetJob) -> bool {
    let Some(shared) = owner else {
        return false;
    };
    let kind = job.kind;
    let suspend = job.suspend;
    let result = match job.transfer {
        Transfer::Read => job
            .target
            .read()
            .and_then(|data| shared.with_locked(suspend, |state| load_preset(state, kind, &data))),
        Transfer::Write => shared
            .with_locked(suspend, |state| {
                let loaded = state.plugin.as_mut().ok_or(HostError::NotLoaded)?;
                preset::extract(&mut **loaded.instance, kind)
            })
            .and_then(|data| job.target.write(&data)),
    };
    if let Err(e) = &result {
        tracing::warn!("Preset {:?} {:?} failed: {}", kind, job.transfer, e);
    }
    job.ok = result.is_ok();
    true
}

fn preset_stage3(_rt: &RtToken, owner: Option<&SessionShared>, job: &mut PresetJob) -> Completion {
    if let Some(shared) = owner {
        shared.replies.send(job.transfer.reply(job.ok));
    }
    Completion::Done
}

struct VendorJob {
    index: i32,
    value: isize,
    data: Vec<u8>,
    opt: f32,
    result: isize,
}

fn vendor_stage2(owner: Option<&SessionShared>, job: &mut VendorJob) -> bool {
    let Some(shared) = owner else {
        return false;
    };
    if let Some(loaded) = shared.rt.lock().plugin.as_mut() {
        job.result = loaded.instance.vendor_specific(job.index, job.value, &mut job.data, job.opt);
    }
    true
}

fn vendor_stage3(_rt: &RtToken, owner: Option<&SessionShared>, job: &mut VendorJob) -> Completion {
    if let Some(shared) = owner {
        shared.replies.send(Reply::VendorResult(job.result));
    }
    Completion::Done
}

/// Audio-thread half of a session.
///
/// Every method is meant to be called from the audio thread; blocking work
/// is handed to the context's command pipeline.
pub struct PluginSession {
    shared: Arc<SessionShared>,
    time: TimeInfo,
    midi: MidiEventVec,
    sysex: Vec<SysexEvent>,
    bypass: BypassMode,
}

impl PluginSession {
    pub fn builder(context: Arc<HostContext>) -> SessionBuilder {
        SessionBuilder {
            context,
            config: SessionConfig::default(),
            replies: None,
            windows: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn context(&self) -> &Arc<HostContext> {
        &self.shared.context
    }

    pub fn is_loaded(&self) -> bool {
        self.shared
            .rt
            .try_lock()
            .is_some_and(|state| state.plugin.is_some())
    }

    pub fn is_loading(&self) -> bool {
        self.shared.loading.get()
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.get()
    }

    /// Session commands submitted and not yet released.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn bypass_mode(&self) -> BypassMode {
        self.bypass
    }

    pub fn time_info(&self) -> &TimeInfo {
        &self.time
    }

    /// `None` if the parameter is unmapped or the module is busy.
    pub fn mapping(&self, index: usize) -> Option<Mapping> {
        self.shared.rt.try_lock()?.automation.mapping(index)
    }

    /// Render one block.
    ///
    /// Never blocks: if a worker holds the module, the block renders
    /// pass-through and reports [`ProcessState::Suspended`].
    pub fn process<T: BlockSample>(
        &mut self,
        buffers: &mut AudioBuffers<'_, '_, T>,
        automation: &BlockAutomation<'_>,
    ) -> ProcessState {
        let num_samples = buffers.num_samples;
        let shared = &*self.shared;
        let ctx = ProcessContext {
            midi_events: &self.midi,
            sysex_events: &self.sysex,
            time_info: &self.time,
        };

        let state = match shared.rt.try_lock() {
            Some(mut guard) => {
                let state = render_locked(shared, &mut guard, self.bypass, buffers, automation, &ctx);
                shared.drain_notifications(Some(&mut guard.automation));
                state
            }
            None => {
                render_bypass(buffers);
                shared.drain_notifications(None);
                ProcessState::Suspended
            }
        };

        self.midi.clear();
        self.sysex.clear();
        self.time.advance(num_samples);
        state
    }

    /// Dispatch one command.
    pub fn command(&mut self, command: Command) {
        tracing::trace!("command {}", command.name());
        match command {
            Command::Open { path, editor } => self.open(path, editor),
            Command::Close => self.close(),
            Command::Reset { asynchronous } => self.reset(asynchronous),
            Command::ShowEditor(visible) => self.show_editor(visible),
            Command::EditorRect => self.editor_rect(),
            Command::Bypass(mode) => self.set_bypass(mode),
            Command::SetParam { param, value } => self.set_param(param, value),
            Command::GetParam(param) => self.get_param(param),
            Command::GetParams { index, count } => self.get_params(index, count),
            Command::MapParam { index, bus, kind } => self.map_param(index, bus, kind),
            Command::UnmapParam(index) => self.unmap_param(index),
            Command::UnmapAll => self.unmap_all(),
            Command::SetProgram(index) => self.set_program(index),
            Command::SetProgramName(name) => self.set_program_name(&name),
            Command::QueryPrograms { index, count } => self.query_programs(index, count),
            Command::ReadPreset {
                kind,
                target,
                asynchronous,
            } => self.read_preset(kind, target, asynchronous),
            Command::WritePreset {
                kind,
                target,
                asynchronous,
            } => self.write_preset(kind, target, asynchronous),
            Command::SendMidi(event) => self.send_midi(event),
            Command::SendSysex(data) => self.send_sysex(data),
            Command::SetTempo(bpm) => self.time.set_tempo(bpm),
            Command::SetTimeSignature {
                numerator,
                denominator,
            } => self.time.set_time_signature(numerator, denominator),
            Command::SetPlaying(playing) => self.time.set_playing(playing),
            Command::SetPosition(beats) => self.time.set_position(beats),
            Command::GetPosition => self.get_position(),
            Command::VendorSpecific {
                index,
                value,
                data,
                opt,
                asynchronous,
            } => self.vendor_specific(index, value, data, opt, asynchronous),
        }
    }

    /// Open a module by plugin key or path. Replies [`Reply::Opened`].
    ///
    /// Only one open may be in flight; a second one is refused.
    pub fn open(&mut self, path: impl Into<String>, editor: bool) {
        let path = path.into();
        let shared = &self.shared;
        if !shared.loading.try_raise() {
            tracing::warn!("Already opening a plugin, ignoring open of {}", path);
            shared.replies.send(Reply::Opened {
                success: false,
                has_editor: false,
            });
            return;
        }

        // an open supersedes any close still waiting on commands
        shared.close_pending.set(false);
        if let Some(mut state) = shared.rt.try_lock() {
            if let Some(loaded) = state.take_plugin() {
                drop(state);
                shared.release(loaded);
            }
        }

        let job = OpenJob {
            path,
            editor,
            loaded: None,
            released: None,
        };
        let cmd = shared
            .command("open", job)
            .stage2(open_stage2)
            .stage3(open_stage3);
        if !shared.submit(cmd) {
            shared.loading.set(false);
            shared.replies.send(Reply::Opened {
                success: false,
                has_editor: false,
            });
        }
    }

    /// Unload the module. Deferred while other session commands are in flight.
    pub fn close(&mut self) {
        self.shared.close();
    }

    /// Suspend and resume the module to clear its internal state.
    pub fn reset(&mut self, asynchronous: bool) {
        let shared = &self.shared;
        if asynchronous {
            if shared.check("reset").is_none() {
                return;
            }
            let cmd = shared.command("reset", ()).stage2(|owner, _| {
                if let Some(shared) = owner {
                    let _ = shared.with_suspended(|state| {
                        if let Some(loaded) = state.plugin.as_mut() {
                            loaded.instance.suspend();
                            loaded.instance.resume();
                        }
                        Ok(())
                    });
                }
                false
            });
            shared.submit(cmd);
        } else {
            shared.with_plugin("reset", |loaded, _| {
                loaded.instance.suspend();
                loaded.instance.resume();
            });
        }
    }

    pub fn show_editor(&mut self, visible: bool) {
        self.shared.with_plugin("show_editor", |loaded, _| match &loaded.editor {
            Some(editor) => editor.show(visible),
            None => tracing::warn!("{} has no editor window", loaded.name()),
        });
    }

    /// Replies [`Reply::EditorRect`].
    pub fn editor_rect(&mut self) {
        let rect = self
            .shared
            .with_plugin("editor_rect", |loaded, _| {
                loaded.editor.as_ref().and(loaded.instance.editor_rect())
            })
            .flatten();
        self.shared.replies.send(Reply::EditorRect(rect));
    }

    /// Forwarded to the module at the start of the next block.
    pub fn set_bypass(&mut self, mode: BypassMode) {
        self.bypass = mode;
    }

    /// Explicit set: writes through immediately and clears any bus mapping
    /// on that parameter. Replies [`Reply::ParamValue`].
    pub fn set_param(&mut self, param: impl Into<ParamRef>, value: ParamValue) {
        let param = param.into();
        let reply = self
            .shared
            .with_plugin("set_param", |loaded, engine| {
                let index = loaded.param_index(&param)?;
                let ok = match &value {
                    ParamValue::Float(v) => engine.set_explicit(&mut **loaded.instance, index, *v),
                    ParamValue::Text(text) => {
                        engine.unmap(index);
                        let ok = loaded.instance.set_parameter_string(index, text, 0);
                        if ok {
                            engine.record(index, loaded.instance.get_parameter(index));
                        }
                        ok
                    }
                };
                ok.then(|| loaded.param_reply(index))
            })
            .flatten();
        self.shared.replies.send(reply.unwrap_or_else(Reply::param_failed));
    }

    /// Replies [`Reply::ParamValue`].
    pub fn get_param(&mut self, param: impl Into<ParamRef>) {
        let param = param.into();
        let reply = self
            .shared
            .with_plugin("get_param", |loaded, _| {
                loaded.param_index(&param).map(|index| loaded.param_reply(index))
            })
            .flatten();
        self.shared.replies.send(reply.unwrap_or_else(Reply::param_failed));
    }

    /// Replies [`Reply::ParamValues`], truncated to the module's parameter count.
    pub fn get_params(&mut self, index: usize, count: usize) {
        let values = self
            .shared
            .with_plugin("get_params", |loaded, _| {
                let end = index.saturating_add(count).min(loaded.instance.num_parameters());
                (index..end).map(|i| loaded.instance.get_parameter(i)).collect()
            })
            .unwrap_or_default();
        self.shared.replies.send(Reply::ParamValues { index, values });
    }

    pub fn map_param(&mut self, index: usize, bus: usize, kind: BusKind) {
        self.shared.with_plugin("map_param", |loaded, engine| {
            if index >= loaded.instance.num_parameters() || !engine.map(index, bus, kind) {
                tracing::warn!("map_param: parameter {} out of range", index);
            }
        });
    }

    pub fn unmap_param(&mut self, index: usize) {
        self.shared.with_plugin("unmap_param", |_, engine| engine.unmap(index));
    }

    pub fn unmap_all(&mut self) {
        self.shared.with_plugin("unmap_all", |_, engine| engine.unmap_all());
    }

    /// Replies [`Reply::ProgramIndex`] with the program now active.
    pub fn set_program(&mut self, index: usize) {
        let current = self.shared.with_plugin("set_program", |loaded, engine| {
            if index < loaded.instance.num_programs() {
                loaded.instance.set_program(index);
                engine.invalidate();
            } else {
                tracing::warn!("set_program: program {} out of range", index);
            }
            loaded.instance.program()
        });
        self.shared.replies.send(Reply::ProgramIndex(current));
    }

    /// Rename the current program. Replies [`Reply::ProgramName`].
    pub fn set_program_name(&mut self, name: &str) {
        let reply = self.shared.with_plugin("set_program_name", |loaded, _| {
            loaded.instance.set_program_name(name);
            let index = loaded.instance.program();
            Reply::ProgramName {
                index: Some(index),
                name: loaded.instance.program_name(index),
            }
        });
        self.shared.replies.send(reply.unwrap_or_else(Reply::program_failed));
    }

    /// One [`Reply::ProgramName`] per existing program, in index order.
    /// A refused query gets a single failed [`Reply::ProgramName`].
    pub fn query_programs(&mut self, index: usize, count: usize) {
        let replies = &self.shared.replies;
        let answered = self.shared.with_plugin("query_programs", |loaded, _| {
            let end = index.saturating_add(count).min(loaded.instance.num_programs());
            for i in index..end {
                replies.send(Reply::ProgramName {
                    index: Some(i),
                    name: loaded.instance.program_name(i),
                });
            }
        });
        if answered.is_none() {
            replies.send(Reply::program_failed());
        }
    }

    /// Load a program or bank. Replies [`Reply::PresetRead`] once a worker
    /// has done the transfer.
    ///
    /// An asynchronous transfer suspends the session while the module is
    /// updated. A synchronous one only holds the module lock, so blocks
    /// rendered meanwhile still report [`ProcessState::Suspended`].
    pub fn read_preset(&mut self, kind: PresetKind, target: PresetTarget, asynchronous: bool) {
        self.submit_preset(kind, target, Transfer::Read, asynchronous);
    }

    /// Save a program or bank. Replies [`Reply::PresetWritten`].
    pub fn write_preset(&mut self, kind: PresetKind, target: PresetTarget, asynchronous: bool) {
        self.submit_preset(kind, target, Transfer::Write, asynchronous);
    }

    fn submit_preset(&mut self, kind: PresetKind, target: PresetTarget, transfer: Transfer, suspend: bool) {
        let shared = &self.shared;
        if shared.check("preset").is_none() {
            shared.replies.send(transfer.reply(false));
            return;
        }
        let job = PresetJob {
            kind,
            target,
            transfer,
            suspend,
            ok: false,
        };
        let cmd = shared
            .command("preset", job)
            .stage2(preset_stage2)
            .stage3(preset_stage3);
        if !shared.submit(cmd) {
            shared.replies.send(transfer.reply(false));
        }
    }

    /// Queue a MIDI event for the next block.
    pub fn send_midi(&mut self, event: MidiEvent) {
        self.midi.push(event);
    }

    /// Queue a SysEx message for the next block.
    pub fn send_sysex(&mut self, data: Vec<u8>) {
        self.sysex.push(SysexEvent::new(data));
    }

    pub fn set_tempo(&mut self, bpm: f64) {
        self.time.set_tempo(bpm);
    }

    pub fn set_time_signature(&mut self, numerator: u32, denominator: u32) {
        self.time.set_time_signature(numerator, denominator);
    }

    pub fn set_playing(&mut self, playing: bool) {
        self.time.set_playing(playing);
    }

    pub fn set_position(&mut self, beats: f64) {
        self.time.set_position(beats);
    }

    /// Replies [`Reply::TransportPosition`] in beats.
    pub fn get_position(&mut self) {
        self.shared
            .replies
            .send(Reply::TransportPosition(self.time.position_beats));
    }

    /// Pass an opaque request to the module. Replies [`Reply::VendorResult`].
    pub fn vendor_specific(
        &mut self,
        index: i32,
        value: isize,
        mut data: Vec<u8>,
        opt: f32,
        asynchronous: bool,
    ) {
        let shared = &self.shared;
        if asynchronous {
            if shared.check("vendor_specific").is_none() {
                shared.replies.send(Reply::VendorResult(0));
                return;
            }
            let job = VendorJob {
                index,
                value,
                data,
                opt,
                result: 0,
            };
            let cmd = shared
                .command("vendor_specific", job)
                .stage2(vendor_stage2)
                .stage3(vendor_stage3);
            if !shared.submit(cmd) {
                shared.replies.send(Reply::VendorResult(0));
            }
            return;
        }
        let result = shared
            .with_plugin("vendor_specific", |loaded, _| {
                loaded.instance.vendor_specific(index, value, &mut data, opt)
            })
            .unwrap_or(0);
        shared.replies.send(Reply::VendorResult(result));
    }
}

fn render_locked<T: BlockSample>(
    shared: &SessionShared,
    state: &mut RtState,
    bypass: BypassMode,
    buffers: &mut AudioBuffers<'_, '_, T>,
    automation: &BlockAutomation<'_>,
    ctx: &ProcessContext<'_>,
) -> ProcessState {
    let RtState {
        plugin,
        automation: engine,
        applied_bypass,
        precision_warning,
    } = state;
    let precision_supported = plugin
        .as_ref()
        .map_or(true, |loaded| loaded.instance.supports_precision(T::PRECISION));
    let process_state = ProcessState::evaluate(StateInputs {
        loaded: plugin.is_some(),
        suspended: shared.suspended.get(),
        bypass,
        precision: T::PRECISION,
        precision_supported,
    });

    let Some(loaded) = plugin.as_mut() else {
        render_bypass(buffers);
        return process_state;
    };
    if process_state == ProcessState::Suspended {
        render_bypass(buffers);
        return process_state;
    }
    if *applied_bypass != bypass {
        loaded.instance.set_bypass(bypass);
        *applied_bypass = bypass;
    }
    if !precision_supported && precision_warning.first() {
        tracing::warn!(
            "{} does not support {} precision, bypassing",
            loaded.name(),
            T::PRECISION
        );
    }

    match process_state {
        ProcessState::ActiveSingle | ProcessState::ActiveDouble => {
            engine.process(&mut **loaded.instance, automation, buffers.num_samples);
            loaded.render(buffers, ctx);
        }
        ProcessState::BypassSoft if precision_supported => {
            loaded.render(buffers, ctx);
            render_bypass(buffers);
        }
        _ => render_bypass(buffers),
    }
    process_state
}

impl Drop for PluginSession {
    fn drop(&mut self) {
        self.shared.alive.set(false);
        self.shared.close();
    }
}

impl std::fmt::Debug for PluginSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSession")
            .field("config", &self.shared.config)
            .field("loaded", &self.is_loaded())
            .field("loading", &self.is_loading())
            .field("bypass", &self.bypass)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Builder for [`PluginSession`].
///
/// # Example
///
/// ```ignore
/// let (tx, replies) = crossbeam::channel::bounded(256);
/// let mut session = PluginSession::builder(context)
///     .config(SessionConfig { sample_rate: 48000.0, ..Default::default() })
///     .replies(Arc::new(tx))
///     .build()?;
/// session.open("Reverb", false);
/// ```
pub struct SessionBuilder {
    context: Arc<HostContext>,
    config: SessionConfig,
    replies: Option<Arc<dyn ReplySink>>,
    windows: Option<Arc<dyn WindowSystem>>,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Default: replies are discarded.
    pub fn replies(mut self, sink: Arc<dyn ReplySink>) -> Self {
        self.replies = Some(sink);
        self
    }

    /// Needed for editor windows; without one, modules open without editor.
    pub fn window_system(mut self, windows: Arc<dyn WindowSystem>) -> Self {
        self.windows = Some(windows);
        self
    }

    pub fn build(self) -> Result<PluginSession> {
        self.config.validate()?;
        let notifications = Arc::new(NotificationQueue::new(self.config.notification_capacity));
        let time = TimeInfo::new(self.config.sample_rate);
        let shared = Arc::new(SessionShared {
            config: self.config,
            context: self.context,
            windows: self.windows,
            replies: self.replies.unwrap_or_else(|| Arc::new(NullSink)),
            notifications,
            rt: Mutex::new(RtState {
                plugin: None,
                automation: AutomationEngine::default(),
                applied_bypass: BypassMode::Off,
                precision_warning: WarnOnce::default(),
            }),
            alive: AtomicFlag::new(true),
            loading: AtomicFlag::new(false),
            suspended: AtomicFlag::new(false),
            close_pending: AtomicFlag::new(false),
            in_flight: AtomicUsize::new(0),
        });
        Ok(PluginSession {
            shared,
            time,
            midi: MidiEventVec::new(),
            sysex: Vec::new(),
            bypass: BypassMode::Off,
        })
    }
}
