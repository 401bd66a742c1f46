//! Capability traits for the collaborators consort drives but does not implement.
//!
//! Decoding a binary plugin ABI, creating native windows and running their
//! message loops all live behind these traits. A [`ModuleLoader`] turns a
//! path into a [`Module`]; a module introspects itself into
//! [`PluginDescriptor`]s and creates [`PluginInstance`]s.

use crate::descriptor::{PluginDescriptor, PluginFormat};
use crate::error::Result;
use crate::midi::{MidiEvent, SysexEvent};
use crate::rt::Precision;
use crate::transport::TimeInfo;
use std::path::Path;
use std::sync::Arc;

/// Channel buffers for one `process` call.
///
/// Channel counts never exceed what the module was configured with; they can
/// be lower when the host renders fewer channels.
pub struct AudioBuffers<'a, 'b, T> {
    pub inputs: &'a [&'b [T]],
    pub outputs: &'a mut [&'b mut [T]],
    pub aux_inputs: &'a [&'b [T]],
    pub aux_outputs: &'a mut [&'b mut [T]],
    pub num_samples: usize,
}

/// Per-block context handed to the module alongside its buffers.
#[derive(Clone, Copy)]
pub struct ProcessContext<'a> {
    pub midi_events: &'a [MidiEvent],
    pub sysex_events: &'a [SysexEvent],
    pub time_info: &'a TimeInfo,
}

/// Bypass request forwarded to the module's own bypass hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BypassMode {
    #[default]
    Off,
    /// Stop processing immediately, cutting any tail.
    Hard,
    /// Let the module keep running internally; its output is not used.
    Soft,
}

/// Editor window geometry in screen pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Notifications a module may send from any thread (audio, GUI, or its own).
pub trait PluginListener: Send + Sync {
    /// A parameter was changed by the module itself (GUI or internal automation).
    fn parameter_automated(&self, index: usize, value: f32);

    fn latency_changed(&self, samples: usize);

    fn midi_event(&self, event: MidiEvent);

    fn sysex_event(&self, event: SysexEvent);
}

/// Live, stateful handle to one plugin.
///
/// Exclusively owned by one session; never called from two threads at once.
pub trait PluginInstance: Send {
    fn descriptor(&self) -> &Arc<PluginDescriptor>;

    fn setup(&mut self, sample_rate: f64, block_size: usize, precision: Precision);

    fn set_num_channels(&mut self, inputs: usize, outputs: usize, aux_inputs: usize, aux_outputs: usize);

    fn suspend(&mut self);

    fn resume(&mut self);

    fn set_bypass(&mut self, mode: BypassMode);

    fn supports_precision(&self, precision: Precision) -> bool {
        match precision {
            Precision::Single => self.descriptor().single_precision(),
            Precision::Double => self.descriptor().double_precision(),
        }
    }

    /// Whether parameter writes honour their `sample_offset`.
    /// `None` means the module did not say.
    fn sample_accurate_parameters(&self) -> Option<bool> {
        None
    }

    fn process_f32(&mut self, buffers: &mut AudioBuffers<'_, '_, f32>, ctx: &ProcessContext<'_>);

    fn process_f64(&mut self, buffers: &mut AudioBuffers<'_, '_, f64>, ctx: &ProcessContext<'_>);

    fn num_parameters(&self) -> usize {
        self.descriptor().num_parameters()
    }

    /// Normalized 0..1.
    fn set_parameter(&mut self, index: usize, value: f32, sample_offset: usize);

    /// Set from a textual value. Returns false if the module rejected the string.
    fn set_parameter_string(&mut self, index: usize, text: &str, sample_offset: usize) -> bool;

    /// Normalized 0..1.
    fn get_parameter(&self, index: usize) -> f32;

    fn parameter_display(&self, index: usize) -> String;

    fn num_programs(&self) -> usize {
        self.descriptor().num_programs()
    }

    fn set_program(&mut self, index: usize);

    fn program(&self) -> usize;

    fn program_name(&self, index: usize) -> String;

    fn set_program_name(&mut self, name: &str);

    fn read_program_data(&mut self, data: &[u8]) -> Result<()>;

    fn write_program_data(&mut self) -> Result<Vec<u8>>;

    fn read_bank_data(&mut self, data: &[u8]) -> Result<()>;

    fn write_bank_data(&mut self) -> Result<Vec<u8>>;

    fn latency_samples(&self) -> usize {
        0
    }

    fn vendor_specific(&mut self, index: i32, value: isize, data: &mut [u8], opt: f32) -> isize;

    fn has_editor(&self) -> bool {
        self.descriptor().has_editor()
    }

    fn open_editor(&mut self, window: &dyn Window) -> Result<()>;

    fn close_editor(&mut self);

    fn editor_rect(&self) -> Option<Rect>;

    fn set_listener(&mut self, listener: Option<Arc<dyn PluginListener>>);
}

/// One loaded binary module. A shell module contains several plugins.
pub trait Module: Send + Sync {
    fn path(&self) -> &Path;

    fn format(&self) -> PluginFormat;

    /// Introspect the module. `shell_id` selects a sub-plugin of a shell module;
    /// with `None` a shell module answers with its `shell` entries filled in.
    fn probe(&self, shell_id: Option<u32>) -> Result<PluginDescriptor>;

    fn instantiate(&self, descriptor: &PluginDescriptor) -> Result<Box<dyn PluginInstance>>;
}

/// Opens binary modules by path.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn Module>>;
}

/// Native editor window. Created on the thread that will call [`Window::run`].
pub trait Window: Send + Sync {
    fn show(&self);

    fn hide(&self);

    fn bring_to_top(&self);

    /// Run the message loop until [`Window::quit`] is called from any thread.
    fn run(&self);

    fn quit(&self);

    fn set_title(&self, title: &str);

    fn set_geometry(&self, rect: Rect);

    /// Platform window handle (HWND, NSView*, X11 window) as an integer.
    fn native_handle(&self) -> usize;
}

/// Creates native windows on the calling thread.
pub trait WindowSystem: Send + Sync {
    fn create_window(&self) -> Result<Arc<dyn Window>>;
}
