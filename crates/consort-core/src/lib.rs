//! Core vocabulary for the consort plugin host.
//!
//! - [`PluginDescriptor`]: static plugin metadata shared by registry and sessions
//! - [`Module`], [`ModuleLoader`], [`PluginInstance`], [`Window`]: capabilities
//!   of the binary modules and native windows consort drives
//! - [`CommandPipeline`]: staged async commands bridging the audio thread and workers
//! - [`RtToken`]: proof of running on the audio thread
//! - [`HostError`]: the single error type every host-facing failure is carried in

pub mod error;
pub use error::{ErrorKind, HostError, LoadStage, Result};

pub mod descriptor;
pub use descriptor::{
    ChannelLayout, ParamInfo, PluginDescriptor, PluginFlags, PluginFormat, PluginId, ShellEntry,
};

pub mod plugin;
pub use plugin::{
    AudioBuffers, BypassMode, Module, ModuleLoader, PluginInstance, PluginListener,
    ProcessContext, Rect, Window, WindowSystem,
};

pub mod midi;
pub use midi::{MidiEvent, MidiEventVec, SysexEvent};

pub mod transport;
pub use transport::TimeInfo;

mod rt;
pub use rt::{Precision, RtToken, Sample};

mod lockfree;
pub use lockfree::AtomicFlag;

pub mod pipeline;
pub use pipeline::{
    AsyncCommand, CommandPipeline, Completion, Detached, Liveness, PipelineConfig, SubmitError,
};
