//! # Consort - Audio Plugin Host
//!
//! Loads binary audio plugins and drives them from a real-time audio thread.
//!
//! ## Architecture
//!
//! Consort is an umbrella crate that coordinates:
//! - **consort-core** - Descriptors, capability traits, errors and the staged command pipeline
//! - **consort-plugin** - Discovery: search, crash-isolated probing, registry and cache file
//! - **consort-session** - Plugin sessions: automation, bypass, presets, editor windows
//!
//! ## Quick Start
//!
//! ```ignore
//! use consort::prelude::*;
//!
//! let host = ConsortHost::builder()
//!     .loader(Arc::new(my_loader))
//!     .sample_rate(48000.0)
//!     .build()?;
//!
//! host.search(&SearchRequest::new(["/opt/plugins"]))?;
//!
//! let (tx, replies) = crossbeam::channel::bounded(256);
//! let mut session = host.create_session(Arc::new(tx))?;
//! session.open("Reverb", false);
//! ```
//!
//! ## Feature Flags
//!
//! - `vst2` - Search VST2 locations and extensions
//! - `vst3` - Search VST3 locations and bundles

/// Re-export of consort-core for direct access
pub use consort_core as core;

pub use consort_core::{
    AudioBuffers, BypassMode, ChannelLayout, ErrorKind, HostError, LoadStage, MidiEvent, Module,
    ModuleLoader, ParamInfo, PluginDescriptor, PluginFlags, PluginFormat, PluginInstance,
    PluginListener, Precision, ProcessContext, Rect, RtToken, Sample, SysexEvent, TimeInfo,
    Window, WindowSystem,
};

// Discovery
pub use consort_plugin as plugin;

pub use consort_plugin::{
    DylibLoader, HostConfig, HostContext, ProbeMode, ProbeResult, ProbeStatus, SearchFlags,
    SearchReport, SearchRequest,
};

// Sessions
pub use consort_session as session;

pub use consort_session::{
    BlockAutomation, Buses, BusKind, Command, InlineParam, ParamRef, ParamValue, PluginSession,
    PresetKind, PresetTarget, ProcessState, Reply, ReplySink, SessionBuilder, SessionConfig,
    SessionSlot, Signal,
};

mod builder;
mod error;
mod host;

pub use builder::ConsortHostBuilder;
pub use error::{Error, Result};
pub use host::ConsortHost;

/// Convenience prelude for common imports
pub mod prelude {
    // Main host
    pub use crate::{ConsortHost, ConsortHostBuilder};

    // Discovery
    pub use crate::{DylibLoader, ProbeMode, SearchFlags, SearchRequest};

    // Sessions
    pub use crate::{
        BlockAutomation, BusKind, Command, ParamValue, PluginSession, PresetKind, PresetTarget,
        ProcessState, Reply, SessionConfig,
    };

    // Audio
    pub use crate::{AudioBuffers, BypassMode, MidiEvent, Precision, RtToken};

    pub use std::sync::Arc;
}
