//! Plugin sessions for consort.
//!
//! A [`PluginSession`] binds one plugin module to one host-side unit. It runs
//! on the audio thread and hands every blocking operation (opening, preset
//! I/O, resets) to the context's command pipeline.
//!
//! - [`automation`]: bus mappings and inline parameter inputs, with change detection
//! - [`bypass`]: the per-block process state and pass-through rendering
//! - [`Command`] / [`Reply`]: the command surface and its replies
//! - [`SessionSlot`]: queues commands that arrive before construction
//!
//! ## Usage
//!
//! ```ignore
//! use consort_session::{BlockAutomation, PluginSession, Reply};
//!
//! let (tx, replies) = crossbeam::channel::bounded(256);
//! let mut session = PluginSession::builder(context).replies(Arc::new(tx)).build()?;
//! session.open("/opt/plugins/reverb.so", false);
//!
//! // audio callback
//! context.pipeline().run_rt(&rt);
//! session.process(&mut buffers, &BlockAutomation::none());
//! ```

pub mod automation;
pub use automation::{
    AutomationEngine, BlockAutomation, BusKind, BusReader, Buses, InlineParam, Mapping,
    MappingList, Signal,
};

pub mod bypass;
pub use bypass::{ProcessState, StateInputs};

mod command;
pub use command::{Command, NullSink, ParamRef, ParamValue, Reply, ReplySink};

mod config;
pub use config::SessionConfig;

mod editor;

mod notify;
pub use notify::{Notification, NotificationQueue, QueueListener};

mod pending;
pub use pending::SessionSlot;

pub mod preset;
pub use preset::{PresetBuffer, PresetKind, PresetTarget};

mod session;
pub use session::{BlockSample, PluginSession, SessionBuilder};
