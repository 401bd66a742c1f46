//! The command surface of a session and the replies it sends back.

use crate::automation::BusKind;
use crate::preset::{PresetKind, PresetTarget};
use consort_core::{BypassMode, MidiEvent, Rect};

/// A parameter addressed by index or by name.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamRef {
    Index(usize),
    Name(String),
}

impl From<usize> for ParamRef {
    fn from(index: usize) -> Self {
        ParamRef::Index(index)
    }
}

impl From<&str> for ParamRef {
    fn from(name: &str) -> Self {
        ParamRef::Name(name.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Normalized 0..1.
    Float(f32),
    /// Parsed by the module.
    Text(String),
}

/// Everything a host can ask of one session.
#[derive(Debug, Clone)]
pub enum Command {
    Open {
        path: String,
        editor: bool,
    },
    Close,
    /// Suspend and resume the module to clear its internal state.
    Reset {
        asynchronous: bool,
    },
    ShowEditor(bool),
    EditorRect,
    Bypass(BypassMode),

    SetParam {
        param: ParamRef,
        value: ParamValue,
    },
    GetParam(ParamRef),
    GetParams {
        index: usize,
        count: usize,
    },
    MapParam {
        index: usize,
        bus: usize,
        kind: BusKind,
    },
    UnmapParam(usize),
    UnmapAll,

    SetProgram(usize),
    SetProgramName(String),
    QueryPrograms {
        index: usize,
        count: usize,
    },
    ReadPreset {
        kind: PresetKind,
        target: PresetTarget,
        asynchronous: bool,
    },
    WritePreset {
        kind: PresetKind,
        target: PresetTarget,
        asynchronous: bool,
    },

    SendMidi(MidiEvent),
    SendSysex(Vec<u8>),

    SetTempo(f64),
    SetTimeSignature {
        numerator: u32,
        denominator: u32,
    },
    SetPlaying(bool),
    SetPosition(f64),
    GetPosition,

    VendorSpecific {
        index: i32,
        value: isize,
        data: Vec<u8>,
        opt: f32,
        asynchronous: bool,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Open { .. } => "open",
            Command::Close => "close",
            Command::Reset { .. } => "reset",
            Command::ShowEditor(_) => "show_editor",
            Command::EditorRect => "editor_rect",
            Command::Bypass(_) => "bypass",
            Command::SetParam { .. } => "set_param",
            Command::GetParam(_) => "get_param",
            Command::GetParams { .. } => "get_params",
            Command::MapParam { .. } => "map_param",
            Command::UnmapParam(_) => "unmap_param",
            Command::UnmapAll => "unmap_all",
            Command::SetProgram(_) => "set_program",
            Command::SetProgramName(_) => "set_program_name",
            Command::QueryPrograms { .. } => "query_programs",
            Command::ReadPreset { .. } => "read_preset",
            Command::WritePreset { .. } => "write_preset",
            Command::SendMidi(_) => "send_midi",
            Command::SendSysex(_) => "send_sysex",
            Command::SetTempo(_) => "set_tempo",
            Command::SetTimeSignature { .. } => "set_time_signature",
            Command::SetPlaying(_) => "set_playing",
            Command::SetPosition(_) => "set_position",
            Command::GetPosition => "get_position",
            Command::VendorSpecific { .. } => "vendor_specific",
        }
    }
}

/// Messages a session sends to the host.
///
/// Failures are explicit: a parameter reply with `index: None`, a `false`
/// result flag, an empty value list.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Opened {
        success: bool,
        has_editor: bool,
    },
    ParamValue {
        index: Option<usize>,
        value: f32,
        display: String,
    },
    ParamValues {
        index: usize,
        values: Vec<f32>,
    },
    /// The module changed a parameter on its own (GUI, internal automation).
    ParamAutomated {
        index: usize,
        value: f32,
    },
    /// `None` when the command was refused.
    ProgramIndex(Option<usize>),
    /// `index: None` with an empty name when the command was refused.
    ProgramName {
        index: Option<usize>,
        name: String,
    },
    PresetRead(bool),
    PresetWritten(bool),
    TransportPosition(f64),
    VendorResult(isize),
    EditorRect(Option<Rect>),
    Latency(usize),
    Midi(MidiEvent),
    Sysex(Vec<u8>),
}

impl Reply {
    pub(crate) fn param_failed() -> Self {
        Reply::ParamValue {
            index: None,
            value: 0.0,
            display: String::new(),
        }
    }

    pub(crate) fn program_failed() -> Self {
        Reply::ProgramName {
            index: None,
            name: String::new(),
        }
    }
}

/// Where replies go. Called from the audio thread and from workers.
pub trait ReplySink: Send + Sync {
    fn send(&self, reply: Reply);
}

impl ReplySink for crossbeam::channel::Sender<Reply> {
    fn send(&self, reply: Reply) {
        if self.try_send(reply).is_err() {
            tracing::warn!("reply channel full or closed, reply dropped");
        }
    }
}

/// Discards every reply.
#[derive(Debug, Default)]
pub struct NullSink;

impl ReplySink for NullSink {
    fn send(&self, _reply: Reply) {}
}
