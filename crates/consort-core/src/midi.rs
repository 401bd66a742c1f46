//! MIDI values passed between host, session and module.

use smallvec::SmallVec;

const MIDI_STACK_CAPACITY: usize = 64;

/// Short MIDI message with sample offset and optional detune.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiEvent {
    pub frame_offset: usize,
    pub data: [u8; 3],
    /// Fine tuning in cents (honoured by modules that support it).
    pub detune: f32,
}

impl MidiEvent {
    pub fn new(status: u8, data1: u8, data2: u8) -> Self {
        Self {
            frame_offset: 0,
            data: [status, data1 & 0x7F, data2 & 0x7F],
            detune: 0.0,
        }
    }

    pub fn with_detune(mut self, cents: f32) -> Self {
        self.detune = cents;
        self
    }

    pub fn at(mut self, frame_offset: usize) -> Self {
        self.frame_offset = frame_offset;
        self
    }

    pub fn status(&self) -> u8 {
        self.data[0]
    }

    pub fn channel(&self) -> u8 {
        self.data[0] & 0x0F
    }
}

pub type MidiEventVec = SmallVec<[MidiEvent; MIDI_STACK_CAPACITY]>;

/// System exclusive message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysexEvent {
    pub frame_offset: usize,
    pub data: Vec<u8>,
}

impl SysexEvent {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            frame_offset: 0,
            data: data.into(),
        }
    }
}
