//! Musical time information handed to modules each block.

/// Transport state as seen by a hosted module.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeInfo {
    pub sample_rate: f64,
    pub sample_position: f64,
    pub tempo: f64,
    pub time_sig_numerator: u32,
    pub time_sig_denominator: u32,
    /// Position in quarter notes.
    pub position_beats: f64,
    /// Start of the current bar in quarter notes.
    pub bar_start_beats: f64,
    pub playing: bool,
    /// Set on the first block after any transport change.
    pub changed: bool,
}

impl Default for TimeInfo {
    fn default() -> Self {
        Self {
            sample_rate: 44100.0,
            sample_position: 0.0,
            tempo: 120.0,
            time_sig_numerator: 4,
            time_sig_denominator: 4,
            position_beats: 0.0,
            bar_start_beats: 0.0,
            playing: false,
            changed: false,
        }
    }
}

impl TimeInfo {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            ..Default::default()
        }
    }

    pub fn set_tempo(&mut self, bpm: f64) {
        if bpm > 0.0 {
            self.tempo = bpm;
            self.changed = true;
        }
    }

    pub fn set_time_signature(&mut self, numerator: u32, denominator: u32) {
        if numerator > 0 && denominator > 0 {
            self.time_sig_numerator = numerator;
            self.time_sig_denominator = denominator;
            self.changed = true;
            self.update_bar_start();
        }
    }

    pub fn set_playing(&mut self, playing: bool) {
        if self.playing != playing {
            self.playing = playing;
            self.changed = true;
        }
    }

    pub fn set_position(&mut self, beats: f64) {
        self.position_beats = beats.max(0.0);
        self.sample_position = self.position_beats * 60.0 / self.tempo * self.sample_rate;
        self.changed = true;
        self.update_bar_start();
    }

    /// Quarter notes per bar for the current signature.
    pub fn bar_length_beats(&self) -> f64 {
        self.time_sig_numerator as f64 * 4.0 / self.time_sig_denominator as f64
    }

    /// Move forward by one block. Only advances while playing.
    pub fn advance(&mut self, num_samples: usize) {
        self.changed = false;
        if !self.playing {
            return;
        }
        let beats = num_samples as f64 / self.sample_rate * self.tempo / 60.0;
        self.position_beats += beats;
        self.sample_position += num_samples as f64;
        self.update_bar_start();
    }

    fn update_bar_start(&mut self) {
        let bar = self.bar_length_beats();
        if bar > 0.0 {
            self.bar_start_beats = (self.position_beats / bar).floor() * bar;
        }
    }
}
