//! Per-block processing state and pass-through rendering.
//!
//! The state is recomputed at the top of every block from what the session
//! knows right then; nothing about it is sticky. Every state except the two
//! `Active` ones renders pass-through: inputs copied 1:1 onto outputs up to the
//! smaller channel count, remaining outputs zeroed, and the same again for
//! the auxiliary busses.

use consort_core::{BypassMode, Precision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    NoPlugin,
    /// A worker holds the module (preset swap, reset) or the try-lock failed.
    Suspended,
    ActiveSingle,
    ActiveDouble,
    BypassHard,
    /// The module keeps running internally; its output is discarded.
    BypassSoft,
}

/// What the state is derived from.
#[derive(Debug, Clone, Copy)]
pub struct StateInputs {
    pub loaded: bool,
    pub suspended: bool,
    pub bypass: BypassMode,
    pub precision: Precision,
    pub precision_supported: bool,
}

impl ProcessState {
    pub fn evaluate(inputs: StateInputs) -> Self {
        if !inputs.loaded {
            return ProcessState::NoPlugin;
        }
        if inputs.suspended {
            return ProcessState::Suspended;
        }
        match inputs.bypass {
            BypassMode::Hard => return ProcessState::BypassHard,
            BypassMode::Soft => return ProcessState::BypassSoft,
            BypassMode::Off => {}
        }
        if !inputs.precision_supported {
            return ProcessState::BypassHard;
        }
        match inputs.precision {
            Precision::Single => ProcessState::ActiveSingle,
            Precision::Double => ProcessState::ActiveDouble,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, ProcessState::ActiveSingle | ProcessState::ActiveDouble)
    }

    /// Whether the module's process entry point is called this block.
    pub fn runs_module(self) -> bool {
        self.is_active() || self == ProcessState::BypassSoft
    }
}

/// Copy inputs onto outputs channel by channel, then zero the rest.
pub fn pass_through<T: Copy + Default>(inputs: &[&[T]], outputs: &mut [&mut [T]], num_samples: usize) {
    let copied = inputs.len().min(outputs.len());
    for (input, output) in inputs.iter().zip(outputs.iter_mut()) {
        let n = num_samples.min(input.len()).min(output.len());
        let end = num_samples.min(output.len());
        output[..n].copy_from_slice(&input[..n]);
        output[n..end].fill(T::default());
    }
    zero_fill(outputs, copied, num_samples);
}

/// Zero output channels from `first` on.
pub fn zero_fill<T: Copy + Default>(outputs: &mut [&mut [T]], first: usize, num_samples: usize) {
    for output in outputs.iter_mut().skip(first) {
        let n = num_samples.min(output.len());
        output[..n].fill(T::default());
    }
}

/// Latch for warnings that would otherwise repeat every block.
#[derive(Debug, Default)]
pub struct WarnOnce(bool);

impl WarnOnce {
    /// True the first time only.
    pub fn first(&mut self) -> bool {
        !std::mem::replace(&mut self.0, true)
    }

    pub fn reset(&mut self) {
        self.0 = false;
    }
}
