//! Execution-context tags.
//!
//! Entry points that must only run on the audio thread take an [`RtToken`];
//! entry points that may block take nothing. The host engine mints the token
//! inside its audio callback and hands it down, so no code compares thread
//! identities to find out where it is running.

use std::marker::PhantomData;

/// Proof that the caller is the real-time audio thread.
///
/// Not `Send`: a token cannot be smuggled to a worker thread.
#[derive(Debug, Clone, Copy)]
pub struct RtToken {
    _not_send: PhantomData<*const ()>,
}

impl RtToken {
    /// Mint a token. Call this from the audio callback only.
    pub fn audio_thread() -> Self {
        Self {
            _not_send: PhantomData,
        }
    }
}

/// Sample precision the host renders with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Precision {
    #[default]
    Single,
    Double,
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precision::Single => write!(f, "single"),
            Precision::Double => write!(f, "double"),
        }
    }
}

/// Audio sample type a block can be rendered in.
pub trait Sample: Copy + Default + PartialEq + Send + Sync + 'static {
    const PRECISION: Precision;

    fn from_f32(v: f32) -> Self;

    fn to_f32(self) -> f32;
}

impl Sample for f32 {
    const PRECISION: Precision = Precision::Single;

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

impl Sample for f64 {
    const PRECISION: Precision = Precision::Double;

    #[inline]
    fn from_f32(v: f32) -> Self {
        v as f64
    }

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }
}
