//! Error types shared by every consort crate.
//!
//! Host-facing failures are always carried as a [`HostError`] with a
//! human-readable message. Raw OS error codes never leak to the host.

use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of a [`HostError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The module itself is bad: wrong architecture, load failure, missing entry point.
    Module,
    /// The operating system or a subprocess failed.
    System,
    /// A probe subprocess terminated abnormally.
    Crash,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Module => "module",
            ErrorKind::System => "system",
            ErrorKind::Crash => "crash",
            ErrorKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "module" => ErrorKind::Module,
            "system" => ErrorKind::System,
            "crash" => ErrorKind::Crash,
            _ => ErrorKind::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Module => write!(f, "module error"),
            ErrorKind::System => write!(f, "system error"),
            ErrorKind::Crash => write!(f, "crash"),
            ErrorKind::Unknown => write!(f, "unknown error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Scanning,
    Validating,
    Opening,
    Factory,
    Instantiation,
    Setup,
}

impl std::fmt::Display for LoadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadStage::Scanning => write!(f, "scanning"),
            LoadStage::Validating => write!(f, "validating binary"),
            LoadStage::Opening => write!(f, "opening library"),
            LoadStage::Factory => write!(f, "getting factory"),
            LoadStage::Instantiation => write!(f, "creating instance"),
            LoadStage::Setup => write!(f, "setting up audio"),
        }
    }
}

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Wrong architecture: {path} is {found}, host is {expected}")]
    WrongArchitecture {
        path: PathBuf,
        found: String,
        expected: String,
    },

    #[error("Plugin load failed at {stage} stage: {path}\n  Reason: {reason}")]
    LoadFailed {
        path: PathBuf,
        stage: LoadStage,
        reason: String,
    },

    #[error("Missing entry point in {path}: {symbol}")]
    MissingEntryPoint { path: PathBuf, symbol: String },

    #[error("Module contains no plugins: {0}")]
    NoPlugins(PathBuf),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Probe process crashed while probing {path} ({status})")]
    Crashed { path: PathBuf, status: String },

    #[error("Subprocess error: {0}")]
    Subprocess(String),

    #[error("Timeout after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    /// The host lacks support for something the module needs (no ABI adapter).
    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("No plugin loaded")]
    NotLoaded,

    #[error("Cache error at line {line}: {reason}")]
    Cache { line: usize, reason: String },

    #[error("Preset error: {0}")]
    Preset(String),

    #[error("Editor error: {0}")]
    Editor(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by a probe subprocess, with the classification it chose.
    #[error("{message}")]
    Reported { kind: ErrorKind, message: String },

    #[error("{0}")]
    Other(String),
}

impl HostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HostError::WrongArchitecture { .. }
            | HostError::LoadFailed { .. }
            | HostError::MissingEntryPoint { .. }
            | HostError::NoPlugins(_) => ErrorKind::Module,
            HostError::Crashed { .. } => ErrorKind::Crash,
            HostError::Subprocess(_)
            | HostError::Timeout { .. }
            | HostError::Io(_)
            | HostError::Unsupported(_) => ErrorKind::System,
            HostError::Reported { kind, .. } => *kind,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn load_failed(path: impl Into<PathBuf>, stage: LoadStage, reason: impl Into<String>) -> Self {
        HostError::LoadFailed {
            path: path.into(),
            stage,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
