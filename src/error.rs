use std::{io, path::PathBuf};

use thiserror::Error;

/// Central error type for the track-converter-core crate.
#[derive(Debug, Error)]
pub enum ConvertError {
    // Generic fallback (wraps anyhow)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),

    // Domain-specific variants
    #[error("Invalid PCM format: {0}")]
    InvalidFormat(String),

    #[error("No decoder registered for id `{0}`")]
    DecoderNotFound(String),

    #[error("Decoder failed to initialize {path}: {reason}")]
    DecoderInit { path: PathBuf, reason: String },

    #[error("DSP plugin `{0}` not found")]
    DspPluginNotFound(String),

    #[error("DSP stage `{id}` failed: {reason}")]
    Dsp { id: String, reason: String },

    #[error("Failed to spawn encoder `{command}`: {source}")]
    EncoderSpawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Encoder `{command}` exited with {status}")]
    EncoderFailed { command: String, status: String },

    #[error("Output format {format} is not supported by encoder preset `{preset}`")]
    UnsupportedFormat { preset: String, format: String },

    #[error("Output directory {path:?} is not writable: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Preset `{title}` already exists")]
    PresetExists { title: String },

    #[error("Failed to write preset {path:?}: {source}")]
    PresetWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed preset {path:?}: {reason}")]
    PresetParse { path: PathBuf, reason: String },

    #[error("Preset index {0} is out of range")]
    PresetIndex(usize),

    #[error("The pass-through DSP preset cannot be modified")]
    PassThroughImmutable,

    #[error("Config dir not available")]
    ConfigDirUnavailable,
}

// --- Implement From conversions for common errors ---
impl From<io::Error> for ConvertError {
    fn from(e: io::Error) -> Self {
        ConvertError::Anyhow(e.into())
    }
}

impl From<serde_json::Error> for ConvertError {
    fn from(e: serde_json::Error) -> Self {
        ConvertError::Anyhow(e.into())
    }
}

impl From<hound::Error> for ConvertError {
    fn from(e: hound::Error) -> Self {
        ConvertError::Anyhow(e.into())
    }
}

impl From<symphonia::core::errors::Error> for ConvertError {
    fn from(e: symphonia::core::errors::Error) -> Self {
        ConvertError::Anyhow(e.into())
    }
}

impl ConvertError {
    /// True for the "preset already exists" save failure, as opposed to a
    /// path or write problem.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ConvertError::PresetExists { .. })
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;
