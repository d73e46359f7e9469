use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{ConvertError, Result};

/// Shape of an interleaved PCM stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub is_float: bool,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16, bits_per_sample: u16, is_float: bool) -> Result<Self> {
        let fmt = Self {
            sample_rate,
            channels,
            bits_per_sample,
            is_float,
        };
        fmt.validate()?;
        Ok(fmt)
    }

    pub fn int(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
            is_float: false,
        }
    }

    pub fn float32(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 32,
            is_float: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.bits_per_sample, 8 | 16 | 24 | 32) {
            return Err(ConvertError::InvalidFormat(format!(
                "unsupported bit depth {}",
                self.bits_per_sample
            )));
        }
        if self.is_float && self.bits_per_sample != 32 {
            return Err(ConvertError::InvalidFormat(format!(
                "float samples must be 32-bit, got {}",
                self.bits_per_sample
            )));
        }
        if self.channels == 0 || self.sample_rate == 0 {
            return Err(ConvertError::InvalidFormat(format!(
                "{} channels at {} Hz",
                self.channels, self.sample_rate
            )));
        }
        Ok(())
    }

    /// Bytes per single-channel sample.
    #[inline]
    pub fn sample_size(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    /// Bytes per interleaved frame.
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.sample_size() * self.channels as usize
    }

}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}ch/{}bit{}",
            self.sample_rate,
            self.channels,
            self.bits_per_sample,
            if self.is_float { " float" } else { "" }
        )
    }
}

/// The user's output format choice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    KeepSource,
    Int8,
    Int16,
    Int24,
    Int32,
    Float32,
}

impl OutputFormat {
    /// Effective output format for a track. Never touches rate or channels.
    pub fn negotiate(&self, source: &PcmFormat) -> PcmFormat {
        let (bits, is_float) = match self {
            OutputFormat::KeepSource => (source.bits_per_sample, source.is_float),
            OutputFormat::Int8 => (8, false),
            OutputFormat::Int16 => (16, false),
            OutputFormat::Int24 => (24, false),
            OutputFormat::Int32 => (32, false),
            OutputFormat::Float32 => (32, true),
        };
        PcmFormat {
            bits_per_sample: bits,
            is_float,
            ..*source
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutputFormat::KeepSource => "keep",
            OutputFormat::Int8 => "8",
            OutputFormat::Int16 => "16",
            OutputFormat::Int24 => "24",
            OutputFormat::Int32 => "32",
            OutputFormat::Float32 => "float",
        };
        f.write_str(s)
    }
}

impl FromStr for OutputFormat {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "keep" | "source" | "keep-source" => Ok(OutputFormat::KeepSource),
            "8" => Ok(OutputFormat::Int8),
            "16" => Ok(OutputFormat::Int16),
            "24" => Ok(OutputFormat::Int24),
            "32" => Ok(OutputFormat::Int32),
            "float" | "32f" | "f32" => Ok(OutputFormat::Float32),
            other => Err(ConvertError::InvalidFormat(format!(
                "unknown output format `{other}`"
            ))),
        }
    }
}

/// Bit depths an encoder preset accepts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SupportedFormats(pub u32);

impl SupportedFormats {
    pub const INT8: u32 = 1 << 0;
    pub const INT16: u32 = 1 << 1;
    pub const INT24: u32 = 1 << 2;
    pub const INT32: u32 = 1 << 3;
    pub const FLOAT32: u32 = 1 << 4;
    pub const ALL: SupportedFormats = SupportedFormats(0x1f);

    fn flag_for(fmt: &PcmFormat) -> u32 {
        match (fmt.bits_per_sample, fmt.is_float) {
            (32, true) => Self::FLOAT32,
            (8, _) => Self::INT8,
            (16, _) => Self::INT16,
            (24, _) => Self::INT24,
            _ => Self::INT32,
        }
    }

    pub fn supports(&self, fmt: &PcmFormat) -> bool {
        self.0 & Self::flag_for(fmt) != 0
    }

    pub fn insert(&mut self, fmt: &PcmFormat) {
        self.0 |= Self::flag_for(fmt);
    }
}

/// How the external encoder receives the WAV stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationMethod {
    /// WAV bytes are written to the encoder's stdin.
    #[default]
    Pipe,
    /// WAV bytes go to a temp file, the encoder runs afterwards.
    TempFile,
}

impl InvocationMethod {
    pub fn code(&self) -> u32 {
        match self {
            InvocationMethod::Pipe => 0,
            InvocationMethod::TempFile => 1,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(InvocationMethod::Pipe),
            1 => Some(InvocationMethod::TempFile),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderPreset {
    pub title: String,
    /// Output file name template, see [`crate::format_title`].
    pub fname: String,
    /// Shell command; `%s` is replaced by the output path.
    pub encoder: String,
    pub method: InvocationMethod,
    pub formats: SupportedFormats,
}

/// A selected track, as the decoders see it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Track {
    pub path: PathBuf,
    pub decoder_id: String,
    pub start_sample: u64,
    pub end_sample: u64,
    /// Seconds.
    pub duration: f32,
    pub meta: BTreeMap<String, String>,
}

impl Track {
    pub fn new(path: impl Into<PathBuf>, decoder_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            decoder_id: decoder_id.into(),
            ..Default::default()
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }
}

/// Lifecycle of one conversion job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Opening,
    Decoding,
    Finalizing,
    Closed,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TrackOutcome {
    Converted {
        output_path: PathBuf,
        /// PCM bytes written after the header.
        data_bytes: u64,
        frames: u64,
        header: crate::io::wav::WavHeader,
    },
    Skipped {
        /// The stage that failed.
        stage: JobState,
        reason: String,
    },
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct TrackReport {
    pub index: usize,
    pub path: PathBuf,
    /// Terminal state: `Closed` for converted and cancelled tracks, `Failed`
    /// for skipped ones.
    pub state: JobState,
    pub outcome: TrackOutcome,
}

#[derive(Clone, Debug, Default)]
pub struct BatchReport {
    pub tracks: Vec<TrackReport>,
}

impl BatchReport {
    pub fn converted(&self) -> usize {
        self.tracks
            .iter()
            .filter(|t| matches!(t.outcome, TrackOutcome::Converted { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.tracks
            .iter()
            .filter(|t| matches!(t.outcome, TrackOutcome::Skipped { .. }))
            .count()
    }
}
