//! # track-converter-core
//!
//! Converts audio tracks into files produced by an external encoder:
//! decode, run an optional DSP chain, reformat the PCM, prepend a WAV header
//! and hand the stream to the encoder through a pipe or a temp file.

pub mod audio;
pub mod config;
pub mod core;
pub mod decoder;
pub mod error;
pub mod io;
pub mod paths;
pub mod pcm;
pub mod presets;
pub mod title;
pub mod types;

pub use crate::{
    audio::probe_track,
    config::{ConverterConfig, ConverterSettings},
    core::{
        dsp::{ChainSnapshot, DspInstance, DspPlugin, DspPresetChain, DspRegistry, DspStage},
        engine::{BatchRequest, CancelToken, Converter},
    },
    decoder::{Decoder, DecoderPlugin, DecoderRegistry},
    error::{ConvertError, Result},
    io::progress::{clear_convert_progress_callback, set_convert_progress_callback, ConvertProgress},
    io::wav::WavHeader,
    pcm::pcm_convert,
    presets::PresetStore,
    title::format_title,
    types::{
        BatchReport, EncoderPreset, InvocationMethod, JobState, OutputFormat, PcmFormat,
        SupportedFormats, Track, TrackOutcome, TrackReport,
    },
};
