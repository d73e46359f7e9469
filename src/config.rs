use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{error::Result, types::OutputFormat};

pub const TMP_DIR_ENV: &str = "TRACK_CONVERTER_TMP_DIR";
pub const SHELL_ENV: &str = "TRACK_CONVERTER_SHELL";

/// Frames read from the decoder per block.
pub const DEFAULT_BLOCK_FRAMES: usize = 10250;

/// Engine knobs. Not persisted; built from defaults and environment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Program used to run encoder command lines.
    pub shell: String,
    pub shell_arg: String,
    /// Where TempFile-method WAVs are staged.
    pub temp_dir: PathBuf,
    pub block_frames: usize,
    /// Tracks converted in parallel. 1 keeps the batch on the calling thread.
    pub jobs: usize,
    /// Reject output formats the encoder preset does not list.
    pub strict_formats: bool,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        let (shell, shell_arg) = if cfg!(windows) {
            ("cmd".to_string(), "/C".to_string())
        } else {
            ("sh".to_string(), "-c".to_string())
        };
        Self {
            shell: env::var(SHELL_ENV).unwrap_or(shell),
            shell_arg,
            temp_dir: env::var(TMP_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir()),
            block_frames: DEFAULT_BLOCK_FRAMES,
            jobs: 1,
            strict_formats: false,
        }
    }
}

/// Last-used converter choices, persisted between runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterSettings {
    pub output_folder: String,
    pub encoder_preset: usize,
    pub dsp_preset: usize,
    pub output_format: OutputFormat,
}

impl ConverterSettings {
    /// Missing or unreadable settings fall back to defaults.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("ignoring malformed settings {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
