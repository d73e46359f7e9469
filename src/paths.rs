use crate::error::{ConvertError, Result};
use directories::ProjectDirs;
use std::{env, path::PathBuf};

pub const CONFIG_DIR_ENV: &str = "TRACK_CONVERTER_CONFIG_DIR";

pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = env::var(CONFIG_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let proj = ProjectDirs::from("dev", "TrackConverter", "track-converter")
        .ok_or(ConvertError::ConfigDirUnavailable)?;
    Ok(PathBuf::from(proj.config_dir()))
}

pub fn presets_dir() -> Result<PathBuf> {
    let mut p = config_dir()?;
    p.push("presets");
    Ok(p)
}

pub fn settings_path() -> Result<PathBuf> {
    let mut p = config_dir()?;
    p.push("converter.json");
    Ok(p)
}
