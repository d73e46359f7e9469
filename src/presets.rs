//! Encoder and DSP presets, stored one flat text file per preset under
//! `<presets>/encoders` and `<presets>/dsp`.

use std::{
    fmt::Write as _,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, warn};

use crate::{
    core::dsp::{ChainSnapshot, DspPresetChain, DspRegistry},
    error::{ConvertError, Result},
    paths,
    types::{EncoderPreset, InvocationMethod, SupportedFormats},
};

pub const ENCODERS_DIR: &str = "encoders";
pub const DSP_DIR: &str = "dsp";
const EXT: &str = "txt";

// --- text format ---

fn field<'a>(line: Option<&'a str>, key: &str) -> std::result::Result<&'a str, String> {
    let line = line.ok_or_else(|| format!("missing `{key}` line"))?;
    let value = line
        .strip_prefix(key)
        .and_then(|rest| rest.strip_prefix(' '))
        .ok_or_else(|| format!("expected `{key}`, found `{line}`"))?;
    if value.is_empty() {
        return Err(format!("empty `{key}`"));
    }
    Ok(value)
}

pub fn parse_encoder_preset(text: &str) -> std::result::Result<EncoderPreset, String> {
    let mut lines = text.lines();
    let title = field(lines.next(), "title")?.to_string();
    let fname = field(lines.next(), "fname")?.to_string();
    let encoder = field(lines.next(), "encoder")?.to_string();

    let method = field(lines.next(), "method")?;
    let method = method
        .trim()
        .parse::<u32>()
        .ok()
        .and_then(InvocationMethod::from_code)
        .ok_or_else(|| format!("bad method `{method}`"))?;

    let formats = field(lines.next(), "formats")?;
    let formats = u32::from_str_radix(formats.trim(), 16)
        .map_err(|e| format!("bad formats `{formats}`: {e}"))?;

    Ok(EncoderPreset {
        title,
        fname,
        encoder,
        method,
        formats: SupportedFormats(formats),
    })
}

pub fn encoder_preset_to_string(p: &EncoderPreset) -> String {
    format!(
        "title {}\nfname {}\nencoder {}\nmethod {}\nformats {:08X}\n",
        p.title,
        p.fname,
        p.encoder,
        p.method.code(),
        p.formats.0
    )
}

/// Parses a DSP preset. Any plugin id missing from `registry` rejects the
/// whole preset.
pub fn parse_dsp_preset(
    text: &str,
    registry: &DspRegistry,
) -> std::result::Result<DspPresetChain, String> {
    let mut lines = text.lines();
    let title = field(lines.next(), "title")?;
    let mut chain = DspPresetChain::new(title);

    while let Some(line) = lines.next() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let id = match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            [id, "{"] => id.to_string(),
            _ => return Err(format!("expected `<plugin> {{`, found `{line}`")),
        };
        let plugin = registry
            .get(&id)
            .ok_or_else(|| format!("plugin `{id}` not found"))?;
        let stage = chain.add_stage(plugin);

        let mut n = 0;
        loop {
            let line = lines
                .next()
                .ok_or_else(|| format!("unexpected end of file in `{id}` parameters"))?
                .trim();
            if line == "}" {
                break;
            }
            let value: f32 = line
                .parse()
                .map_err(|_| format!("bad parameter {n} of `{id}`: `{line}`"))?;
            if let Some(st) = chain.stage_mut(stage) {
                st.set_param(n, value);
            }
            n += 1;
        }
    }
    Ok(chain)
}

pub fn dsp_preset_to_string(chain: &DspPresetChain) -> String {
    let mut out = format!("title {}\n", chain.title);
    for stage in chain.stages() {
        let _ = writeln!(out, "{} {{", stage.id());
        for v in stage.params() {
            let _ = writeln!(out, "\t{v:.6}");
        }
        out.push_str("}\n");
    }
    out
}

// --- files ---

fn parse_err(path: &Path, reason: String) -> ConvertError {
    ConvertError::PresetParse {
        path: path.to_path_buf(),
        reason,
    }
}

pub fn load_encoder_preset(path: &Path) -> Result<EncoderPreset> {
    let text = fs::read_to_string(path)?;
    parse_encoder_preset(&text).map_err(|r| parse_err(path, r))
}

pub fn load_dsp_preset(path: &Path, registry: &DspRegistry) -> Result<DspPresetChain> {
    let text = fs::read_to_string(path)?;
    parse_dsp_preset(&text, registry).map_err(|r| parse_err(path, r))
}

fn preset_path(dir: &Path, title: &str) -> Result<PathBuf> {
    if title.is_empty() || title.contains(['/', '\\']) || title == "." || title == ".." {
        return Err(ConvertError::PresetWrite {
            path: dir.join(title),
            source: io::Error::new(io::ErrorKind::InvalidInput, "title is not a valid file name"),
        });
    }
    Ok(dir.join(format!("{title}.{EXT}")))
}

fn write_preset(dir: &Path, title: &str, contents: &str, overwrite: bool) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|source| ConvertError::PresetWrite {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = preset_path(dir, title)?;
    if !overwrite && path.exists() {
        return Err(ConvertError::PresetExists {
            title: title.to_string(),
        });
    }
    fs::write(&path, contents).map_err(|source| ConvertError::PresetWrite {
        path: path.clone(),
        source,
    })?;
    debug!("saved preset {}", path.display());
    Ok(path)
}

/// Saves into `dir`, creating it. Without `overwrite` an existing preset of
/// the same title fails with [`ConvertError::PresetExists`].
pub fn save_encoder_preset(dir: &Path, p: &EncoderPreset, overwrite: bool) -> Result<PathBuf> {
    write_preset(dir, &p.title, &encoder_preset_to_string(p), overwrite)
}

pub fn save_dsp_preset(dir: &Path, chain: &DspPresetChain, overwrite: bool) -> Result<PathBuf> {
    write_preset(dir, &chain.title, &dsp_preset_to_string(chain), overwrite)
}

fn delete_preset(dir: &Path, title: &str) -> Result<()> {
    let path = preset_path(dir, title)?;
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// `.txt` files in `dir` (any case), sorted by file name.
fn preset_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case(EXT))
        })
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    files
}

// --- store ---

/// All presets on disk plus the built-in pass-through chain at DSP index 0.
pub struct PresetStore {
    root: PathBuf,
    registry: DspRegistry,
    encoders: Vec<EncoderPreset>,
    dsp: Vec<DspPresetChain>,
}

impl PresetStore {
    /// Loads every preset below `root`. Malformed files are skipped.
    pub fn load(root: impl Into<PathBuf>, registry: DspRegistry) -> Self {
        let root = root.into();
        let mut store = Self {
            root,
            registry,
            encoders: Vec::new(),
            dsp: vec![DspPresetChain::pass_through()],
        };

        for path in preset_files(&store.encoders_dir()) {
            match load_encoder_preset(&path) {
                Ok(p) => store.encoders.push(p),
                Err(e) => warn!("skipping encoder preset {}: {}", path.display(), e),
            }
        }
        for path in preset_files(&store.dsp_dir()) {
            match load_dsp_preset(&path, &store.registry) {
                Ok(c) => store.dsp.push(c),
                Err(e) => warn!("skipping DSP preset {}: {}", path.display(), e),
            }
        }
        debug!(
            "loaded {} encoder and {} DSP presets from {}",
            store.encoders.len(),
            store.dsp.len() - 1,
            store.root.display()
        );
        store
    }

    /// Presets from the user's config directory.
    pub fn load_default(registry: DspRegistry) -> Result<Self> {
        Ok(Self::load(paths::presets_dir()?, registry))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn encoders_dir(&self) -> PathBuf {
        self.root.join(ENCODERS_DIR)
    }

    pub fn dsp_dir(&self) -> PathBuf {
        self.root.join(DSP_DIR)
    }

    pub fn registry(&self) -> &DspRegistry {
        &self.registry
    }

    pub fn encoders(&self) -> &[EncoderPreset] {
        &self.encoders
    }

    pub fn dsp_presets(&self) -> &[DspPresetChain] {
        &self.dsp
    }

    pub fn find_encoder(&self, title: &str) -> Option<usize> {
        self.encoders.iter().position(|p| p.title == title)
    }

    pub fn find_dsp(&self, title: &str) -> Option<usize> {
        self.dsp.iter().position(|c| c.title == title)
    }

    /// Saves and appends `p`. With `overwrite` an existing preset of the
    /// same title is replaced in place.
    pub fn add_encoder(&mut self, p: EncoderPreset, overwrite: bool) -> Result<usize> {
        save_encoder_preset(&self.encoders_dir(), &p, overwrite)?;
        match self.find_encoder(&p.title) {
            Some(i) => {
                self.encoders[i] = p;
                Ok(i)
            }
            None => {
                self.encoders.push(p);
                Ok(self.encoders.len() - 1)
            }
        }
    }

    /// Replaces the preset at `index`. A changed title must not clash with
    /// another preset, and the old file is removed.
    pub fn update_encoder(&mut self, index: usize, p: EncoderPreset) -> Result<()> {
        let old_title = self
            .encoders
            .get(index)
            .map(|o| o.title.clone())
            .ok_or(ConvertError::PresetIndex(index))?;
        let renamed = old_title != p.title;
        save_encoder_preset(&self.encoders_dir(), &p, !renamed)?;
        if renamed {
            delete_preset(&self.encoders_dir(), &old_title)?;
        }
        self.encoders[index] = p;
        Ok(())
    }

    pub fn remove_encoder(&mut self, index: usize) -> Result<EncoderPreset> {
        let title = self
            .encoders
            .get(index)
            .map(|p| p.title.clone())
            .ok_or(ConvertError::PresetIndex(index))?;
        delete_preset(&self.encoders_dir(), &title)?;
        Ok(self.encoders.remove(index))
    }

    pub fn add_dsp(&mut self, chain: DspPresetChain, overwrite: bool) -> Result<usize> {
        if chain.title == self.dsp[0].title {
            return Err(ConvertError::PassThroughImmutable);
        }
        save_dsp_preset(&self.dsp_dir(), &chain, overwrite)?;
        match self.find_dsp(&chain.title) {
            Some(i) => {
                self.dsp[i] = chain;
                Ok(i)
            }
            None => {
                self.dsp.push(chain);
                Ok(self.dsp.len() - 1)
            }
        }
    }

    pub fn update_dsp(&mut self, index: usize, chain: DspPresetChain) -> Result<()> {
        if index == 0 {
            return Err(ConvertError::PassThroughImmutable);
        }
        let old_title = self
            .dsp
            .get(index)
            .map(|c| c.title.clone())
            .ok_or(ConvertError::PresetIndex(index))?;
        let renamed = old_title != chain.title;
        save_dsp_preset(&self.dsp_dir(), &chain, !renamed)?;
        if renamed {
            delete_preset(&self.dsp_dir(), &old_title)?;
        }
        self.dsp[index] = chain;
        Ok(())
    }

    pub fn remove_dsp(&mut self, index: usize) -> Result<DspPresetChain> {
        if index == 0 {
            return Err(ConvertError::PassThroughImmutable);
        }
        let title = self
            .dsp
            .get(index)
            .map(|c| c.title.clone())
            .ok_or(ConvertError::PresetIndex(index))?;
        delete_preset(&self.dsp_dir(), &title)?;
        Ok(self.dsp.remove(index))
    }

    /// Frozen copy of an encoder preset for a batch.
    pub fn encoder_snapshot(&self, index: usize) -> Result<Arc<EncoderPreset>> {
        self.encoders
            .get(index)
            .cloned()
            .map(Arc::new)
            .ok_or(ConvertError::PresetIndex(index))
    }

    /// Frozen copy of a DSP chain for a batch.
    pub fn dsp_snapshot(&self, index: usize) -> Result<ChainSnapshot> {
        self.dsp
            .get(index)
            .map(DspPresetChain::snapshot)
            .ok_or(ConvertError::PresetIndex(index))
    }
}
