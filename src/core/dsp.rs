//! DSP plugins, stage instances and the ordered chains built from them.

use std::{fmt, sync::Arc};

use crate::error::{ConvertError, Result};

/// Title of the built-in chain with no stages.
pub const PASS_THROUGH: &str = "Pass through";

/// A DSP implementation, selected by its stable id.
pub trait DspPlugin: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn num_params(&self) -> usize {
        0
    }

    fn param_name(&self, _index: usize) -> &str {
        ""
    }

    fn default_param(&self, _index: usize) -> f32 {
        0.0
    }

    /// Creates a fresh instance with default parameters.
    fn open(&self) -> Box<dyn DspInstance>;
}

/// A stateful processing stage. Dropping it releases the stage.
pub trait DspInstance: Send {
    fn get_param(&self, _index: usize) -> f32 {
        0.0
    }

    fn set_param(&mut self, _index: usize, _value: f32) {}

    /// Processes `frames` interleaved frames of `buf` in place.
    ///
    /// May resize `buf`, and may change `sample_rate` / `channels` to describe
    /// its output. Returns the output frame count.
    fn process(
        &mut self,
        buf: &mut Vec<f32>,
        frames: usize,
        sample_rate: &mut u32,
        channels: &mut u16,
    ) -> Result<usize>;

    /// Emits whatever the stage still holds at end of stream into `buf`.
    /// `sample_rate` / `channels` arrive as the stage's last input format.
    fn flush(&mut self, buf: &mut Vec<f32>, sample_rate: &mut u32, channels: &mut u16) -> Result<usize> {
        let _ = (sample_rate, channels);
        buf.clear();
        Ok(0)
    }
}

/// One stage of a chain: an instance plus the plugin that made it.
pub struct DspStage {
    plugin: Arc<dyn DspPlugin>,
    instance: Box<dyn DspInstance>,
    input_format: Option<(u32, u16)>,
}

impl DspStage {
    pub fn new(plugin: Arc<dyn DspPlugin>) -> Self {
        let instance = plugin.open();
        Self {
            plugin,
            instance,
            input_format: None,
        }
    }

    pub fn id(&self) -> &str {
        self.plugin.id()
    }

    pub fn plugin(&self) -> &Arc<dyn DspPlugin> {
        &self.plugin
    }

    pub fn num_params(&self) -> usize {
        self.plugin.num_params()
    }

    pub fn get_param(&self, index: usize) -> f32 {
        self.instance.get_param(index)
    }

    pub fn set_param(&mut self, index: usize, value: f32) {
        if index < self.plugin.num_params() {
            self.instance.set_param(index, value);
        }
    }

    pub fn params(&self) -> Vec<f32> {
        (0..self.num_params()).map(|i| self.get_param(i)).collect()
    }

    fn process(&mut self, buf: &mut Vec<f32>, frames: usize, sr: &mut u32, ch: &mut u16) -> Result<usize> {
        self.input_format = Some((*sr, *ch));
        self.instance.process(buf, frames, sr, ch)
    }
}

impl fmt::Debug for DspStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DspStage")
            .field("id", &self.id())
            .field("params", &self.params())
            .finish()
    }
}

/// Frozen copy of a stage: which plugin, with which parameter values.
#[derive(Clone)]
pub struct StageSnapshot {
    pub plugin: Arc<dyn DspPlugin>,
    pub params: Vec<f32>,
}

impl fmt::Debug for StageSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSnapshot")
            .field("id", &self.plugin.id())
            .field("params", &self.params)
            .finish()
    }
}

/// Thread-shareable description of a chain. Instantiating it is the only way
/// a running job gets its own stages.
#[derive(Clone, Debug)]
pub struct ChainSnapshot {
    pub title: String,
    pub stages: Vec<StageSnapshot>,
}

impl ChainSnapshot {
    pub fn is_pass_through(&self) -> bool {
        self.stages.is_empty()
    }

    /// Opens a new instance per stage and copies every parameter across.
    pub fn instantiate(&self) -> DspPresetChain {
        let stages = self
            .stages
            .iter()
            .map(|s| {
                let mut stage = DspStage::new(Arc::clone(&s.plugin));
                for (i, v) in s.params.iter().enumerate() {
                    stage.set_param(i, *v);
                }
                stage
            })
            .collect();
        DspPresetChain {
            title: self.title.clone(),
            stages,
        }
    }
}

/// A titled, ordered DSP chain.
#[derive(Debug)]
pub struct DspPresetChain {
    pub title: String,
    stages: Vec<DspStage>,
}

impl DspPresetChain {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            stages: Vec::new(),
        }
    }

    pub fn pass_through() -> Self {
        Self::new(PASS_THROUGH)
    }

    pub fn is_pass_through(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[DspStage] {
        &self.stages
    }

    pub fn stage_mut(&mut self, index: usize) -> Option<&mut DspStage> {
        self.stages.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Appends a fresh instance of `plugin`, returning its index.
    pub fn add_stage(&mut self, plugin: Arc<dyn DspPlugin>) -> usize {
        self.stages.push(DspStage::new(plugin));
        self.stages.len() - 1
    }

    pub fn insert_stage(&mut self, index: usize, plugin: Arc<dyn DspPlugin>) {
        let index = index.min(self.stages.len());
        self.stages.insert(index, DspStage::new(plugin));
    }

    /// Removes and drops the stage at `index`.
    pub fn remove_stage(&mut self, index: usize) -> bool {
        if index >= self.stages.len() {
            return false;
        }
        self.stages.remove(index);
        true
    }

    pub fn move_stage(&mut self, from: usize, to: usize) -> bool {
        if from >= self.stages.len() || to >= self.stages.len() {
            return false;
        }
        let stage = self.stages.remove(from);
        self.stages.insert(to, stage);
        true
    }

    pub fn set_param(&mut self, stage: usize, index: usize, value: f32) -> Result<()> {
        let st = self
            .stages
            .get_mut(stage)
            .ok_or_else(|| ConvertError::Dsp {
                id: format!("#{stage}"),
                reason: "no such stage".into(),
            })?;
        if index >= st.num_params() {
            return Err(ConvertError::Dsp {
                id: st.id().to_string(),
                reason: format!("no parameter {index}"),
            });
        }
        st.set_param(index, value);
        Ok(())
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            title: self.title.clone(),
            stages: self
                .stages
                .iter()
                .map(|s| StageSnapshot {
                    plugin: Arc::clone(s.plugin()),
                    params: s.params(),
                })
                .collect(),
        }
    }

    /// Chain copy: same plugins and parameters, fresh stage state.
    pub fn duplicate(&self) -> Self {
        self.snapshot().instantiate()
    }

    /// Runs every stage over one buffer, strictly in order.
    pub fn process(
        &mut self,
        buf: &mut Vec<f32>,
        frames: usize,
        sample_rate: &mut u32,
        channels: &mut u16,
    ) -> Result<usize> {
        let mut frames = frames;
        for stage in &mut self.stages {
            frames = stage.process(buf, frames, sample_rate, channels)?;
        }
        Ok(frames)
    }

    /// Drains stages that buffer input. Whatever stage `i` flushes passes
    /// through stages `i+1..` before landing in `out`.
    ///
    /// Returns the frame count in `out`, whose format is left in
    /// `sample_rate` / `channels`.
    pub fn flush(&mut self, out: &mut Vec<f32>, sample_rate: &mut u32, channels: &mut u16) -> Result<usize> {
        out.clear();
        let mut total = 0;
        let mut tail = Vec::new();
        for i in 0..self.stages.len() {
            let (head, rest) = self.stages.split_at_mut(i + 1);
            let stage = &mut head[i];
            let Some((mut sr, mut ch)) = stage.input_format else {
                continue;
            };
            let mut frames = stage.instance.flush(&mut tail, &mut sr, &mut ch)?;
            if frames == 0 {
                continue;
            }
            for next in rest.iter_mut() {
                frames = next.process(&mut tail, frames, &mut sr, &mut ch)?;
            }
            let n = (frames * ch as usize).min(tail.len());
            out.extend_from_slice(&tail[..n]);
            total += frames;
            *sample_rate = sr;
            *channels = ch;
        }
        Ok(total)
    }
}

/// The DSP plugins available for building chains.
#[derive(Clone, Default)]
pub struct DspRegistry {
    plugins: Vec<Arc<dyn DspPlugin>>,
}

impl DspRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled gain, mono and resample stages.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(Arc::new(crate::core::stages::GainPlugin));
        reg.register(Arc::new(crate::core::stages::MonoPlugin));
        reg.register(Arc::new(crate::core::stages::ResamplePlugin));
        reg
    }

    pub fn register(&mut self, plugin: Arc<dyn DspPlugin>) {
        self.plugins.retain(|p| p.id() != plugin.id());
        self.plugins.push(plugin);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn DspPlugin>> {
        self.plugins.iter().find(|p| p.id() == id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<Arc<dyn DspPlugin>> {
        self.get(id)
            .ok_or_else(|| ConvertError::DspPluginNotFound(id.to_string()))
    }

    pub fn plugins(&self) -> &[Arc<dyn DspPlugin>] {
        &self.plugins
    }
}
