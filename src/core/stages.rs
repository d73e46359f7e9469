//! Bundled DSP stages.

use rubato::{InterpolationParameters, InterpolationType, Resampler as _, SincFixedIn, WindowFunction};
use tracing::warn;

use crate::{
    core::dsp::{DspInstance, DspPlugin},
    error::{ConvertError, Result},
};

// --- gain ---

pub struct GainPlugin;

impl DspPlugin for GainPlugin {
    fn id(&self) -> &str {
        "gain"
    }

    fn name(&self) -> &str {
        "Gain"
    }

    fn num_params(&self) -> usize {
        1
    }

    fn param_name(&self, _index: usize) -> &str {
        "gain_db"
    }

    fn open(&self) -> Box<dyn DspInstance> {
        Box::new(Gain { db: 0.0 })
    }
}

struct Gain {
    db: f32,
}

impl DspInstance for Gain {
    fn get_param(&self, _index: usize) -> f32 {
        self.db
    }

    fn set_param(&mut self, _index: usize, value: f32) {
        self.db = value;
    }

    fn process(&mut self, buf: &mut Vec<f32>, frames: usize, _sr: &mut u32, ch: &mut u16) -> Result<usize> {
        let factor = 10f32.powf(self.db / 20.0);
        let n = (frames * *ch as usize).min(buf.len());
        for s in &mut buf[..n] {
            *s *= factor;
        }
        Ok(frames)
    }
}

// --- mono downmix ---

pub struct MonoPlugin;

impl DspPlugin for MonoPlugin {
    fn id(&self) -> &str {
        "mono"
    }

    fn name(&self) -> &str {
        "Mono downmix"
    }

    fn open(&self) -> Box<dyn DspInstance> {
        Box::new(Mono)
    }
}

struct Mono;

impl DspInstance for Mono {
    fn process(&mut self, buf: &mut Vec<f32>, frames: usize, _sr: &mut u32, ch: &mut u16) -> Result<usize> {
        let channels = *ch as usize;
        if channels > 1 {
            for f in 0..frames {
                let avg = buf[f * channels..(f + 1) * channels].iter().sum::<f32>() / channels as f32;
                buf[f] = avg;
            }
            buf.truncate(frames);
            *ch = 1;
        }
        Ok(frames)
    }
}

// --- sample rate conversion ---

const RESAMPLE_CHUNK: usize = 1024;
const DEFAULT_TARGET_RATE: f32 = 48000.0;

pub struct ResamplePlugin;

impl DspPlugin for ResamplePlugin {
    fn id(&self) -> &str {
        "resample"
    }

    fn name(&self) -> &str {
        "Resampler"
    }

    fn num_params(&self) -> usize {
        1
    }

    fn param_name(&self, _index: usize) -> &str {
        "samplerate"
    }

    fn default_param(&self, _index: usize) -> f32 {
        DEFAULT_TARGET_RATE
    }

    fn open(&self) -> Box<dyn DspInstance> {
        Box::new(Resample {
            target: DEFAULT_TARGET_RATE as u32,
            state: None,
        })
    }
}

struct Resample {
    target: u32,
    state: Option<ResampleState>,
}

/// Holds the sinc history and the input not yet consumed by a full chunk.
struct ResampleState {
    from: u32,
    to: u32,
    channels: usize,
    inner: SincFixedIn<f32>,
    pending: Vec<Vec<f32>>,
    frames_in: u64,
    frames_out: u64,
}

fn dsp_error(e: impl std::fmt::Display) -> ConvertError {
    ConvertError::Dsp {
        id: "resample".into(),
        reason: e.to_string(),
    }
}

impl ResampleState {
    fn new(from: u32, to: u32, channels: usize) -> Result<Self> {
        let ratio = to as f64 / from as f64;
        let params = InterpolationParameters {
            sinc_len: 256,
            f_cutoff: if ratio < 1.0 { 0.90 } else { 0.95 },
            interpolation: InterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let inner = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, channels)
            .map_err(dsp_error)?;
        Ok(Self {
            from,
            to,
            channels,
            inner,
            pending: vec![Vec::with_capacity(RESAMPLE_CHUNK * 2); channels],
            frames_in: 0,
            frames_out: 0,
        })
    }

    /// Resamples one full chunk from `pending` and appends up to `limit`
    /// interleaved frames to `out`.
    fn run_chunk(&mut self, out: &mut Vec<f32>, limit: usize) -> Result<usize> {
        let need = self.inner.input_frames_next();
        for ch in &mut self.pending {
            if ch.len() < need {
                ch.resize(need, 0.0);
            }
        }
        let chunk: Vec<Vec<f32>> = self
            .pending
            .iter_mut()
            .map(|ch| ch.drain(..need).collect())
            .collect();
        let waves = self.inner.process(&chunk, None).map_err(dsp_error)?;

        let produced = waves.first().map_or(0, |w| w.len()).min(limit);
        for i in 0..produced {
            for wave in &waves {
                out.push(wave[i]);
            }
        }
        self.frames_out += produced as u64;
        Ok(produced)
    }
}

impl DspInstance for Resample {
    fn get_param(&self, _index: usize) -> f32 {
        self.target as f32
    }

    fn set_param(&mut self, _index: usize, value: f32) {
        self.target = value.max(0.0) as u32;
        self.state = None;
    }

    fn process(&mut self, buf: &mut Vec<f32>, frames: usize, sr: &mut u32, ch: &mut u16) -> Result<usize> {
        if self.target == 0 || self.target == *sr || *ch == 0 {
            return Ok(frames);
        }
        let channels = *ch as usize;
        let st = match self.state.take() {
            Some(st) if st.from == *sr && st.channels == channels && st.to == self.target => {
                self.state.insert(st)
            }
            old => {
                let dropped = old.as_ref().and_then(|o| o.pending.first()).map_or(0, Vec::len);
                if dropped > 0 {
                    warn!(
                        "input changed to {} Hz/{} ch mid-stream, dropping {} buffered frames",
                        sr, channels, dropped
                    );
                }
                self.state.insert(ResampleState::new(*sr, self.target, channels)?)
            }
        };

        let n = (frames * channels).min(buf.len());
        for frame in buf[..n].chunks_exact(channels) {
            for (c, s) in frame.iter().enumerate() {
                st.pending[c].push(*s);
            }
        }
        st.frames_in += (n / channels) as u64;

        buf.clear();
        let mut produced = 0;
        while st.pending[0].len() >= st.inner.input_frames_next() {
            produced += st.run_chunk(buf, usize::MAX)?;
        }

        *sr = self.target;
        Ok(produced)
    }

    fn flush(&mut self, buf: &mut Vec<f32>, sr: &mut u32, ch: &mut u16) -> Result<usize> {
        buf.clear();
        let Some(st) = self.state.as_mut() else {
            return Ok(0);
        };
        let expected = (st.frames_in as f64 * st.to as f64 / st.from as f64).round() as u64;
        let mut produced = 0;
        // The sinc delay means a few zero-padded chunks may be needed.
        let mut rounds = 0;
        while st.frames_out < expected && rounds < 16 {
            let limit = (expected - st.frames_out) as usize;
            produced += st.run_chunk(buf, limit)?;
            rounds += 1;
        }
        *sr = st.to;
        *ch = st.channels as u16;
        Ok(produced)
    }
}
