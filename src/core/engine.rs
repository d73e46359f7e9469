use crate::{
    config::ConverterConfig,
    core::dsp::{ChainSnapshot, DspPresetChain},
    decoder::{Decoder, DecoderRegistry},
    error::{ConvertError, Result},
    io::{
        encoder::EncoderSink,
        progress::{emit_convert_progress, ConvertProgress},
        wav::{estimate_data_size, WavHeader},
    },
    pcm::{decode_f32, encode_f32, pcm_convert},
    title::output_path,
    types::{
        BatchReport, EncoderPreset, InvocationMethod, JobState, OutputFormat, PcmFormat, Track, TrackOutcome,
        TrackReport,
    },
};

use anyhow::anyhow;
use rayon::prelude::*;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info, info_span, warn};

/// Shared flag for stopping a running batch. Checked between tracks and
/// between blocks.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a batch needs, frozen at batch start.
#[derive(Clone, Debug)]
pub struct BatchRequest {
    pub encoder: Arc<EncoderPreset>,
    /// `None` and the pass-through chain both mean no DSP.
    pub dsp: Option<ChainSnapshot>,
    pub output_format: OutputFormat,
    pub output_dir: PathBuf,
}

impl BatchRequest {
    pub fn new(encoder: Arc<EncoderPreset>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            encoder,
            dsp: None,
            output_format: OutputFormat::KeepSource,
            output_dir: output_dir.into(),
        }
    }

    pub fn with_dsp(mut self, chain: ChainSnapshot) -> Self {
        self.dsp = Some(chain);
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }
}

/// Runs conversion batches against a decoder registry.
pub struct Converter {
    decoders: DecoderRegistry,
    config: ConverterConfig,
}

/// One selected track on its way through the pipeline. Dropping it releases
/// the decoder, the chain's stages and the encoder sink.
struct ConversionJob<'a> {
    index: usize,
    track: &'a Track,
    decoder: Box<dyn Decoder>,
    source: PcmFormat,
    target: PcmFormat,
    chain: Option<DspPresetChain>,
    output_path: PathBuf,
    sink: EncoderSink,
    header: Option<WavHeader>,
    data_bytes: u64,
    frames: u64,
}

impl Converter {
    pub fn new(decoders: DecoderRegistry, config: ConverterConfig) -> Self {
        Self { decoders, config }
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    pub fn decoders(&self) -> &DecoderRegistry {
        &self.decoders
    }

    /// Converts `tracks` in selection order.
    ///
    /// Per-track failures are reported in the returned [`BatchReport`]; only
    /// batch-wide problems (output directory, strict format check, thread
    /// pool) come back as `Err`.
    pub fn convert_batch(
        &self,
        tracks: &[Track],
        req: &BatchRequest,
        cancel: &CancelToken,
    ) -> Result<BatchReport> {
        prepare_output_dir(&req.output_dir)?;

        if req.output_format != OutputFormat::KeepSource {
            // Rate and channels do not matter for the bitset.
            let probe = req.output_format.negotiate(&PcmFormat::int(44100, 2, 16));
            self.check_format(&req.encoder, &probe)?;
        }

        let total = tracks.len();
        info!(
            "converting {} track(s) with `{}` into {}",
            total,
            req.encoder.title,
            req.output_dir.display()
        );

        let reports: Vec<TrackReport> = if self.config.jobs > 1 && total > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.jobs)
                .build()
                .map_err(|e| anyhow!("failed to build conversion pool: {e}"))?;
            pool.install(|| {
                tracks
                    .par_iter()
                    .enumerate()
                    .map(|(i, t)| self.run_track(i, total, t, req, cancel))
                    .collect()
            })
        } else {
            tracks
                .iter()
                .enumerate()
                .map(|(i, t)| self.run_track(i, total, t, req, cancel))
                .collect()
        };

        let report = BatchReport { tracks: reports };
        emit_convert_progress(ConvertProgress::Finished {
            converted: report.converted(),
            total,
        });
        info!("batch done: {}/{} converted", report.converted(), total);
        Ok(report)
    }

    fn check_format(&self, preset: &EncoderPreset, fmt: &PcmFormat) -> Result<()> {
        if preset.formats.supports(fmt) {
            return Ok(());
        }
        if self.config.strict_formats {
            return Err(ConvertError::UnsupportedFormat {
                preset: preset.title.clone(),
                format: fmt.to_string(),
            });
        }
        warn!(
            "encoder preset `{}` does not list {}; converting anyway",
            preset.title, fmt
        );
        Ok(())
    }

    fn run_track(
        &self,
        index: usize,
        total: usize,
        track: &Track,
        req: &BatchRequest,
        cancel: &CancelToken,
    ) -> TrackReport {
        let _span = info_span!("track", index).entered();
        let report = |state, outcome| TrackReport {
            index,
            path: track.path.clone(),
            state,
            outcome,
        };

        if cancel.is_cancelled() {
            debug!("cancelled before {}", track.path.display());
            return report(JobState::Closed, TrackOutcome::Cancelled);
        }

        emit_convert_progress(ConvertProgress::TrackStarted {
            index,
            total,
            path: track.path.clone(),
        });
        info!("converting {}", track.path.display());

        let mut state = JobState::Opening;
        let outcome = match self.run_job(index, track, req, cancel, &mut state) {
            Ok(outcome) => {
                state = JobState::Closed;
                outcome
            }
            Err(e) => {
                error!("skipping {} ({:?}): {}", track.path.display(), state, e);
                let stage = std::mem::replace(&mut state, JobState::Failed);
                TrackOutcome::Skipped {
                    stage,
                    reason: e.to_string(),
                }
            }
        };

        emit_convert_progress(ConvertProgress::TrackFinished {
            index,
            converted: matches!(outcome, TrackOutcome::Converted { .. }),
        });
        report(state, outcome)
    }

    /// Opening → Decoding → Finalizing → Closed. On error `state` holds the
    /// stage that failed; the caller moves the job on to `Failed`.
    fn run_job(
        &self,
        index: usize,
        track: &Track,
        req: &BatchRequest,
        cancel: &CancelToken,
        state: &mut JobState,
    ) -> Result<TrackOutcome> {
        let mut job = self.open_job(index, track, req)?;
        let method = req.encoder.method;

        *state = JobState::Decoding;
        debug!("{:?}: {} -> {}", state, job.source, job.target);
        match self.decode_all(&mut job, cancel) {
            Ok(true) => {}
            Ok(false) => {
                info!("cancelled {}", track.path.display());
                job.discard(method);
                return Ok(TrackOutcome::Cancelled);
            }
            Err(e) => {
                job.discard(method);
                return Err(e);
            }
        }

        *state = JobState::Finalizing;
        debug!("{:?}: {} bytes written", state, job.data_bytes);
        let ConversionJob {
            sink,
            output_path,
            header,
            data_bytes,
            frames,
            target,
            ..
        } = job;
        if let Err(e) = sink.finish() {
            if method == InvocationMethod::Pipe {
                remove_partial_output(&output_path);
            }
            return Err(e);
        }

        *state = JobState::Closed;
        let header = header.unwrap_or_else(|| WavHeader::new(&target, 0));
        info!("wrote {}", output_path.display());
        Ok(TrackOutcome::Converted {
            output_path,
            data_bytes,
            frames,
            header,
        })
    }

    fn open_job<'a>(
        &self,
        index: usize,
        track: &'a Track,
        req: &BatchRequest,
    ) -> Result<ConversionJob<'a>> {
        let plugin = self
            .decoders
            .get(&track.decoder_id)
            .ok_or_else(|| ConvertError::DecoderNotFound(track.decoder_id.clone()))?;
        let mut decoder = plugin.open();
        let source = decoder
            .init(track)
            .and_then(|fmt| fmt.validate().map(|()| fmt))
            .map_err(|e| match e {
                e @ ConvertError::DecoderInit { .. } => e,
                other => ConvertError::DecoderInit {
                    path: track.path.clone(),
                    reason: other.to_string(),
                },
            })?;

        let target = req.output_format.negotiate(&source);
        if req.output_format == OutputFormat::KeepSource {
            self.check_format(&req.encoder, &target)?;
        }

        let chain = req
            .dsp
            .as_ref()
            .filter(|c| !c.is_pass_through())
            .map(ChainSnapshot::instantiate);

        let output_path = output_path(&req.output_dir, &req.encoder.fname, track, index);
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let sink = EncoderSink::open(
            req.encoder.method,
            &req.encoder.encoder,
            &output_path,
            &self.config,
        )?;

        Ok(ConversionJob {
            index,
            track,
            decoder,
            source,
            target,
            chain,
            output_path,
            sink,
            header: None,
            data_bytes: 0,
            frames: 0,
        })
    }

    /// Streams the whole track into the sink. Returns `false` if cancelled.
    fn decode_all(&self, job: &mut ConversionJob<'_>, cancel: &CancelToken) -> Result<bool> {
        let frame = job.source.frame_size();
        let block_bytes = self.config.block_frames.max(1) * frame;
        let mut input = vec![0u8; block_bytes];
        let mut floats: Vec<f32> = Vec::new();
        let mut out: Vec<u8> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            let n = match job.decoder.read(&mut input) {
                Ok(n) => n,
                Err(e) => {
                    warn!("read error in {}, ending track: {}", job.track.path.display(), e);
                    0
                }
            };
            let eos = n < block_bytes;
            let whole = n / frame * frame;
            if whole > 0 || (eos && job.header.is_none()) {
                let fmt = process_block(
                    &input[..whole],
                    &job.source,
                    &job.target,
                    job.chain.as_mut(),
                    &mut floats,
                    &mut out,
                )?;
                job.write_block(&fmt, &out)?;
            }
            if eos {
                break;
            }
        }

        if let Some(chain) = job.chain.as_mut() {
            let mut sr = job.source.sample_rate;
            let mut ch = job.source.channels;
            let frames = chain.flush(&mut floats, &mut sr, &mut ch)?;
            if frames > 0 {
                let fmt = PcmFormat::new(sr, ch, job.target.bits_per_sample, job.target.is_float)?;
                encode_f32(&floats, &fmt, &mut out);
                debug!("chain flushed {} frames", frames);
                job.write_block(&fmt, &out)?;
            }
        }
        Ok(true)
    }
}

impl ConversionJob<'_> {
    /// Releases the job without finishing the encoder. A Pipe encoder has
    /// been writing to the real output path, so its partial file goes too.
    fn discard(self, method: InvocationMethod) {
        let Self { sink, output_path, .. } = self;
        // reaps the encoder before the file is touched
        drop(sink);
        if method == InvocationMethod::Pipe {
            remove_partial_output(&output_path);
        }
    }

    /// Writes one converted block, preceded by the header on the first call.
    fn write_block(&mut self, fmt: &PcmFormat, bytes: &[u8]) -> Result<()> {
        if self.header.is_none() {
            let span = self.track.end_sample.saturating_sub(self.track.start_sample);
            let size = estimate_data_size(span, self.track.duration, self.source.sample_rate, fmt);
            let header = WavHeader::new(fmt, size);
            debug!("header for {}: {} data bytes declared", fmt, size);
            header.write_to(&mut self.sink)?;
            self.header = Some(header);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        self.sink.write_all(bytes)?;
        self.data_bytes += bytes.len() as u64;
        self.frames += (bytes.len() / fmt.frame_size()) as u64;
        emit_convert_progress(ConvertProgress::BlockWritten {
            index: self.index,
            bytes: self.data_bytes,
        });
        Ok(())
    }
}

/// Turns one block of source PCM into target PCM in `out`, returning the
/// format `out` is in.
fn process_block(
    input: &[u8],
    source: &PcmFormat,
    target: &PcmFormat,
    chain: Option<&mut DspPresetChain>,
    floats: &mut Vec<f32>,
    out: &mut Vec<u8>,
) -> Result<PcmFormat> {
    match chain {
        Some(chain) => {
            let frames = decode_f32(source, input, floats);
            let mut sr = source.sample_rate;
            let mut ch = source.channels;
            let frames = chain.process(floats, frames, &mut sr, &mut ch)?;
            let fmt = PcmFormat::new(sr, ch, target.bits_per_sample, target.is_float)?;
            let n = (frames * ch as usize).min(floats.len());
            encode_f32(&floats[..n], &fmt, out);
            Ok(fmt)
        }
        None if source != target => {
            pcm_convert(source, input, target, out);
            Ok(*target)
        }
        None => {
            out.clear();
            out.extend_from_slice(input);
            Ok(*source)
        }
    }
}

fn remove_partial_output(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("could not remove partial output {}: {}", path.display(), e),
    }
}

fn prepare_output_dir(dir: &Path) -> Result<()> {
    let to_err = |source| ConvertError::OutputDir {
        path: dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(to_err)?;
    // A directory can exist and still refuse new files.
    tempfile::Builder::new()
        .prefix(".track-converter-probe")
        .tempfile_in(dir)
        .map_err(to_err)?;
    Ok(())
}
