#![cfg(unix)]

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use approx::assert_abs_diff_eq;
use tempfile::tempdir;
use track_converter_core::{
    BatchRequest, CancelToken, ConvertError, Converter, ConverterConfig, Decoder, DecoderPlugin,
    DecoderRegistry, DspInstance, DspPlugin, DspPresetChain, EncoderPreset, InvocationMethod,
    JobState, OutputFormat, PcmFormat, Result, SupportedFormats, Track, TrackOutcome, WavHeader,
};

// --- in-memory 16-bit source ---

fn sample_at(pos: u64, ch: u16) -> i16 {
    ((pos * 37 + ch as u64 * 11) % 2000) as i16 - 1000
}

struct MemPlugin {
    fmt: PcmFormat,
}

impl DecoderPlugin for MemPlugin {
    fn id(&self) -> &str {
        "mem"
    }

    fn open(&self) -> Box<dyn Decoder> {
        Box::new(MemDecoder {
            fmt: self.fmt,
            left: 0,
            pos: 0,
        })
    }
}

struct MemDecoder {
    fmt: PcmFormat,
    left: u64,
    pos: u64,
}

impl Decoder for MemDecoder {
    fn init(&mut self, track: &Track) -> Result<PcmFormat> {
        self.left = track.end_sample - track.start_sample;
        Ok(self.fmt)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let frames = ((buf.len() / self.fmt.frame_size()) as u64).min(self.left);
        let mut n = 0;
        for _ in 0..frames {
            for c in 0..self.fmt.channels {
                buf[n..n + 2].copy_from_slice(&sample_at(self.pos, c).to_le_bytes());
                n += 2;
            }
            self.pos += 1;
        }
        self.left -= frames;
        Ok(n)
    }
}

/// Claims a zero-channel stream.
struct ZeroChannelPlugin;

impl DecoderPlugin for ZeroChannelPlugin {
    fn id(&self) -> &str {
        "zero"
    }

    fn open(&self) -> Box<dyn Decoder> {
        Box::new(ZeroChannelDecoder)
    }
}

struct ZeroChannelDecoder;

impl Decoder for ZeroChannelDecoder {
    fn init(&mut self, _track: &Track) -> Result<PcmFormat> {
        Ok(PcmFormat::int(44100, 0, 16))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(buf.len())
    }
}

// --- test stages ---

/// Keeps the first half of every block.
struct Halve;

impl DspPlugin for Halve {
    fn id(&self) -> &str {
        "halve"
    }

    fn name(&self) -> &str {
        "Halve"
    }

    fn open(&self) -> Box<dyn DspInstance> {
        Box::new(HalveInstance)
    }
}

struct HalveInstance;

impl DspInstance for HalveInstance {
    fn process(&mut self, buf: &mut Vec<f32>, frames: usize, _sr: &mut u32, ch: &mut u16) -> Result<usize> {
        let keep = frames / 2;
        buf.truncate(keep * *ch as usize);
        Ok(keep)
    }
}

/// Reports 22050 Hz from the second block on.
struct RateSwitch;

impl DspPlugin for RateSwitch {
    fn id(&self) -> &str {
        "switch"
    }

    fn name(&self) -> &str {
        "Rate switch"
    }

    fn open(&self) -> Box<dyn DspInstance> {
        Box::new(RateSwitchInstance { calls: 0 })
    }
}

struct RateSwitchInstance {
    calls: usize,
}

impl DspInstance for RateSwitchInstance {
    fn process(&mut self, _buf: &mut Vec<f32>, frames: usize, sr: &mut u32, _ch: &mut u16) -> Result<usize> {
        if self.calls > 0 {
            *sr = 22050;
        }
        self.calls += 1;
        Ok(frames)
    }
}

/// Cancels the batch the first time it sees audio.
struct Canceller(CancelToken);

impl DspPlugin for Canceller {
    fn id(&self) -> &str {
        "cancel"
    }

    fn name(&self) -> &str {
        "Cancel"
    }

    fn open(&self) -> Box<dyn DspInstance> {
        Box::new(CancellerInstance(self.0.clone()))
    }
}

struct CancellerInstance(CancelToken);

impl DspInstance for CancellerInstance {
    fn process(&mut self, _buf: &mut Vec<f32>, frames: usize, _sr: &mut u32, _ch: &mut u16) -> Result<usize> {
        self.0.cancel();
        Ok(frames)
    }
}

/// Fails on the second block.
struct FailSecond;

impl DspPlugin for FailSecond {
    fn id(&self) -> &str {
        "fail"
    }

    fn name(&self) -> &str {
        "Fail"
    }

    fn open(&self) -> Box<dyn DspInstance> {
        Box::new(FailSecondInstance { calls: 0 })
    }
}

struct FailSecondInstance {
    calls: usize,
}

impl DspInstance for FailSecondInstance {
    fn process(&mut self, _buf: &mut Vec<f32>, frames: usize, _sr: &mut u32, _ch: &mut u16) -> Result<usize> {
        self.calls += 1;
        if self.calls > 1 {
            return Err(ConvertError::Dsp {
                id: "fail".into(),
                reason: "second block".into(),
            });
        }
        Ok(frames)
    }
}

// --- helpers ---

const CAT: &str = "cat > '%s'";
const COPY: &str = "cp \"$TRACK_CONVERTER_INPUT\" '%s'";

fn converter(config: ConverterConfig) -> Converter {
    let mut reg = DecoderRegistry::new();
    reg.register(Arc::new(MemPlugin {
        fmt: PcmFormat::int(44100, 2, 16),
    }));
    Converter::new(reg, config)
}

fn config(tmp: &Path) -> ConverterConfig {
    ConverterConfig {
        shell: "sh".into(),
        shell_arg: "-c".into(),
        temp_dir: tmp.to_path_buf(),
        ..ConverterConfig::default()
    }
}

fn track(name: &str, frames: u64) -> Track {
    let mut t = Track::new(name, "mem");
    t.end_sample = frames;
    t.duration = frames as f32 / 44100.0;
    t
}

fn preset(method: InvocationMethod, command: &str) -> Arc<EncoderPreset> {
    Arc::new(EncoderPreset {
        title: "test".into(),
        fname: "%F.wav".into(),
        encoder: command.into(),
        method,
        formats: SupportedFormats::ALL,
    })
}

fn chain_of(plugin: Arc<dyn DspPlugin>) -> track_converter_core::ChainSnapshot {
    let mut chain = DspPresetChain::new("test chain");
    chain.add_stage(plugin);
    chain.snapshot()
}

fn converted(outcome: &TrackOutcome) -> (PathBuf, u64, u64, WavHeader) {
    match outcome {
        TrackOutcome::Converted {
            output_path,
            data_bytes,
            frames,
            header,
        } => (output_path.clone(), *data_bytes, *frames, *header),
        other => panic!("expected a converted track, got {:?}", other),
    }
}

fn dir_is_empty(dir: &Path) -> bool {
    fs::read_dir(dir).unwrap().next().is_none()
}

// --- tests ---

#[test]
fn pipe_pass_through_writes_header_and_data() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let req = BatchRequest::new(preset(InvocationMethod::Pipe, CAT), out.path());

    let report = converter(config(tmp.path()))
        .convert_batch(&[track("song.flac", 10000)], &req, &CancelToken::new())
        .unwrap();
    assert_eq!(report.converted(), 1);

    let (path, data_bytes, frames, header) = converted(&report.tracks[0].outcome);
    assert_eq!(path, out.path().join("song.wav"));
    assert_eq!(data_bytes, 40000);
    assert_eq!(frames, 10000);
    assert_eq!(header.data_size, 40000);

    let bytes = fs::read(&path).unwrap();
    assert_eq!(bytes.len(), 44 + 40000);
    assert_eq!(u32::from_le_bytes(bytes[40..44].try_into().unwrap()), 40000);

    let mut reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.spec().sample_rate, 44100);
    assert_eq!(reader.spec().channels, 2);
    let samples: Vec<i16> = reader.samples::<i16>().take(6).map(|s| s.unwrap()).collect();
    let expected: Vec<i16> = (0..3).flat_map(|p| [sample_at(p, 0), sample_at(p, 1)]).collect();
    assert_eq!(samples, expected);
}

#[test]
fn temp_file_method_runs_encoder_after_staging() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let req = BatchRequest::new(preset(InvocationMethod::TempFile, COPY), out.path());

    let report = converter(config(tmp.path()))
        .convert_batch(&[track("song.flac", 10000)], &req, &CancelToken::new())
        .unwrap();

    let (path, data_bytes, _, _) = converted(&report.tracks[0].outcome);
    assert_eq!(data_bytes, 40000);
    assert_eq!(fs::metadata(&path).unwrap().len(), 44 + 40000);
    assert!(dir_is_empty(tmp.path()), "temp file left behind");
}

#[test]
fn explicit_depth_converts_samples() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let req = BatchRequest::new(preset(InvocationMethod::Pipe, CAT), out.path())
        .with_format(OutputFormat::Int24);

    let report = converter(config(tmp.path()))
        .convert_batch(&[track("deep.flac", 1000)], &req, &CancelToken::new())
        .unwrap();
    let (path, data_bytes, _, header) = converted(&report.tracks[0].outcome);
    assert_eq!(data_bytes, 1000 * 2 * 3);
    assert_eq!(header.bits_per_sample, 24);
    assert_eq!(header.data_size, 6000);

    let mut reader = hound::WavReader::open(&path).unwrap();
    let first: Vec<i32> = reader.samples::<i32>().take(2).map(|s| s.unwrap()).collect();
    assert_eq!(first, vec![(sample_at(0, 0) as i32) << 8, (sample_at(0, 1) as i32) << 8]);
}

#[test]
fn float_output_through_dsp_path() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let reg = track_converter_core::DspRegistry::with_defaults();
    let req = BatchRequest::new(preset(InvocationMethod::Pipe, CAT), out.path())
        .with_dsp(chain_of(reg.require("gain").unwrap()))
        .with_format(OutputFormat::Float32);

    let report = converter(config(tmp.path()))
        .convert_batch(&[track("f.flac", 500)], &req, &CancelToken::new())
        .unwrap();
    let (path, data_bytes, _, header) = converted(&report.tracks[0].outcome);
    assert!(header.is_float);
    assert_eq!(data_bytes, 500 * 2 * 4);

    let mut reader = hound::WavReader::open(&path).unwrap();
    let s: Vec<f32> = reader.samples::<f32>().take(2).map(|s| s.unwrap()).collect();
    assert_abs_diff_eq!(s[0], sample_at(0, 0) as f32 / 32768.0, epsilon = 1e-6);
    assert_abs_diff_eq!(s[1], sample_at(0, 1) as f32 / 32768.0, epsilon = 1e-6);
}

#[test]
fn halving_stage_halves_data() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let req = BatchRequest::new(preset(InvocationMethod::Pipe, CAT), out.path())
        .with_dsp(chain_of(Arc::new(Halve)));

    let report = converter(config(tmp.path()))
        .convert_batch(&[track("half.flac", 10000)], &req, &CancelToken::new())
        .unwrap();
    let (path, data_bytes, frames, header) = converted(&report.tracks[0].outcome);
    assert_eq!(data_bytes, 20000);
    assert_eq!(frames, 5000);
    // the estimate is never corrected
    assert_eq!(header.data_size, 40000);
    assert_eq!(fs::metadata(&path).unwrap().len(), 44 + 20000);
}

#[test]
fn header_follows_first_block_format() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.block_frames = 1000;
    let req = BatchRequest::new(preset(InvocationMethod::Pipe, CAT), out.path())
        .with_dsp(chain_of(Arc::new(RateSwitch)));

    let report = converter(cfg)
        .convert_batch(&[track("drift.flac", 10000)], &req, &CancelToken::new())
        .unwrap();
    let (path, data_bytes, _, header) = converted(&report.tracks[0].outcome);
    assert_eq!(header.sample_rate, 44100);
    assert_eq!(data_bytes, 40000);

    let bytes = fs::read(&path).unwrap();
    assert_eq!(WavHeader::parse(&bytes).unwrap().sample_rate, 44100);
}

#[test]
fn resampled_header_estimate_is_scaled() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let reg = track_converter_core::DspRegistry::with_defaults();
    let mut chain = DspPresetChain::new("22k");
    let i = chain.add_stage(reg.require("resample").unwrap());
    chain.set_param(i, 0, 22050.0).unwrap();
    let req = BatchRequest::new(preset(InvocationMethod::Pipe, CAT), out.path())
        .with_dsp(chain.snapshot());

    let report = converter(config(tmp.path()))
        .convert_batch(&[track("rs.flac", 44100)], &req, &CancelToken::new())
        .unwrap();
    let (_, data_bytes, frames, header) = converted(&report.tracks[0].outcome);
    assert_eq!(header.sample_rate, 22050);
    assert_eq!(header.data_size, 22050 * 4);
    assert_eq!(frames, 22050);
    assert_eq!(data_bytes, 22050 * 4);
}

#[test]
fn failed_track_does_not_stop_the_batch() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let req = BatchRequest::new(preset(InvocationMethod::Pipe, CAT), out.path());
    let mut bad = track("b.flac", 100);
    bad.decoder_id = "missing".into();

    let report = converter(config(tmp.path()))
        .convert_batch(&[track("a.flac", 100), bad, track("c.flac", 100)], &req, &CancelToken::new())
        .unwrap();
    assert_eq!(report.converted(), 2);
    assert_eq!(report.skipped(), 1);
    assert!(matches!(
        report.tracks[1].outcome,
        TrackOutcome::Skipped { stage: JobState::Opening, .. }
    ));
    let states: Vec<JobState> = report.tracks.iter().map(|t| t.state).collect();
    assert_eq!(states, [JobState::Closed, JobState::Failed, JobState::Closed]);
    assert!(out.path().join("a.wav").is_file());
    assert!(!out.path().join("b.wav").exists());
    assert!(out.path().join("c.wav").is_file());
}

#[test]
fn temp_file_spawn_failure_skips_cleanly() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.shell = "/nonexistent/track-converter-shell".into();
    let req = BatchRequest::new(preset(InvocationMethod::TempFile, COPY), out.path());

    let report = converter(cfg)
        .convert_batch(&[track("a.flac", 100), track("b.flac", 100)], &req, &CancelToken::new())
        .unwrap();
    assert_eq!(report.tracks.len(), 2);
    for t in &report.tracks {
        assert!(matches!(
            t.outcome,
            TrackOutcome::Skipped { stage: JobState::Finalizing, .. }
        ));
    }
    assert!(!out.path().join("a.wav").exists());
    assert!(dir_is_empty(tmp.path()), "temp file left behind");
}

#[test]
fn pipe_spawn_failure_skips_at_opening() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.shell = "/nonexistent/track-converter-shell".into();
    let req = BatchRequest::new(preset(InvocationMethod::Pipe, CAT), out.path());

    let report = converter(cfg)
        .convert_batch(&[track("a.flac", 100)], &req, &CancelToken::new())
        .unwrap();
    match &report.tracks[0].outcome {
        TrackOutcome::Skipped { stage, reason } => {
            assert_eq!(*stage, JobState::Opening);
            assert!(reason.contains("spawn"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn failing_encoder_is_reported() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let req = BatchRequest::new(preset(InvocationMethod::TempFile, "exit 3"), out.path());

    let report = converter(config(tmp.path()))
        .convert_batch(&[track("a.flac", 100)], &req, &CancelToken::new())
        .unwrap();
    assert!(matches!(
        report.tracks[0].outcome,
        TrackOutcome::Skipped { stage: JobState::Finalizing, .. }
    ));
    assert!(dir_is_empty(tmp.path()));
}

#[test]
fn zero_length_track_still_gets_a_header() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let req = BatchRequest::new(preset(InvocationMethod::Pipe, CAT), out.path());

    let report = converter(config(tmp.path()))
        .convert_batch(&[track("empty.flac", 0)], &req, &CancelToken::new())
        .unwrap();
    let (path, data_bytes, _, header) = converted(&report.tracks[0].outcome);
    assert_eq!(data_bytes, 0);
    assert_eq!(header.data_size, 0);
    assert_eq!(fs::metadata(path).unwrap().len(), 44);
}

#[test]
fn cancelled_batch_converts_nothing() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let req = BatchRequest::new(preset(InvocationMethod::Pipe, CAT), out.path());
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = converter(config(tmp.path()))
        .convert_batch(&[track("a.flac", 100), track("b.flac", 100)], &req, &cancel)
        .unwrap();
    assert!(report
        .tracks
        .iter()
        .all(|t| t.outcome == TrackOutcome::Cancelled));
    assert!(!out.path().join("a.wav").exists());
}

#[test]
fn cancelling_mid_track_stops_between_blocks() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.block_frames = 100;
    let cancel = CancelToken::new();
    let req = BatchRequest::new(preset(InvocationMethod::TempFile, COPY), out.path())
        .with_dsp(chain_of(Arc::new(Canceller(cancel.clone()))));

    let report = converter(cfg)
        .convert_batch(&[track("a.flac", 1000), track("b.flac", 1000)], &req, &cancel)
        .unwrap();
    assert_eq!(report.tracks[0].outcome, TrackOutcome::Cancelled);
    assert_eq!(report.tracks[1].outcome, TrackOutcome::Cancelled);
    assert!(!out.path().join("a.wav").exists());
    assert!(dir_is_empty(tmp.path()));
}

#[test]
fn strict_formats_reject_unlisted_depth() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let mut only24 = (*preset(InvocationMethod::Pipe, CAT)).clone();
    only24.formats = SupportedFormats(SupportedFormats::INT24);
    let req = BatchRequest::new(Arc::new(only24), out.path()).with_format(OutputFormat::Int16);

    let mut cfg = config(tmp.path());
    cfg.strict_formats = true;
    let err = converter(cfg)
        .convert_batch(&[track("a.flac", 100)], &req, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, ConvertError::UnsupportedFormat { .. }));

    let report = converter(config(tmp.path()))
        .convert_batch(&[track("a.flac", 100)], &req, &CancelToken::new())
        .unwrap();
    assert_eq!(report.converted(), 1);
}

#[test]
fn unusable_output_dir_is_an_error() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let file = out.path().join("file");
    fs::write(&file, b"x").unwrap();
    let req = BatchRequest::new(preset(InvocationMethod::Pipe, CAT), file.join("sub"));

    let err = converter(config(tmp.path()))
        .convert_batch(&[track("a.flac", 100)], &req, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, ConvertError::OutputDir { .. }));
}

#[test]
fn parallel_jobs_keep_selection_order() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.jobs = 3;
    cfg.block_frames = 512;
    let req = BatchRequest::new(preset(InvocationMethod::Pipe, CAT), out.path())
        .with_dsp(chain_of(Arc::new(Halve)));

    let tracks: Vec<Track> = (0..6).map(|i| track(&format!("t{i}.flac"), 4096)).collect();
    let report = converter(cfg)
        .convert_batch(&tracks, &req, &CancelToken::new())
        .unwrap();
    assert_eq!(report.converted(), 6);
    for (i, t) in report.tracks.iter().enumerate() {
        assert_eq!(t.index, i);
        let (path, data_bytes, _, _) = converted(&t.outcome);
        assert_eq!(path, out.path().join(format!("t{i}.wav")));
        assert_eq!(data_bytes, 4096 / 2 * 4);
    }
}

#[test]
fn decoder_with_invalid_format_is_skipped_at_opening() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let mut reg = DecoderRegistry::new();
    reg.register(Arc::new(MemPlugin {
        fmt: PcmFormat::int(44100, 2, 16),
    }));
    reg.register(Arc::new(ZeroChannelPlugin));
    let req = BatchRequest::new(preset(InvocationMethod::Pipe, CAT), out.path());
    let mut broken = track("broken.flac", 100);
    broken.decoder_id = "zero".into();

    let report = Converter::new(reg, config(tmp.path()))
        .convert_batch(&[broken, track("fine.flac", 100)], &req, &CancelToken::new())
        .unwrap();
    match &report.tracks[0].outcome {
        TrackOutcome::Skipped { stage, reason } => {
            assert_eq!(*stage, JobState::Opening);
            assert!(reason.contains("0 channels"), "{reason}");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(report.tracks[0].state, JobState::Failed);
    assert!(!out.path().join("broken.wav").exists());
    assert_eq!(report.converted(), 1);
}

#[test]
fn cancelling_a_pipe_job_removes_the_partial_output() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.block_frames = 100;
    let cancel = CancelToken::new();
    let req = BatchRequest::new(preset(InvocationMethod::Pipe, CAT), out.path())
        .with_dsp(chain_of(Arc::new(Canceller(cancel.clone()))));

    let report = converter(cfg)
        .convert_batch(&[track("a.flac", 1000)], &req, &cancel)
        .unwrap();
    assert_eq!(report.tracks[0].outcome, TrackOutcome::Cancelled);
    assert!(!out.path().join("a.wav").exists());
}

#[test]
fn pipe_job_failing_mid_stream_leaves_no_output() {
    let out = tempdir().unwrap();
    let tmp = tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.block_frames = 100;
    let req = BatchRequest::new(preset(InvocationMethod::Pipe, CAT), out.path())
        .with_dsp(chain_of(Arc::new(FailSecond)));

    let report = converter(cfg)
        .convert_batch(&[track("a.flac", 1000)], &req, &CancelToken::new())
        .unwrap();
    assert!(matches!(
        report.tracks[0].outcome,
        TrackOutcome::Skipped { stage: JobState::Decoding, .. }
    ));
    assert!(!out.path().join("a.wav").exists());
}
