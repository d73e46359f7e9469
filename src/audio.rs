use std::{
    fs::File,
    io::BufReader,
    path::Path,
};

use anyhow::Context;
use hound::{SampleFormat, WavReader};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder as CodecDecoder, DecoderOptions},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader},
    io::MediaSourceStream,
    meta::{MetadataOptions, MetadataRevision, StandardTagKey},
    probe::Hint,
};
use symphonia::default::{get_codecs, get_probe};
use tracing::{debug, warn};

use crate::{
    decoder::{Decoder, DecoderPlugin, DecoderRegistry},
    error::{ConvertError, Result},
    types::{PcmFormat, Track},
};

/// Builds a [`Track`] for `path`: picks a decoder by extension and reads
/// length and tags.
pub fn probe_track<P: AsRef<Path>>(path: P, registry: &DecoderRegistry) -> Result<Track> {
    let path: &Path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let plugin = registry
        .for_extension(&ext)
        .ok_or_else(|| ConvertError::DecoderNotFound(ext.clone()))?;

    let (mut format, mut track) = open_format(path)?;
    track.decoder_id = plugin.id().to_string();

    if let Some(rev) = format.metadata().current() {
        collect_tags(rev, &mut track);
    }

    debug!(
        "probed {}: decoder={}, frames={}, duration={:.2}s",
        path.display(),
        track.decoder_id,
        track.end_sample,
        track.duration
    );
    Ok(track)
}

fn open_format(path: &Path) -> Result<(Box<dyn FormatReader>, Track)> {
    let file: File =
        File::open(path).with_context(|| format!("Failed to open audio file: {:?}", path))?;
    let mss: MediaSourceStream = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint: Hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mut probed = get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut track = Track::new(path, "");
    if let Some(md) = probed.metadata.get() {
        if let Some(rev) = md.current() {
            collect_tags(rev, &mut track);
        }
    }

    let format = probed.format;
    let params = &format.default_track().context("No default track found")?.codec_params;
    let frames = params.n_frames.unwrap_or(0);
    let rate = params.sample_rate.unwrap_or(0);
    track.end_sample = frames;
    if rate > 0 {
        track.duration = frames as f32 / rate as f32;
    }
    Ok((format, track))
}

fn collect_tags(rev: &MetadataRevision, track: &mut Track) {
    for tag in rev.tags() {
        let key = match tag.std_key {
            Some(StandardTagKey::TrackTitle) => "title",
            Some(StandardTagKey::Artist) => "artist",
            Some(StandardTagKey::Album) => "album",
            Some(StandardTagKey::AlbumArtist) => "album artist",
            Some(StandardTagKey::TrackNumber) => "track",
            Some(StandardTagKey::TrackTotal) => "numtracks",
            Some(StandardTagKey::Date) => "year",
            Some(StandardTagKey::Genre) => "genre",
            Some(StandardTagKey::Comment) => "comment",
            Some(StandardTagKey::Composer) => "composer",
            Some(StandardTagKey::Copyright) => "copyright",
            _ => continue,
        };
        track.meta.insert(key.to_string(), tag.value.to_string());
    }
}

/// Frame budget implied by the track's sample markers.
fn span(track: &Track) -> Option<u64> {
    (track.end_sample > track.start_sample).then(|| track.end_sample - track.start_sample)
}

// --- hound-backed WAV decoder ---

pub struct WavDecoderPlugin;

impl DecoderPlugin for WavDecoderPlugin {
    fn id(&self) -> &str {
        "wav"
    }

    fn extensions(&self) -> &[&str] {
        &["wav", "wave"]
    }

    fn open(&self) -> Box<dyn Decoder> {
        Box::new(WavDecoder {
            reader: None,
            fmt: PcmFormat::int(44100, 2, 16),
            remaining: 0,
        })
    }
}

struct WavDecoder {
    reader: Option<WavReader<BufReader<File>>>,
    fmt: PcmFormat,
    remaining: u64,
}

impl Decoder for WavDecoder {
    fn init(&mut self, track: &Track) -> Result<PcmFormat> {
        let mut reader = WavReader::open(&track.path)?;
        let spec = reader.spec();
        let fmt = PcmFormat::new(
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample,
            spec.sample_format == SampleFormat::Float,
        )?;

        let total = reader.duration() as u64;
        let start = track.start_sample.min(total);
        if start > 0 {
            reader.seek(start as u32)?;
        }
        self.remaining = span(track).unwrap_or(total - start).min(total - start);
        self.fmt = fmt;
        self.reader = Some(reader);
        Ok(fmt)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(0);
        };
        let fmt = self.fmt;
        let frames = ((buf.len() / fmt.frame_size()) as u64).min(self.remaining);
        let count = frames as usize * fmt.channels as usize;
        let ss = fmt.sample_size();

        let mut n = 0usize;
        if fmt.is_float {
            for s in reader.samples::<f32>().take(count) {
                buf[n * ss..(n + 1) * ss].copy_from_slice(&s?.to_le_bytes());
                n += 1;
            }
        } else {
            for s in reader.samples::<i32>().take(count) {
                let s = s?;
                let dst = &mut buf[n * ss..(n + 1) * ss];
                match ss {
                    1 => dst[0] = (s + 128) as u8,
                    2 => dst.copy_from_slice(&(s as i16).to_le_bytes()),
                    3 => dst.copy_from_slice(&s.to_le_bytes()[..3]),
                    _ => dst.copy_from_slice(&s.to_le_bytes()),
                }
                n += 1;
            }
        }

        let whole_frames = n / fmt.channels as usize;
        self.remaining -= whole_frames as u64;
        Ok(whole_frames * fmt.frame_size())
    }
}

// --- symphonia-backed decoder for everything else ---

pub struct SymphoniaDecoderPlugin;

impl DecoderPlugin for SymphoniaDecoderPlugin {
    fn id(&self) -> &str {
        "symphonia"
    }

    fn extensions(&self) -> &[&str] {
        &["mp3", "flac", "ogg", "oga", "aif", "aiff", "caf"]
    }

    fn open(&self) -> Box<dyn Decoder> {
        Box::new(SymphoniaDecoder::default())
    }
}

#[derive(Default)]
struct SymphoniaDecoder {
    stream: Option<(Box<dyn FormatReader>, Box<dyn CodecDecoder>, u32)>,
    fmt: Option<PcmFormat>,
    ints: Option<SampleBuffer<i32>>,
    floats: Option<SampleBuffer<f32>>,
    pending: Vec<u8>,
    pos: usize,
    skip_frames: u64,
    remaining: Option<u64>,
    done: bool,
}

impl SymphoniaDecoder {
    /// Decodes packets until there are pending bytes or the stream ends.
    fn refill(&mut self) -> Result<()> {
        let Some(fmt) = self.fmt else {
            self.done = true;
            return Ok(());
        };
        let Some((format, decoder, track_id)) = self.stream.as_mut() else {
            self.done = true;
            return Ok(());
        };
        self.pending.clear();
        self.pos = 0;

        while self.pending.is_empty() && !self.done {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.done = true;
                    break;
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.done = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            if packet.track_id() != *track_id {
                continue;
            }
            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let spec = *decoded.spec();
            let capacity = decoded.capacity() as u64;
            let needed = capacity * spec.channels.count() as u64;
            let ss = fmt.sample_size();
            if fmt.is_float {
                if self.floats.as_ref().map_or(true, |b| (b.capacity() as u64) < needed) {
                    self.floats = Some(SampleBuffer::new(capacity, spec));
                }
                let Some(buf) = self.floats.as_mut() else {
                    continue;
                };
                buf.copy_interleaved_ref(decoded);
                for s in buf.samples() {
                    self.pending.extend_from_slice(&s.to_le_bytes());
                }
            } else {
                if self.ints.as_ref().map_or(true, |b| (b.capacity() as u64) < needed) {
                    self.ints = Some(SampleBuffer::new(capacity, spec));
                }
                let Some(buf) = self.ints.as_mut() else {
                    continue;
                };
                buf.copy_interleaved_ref(decoded);
                for &s in buf.samples() {
                    match ss {
                        1 => self.pending.push(((s >> 24) + 128) as u8),
                        2 => self.pending.extend_from_slice(&((s >> 16) as i16).to_le_bytes()),
                        3 => self.pending.extend_from_slice(&s.to_le_bytes()[1..4]),
                        _ => self.pending.extend_from_slice(&s.to_le_bytes()),
                    }
                }
            }

            let frame = fmt.frame_size();
            if self.skip_frames > 0 {
                let avail = (self.pending.len() / frame) as u64;
                let skip = self.skip_frames.min(avail);
                self.pending.drain(..skip as usize * frame);
                self.skip_frames -= skip;
            }
            if let Some(left) = self.remaining.as_mut() {
                let avail = (self.pending.len() / frame) as u64;
                let keep = avail.min(*left);
                self.pending.truncate(keep as usize * frame);
                *left -= keep;
                if *left == 0 {
                    self.done = true;
                }
            }
        }
        Ok(())
    }
}

impl Decoder for SymphoniaDecoder {
    fn init(&mut self, track: &Track) -> Result<PcmFormat> {
        let (format, _) = open_format(&track.path)?;
        let codec_track = format.default_track().context("No default track found")?;
        let params = &codec_track.codec_params;

        let sample_rate = params.sample_rate.ok_or_else(|| ConvertError::DecoderInit {
            path: track.path.clone(),
            reason: "unknown sample rate".into(),
        })?;
        let channels = params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| ConvertError::DecoderInit {
                path: track.path.clone(),
                reason: "unknown channel layout".into(),
            })?;
        let (bits, is_float) = match params.bits_per_sample {
            Some(b) if b <= 8 => (8, false),
            Some(b) if b <= 16 => (16, false),
            Some(b) if b <= 24 => (24, false),
            Some(_) => (32, false),
            None => (32, true),
        };
        let fmt = PcmFormat::new(sample_rate, channels, bits, is_float)?;

        let decoder = get_codecs().make(params, &DecoderOptions::default())?;
        let track_id = codec_track.id;

        self.stream = Some((format, decoder, track_id));
        self.fmt = Some(fmt);
        self.skip_frames = track.start_sample;
        self.remaining = span(track);
        Ok(fmt)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            if self.pos >= self.pending.len() {
                if self.done {
                    break;
                }
                self.refill()?;
                continue;
            }
            let n = (self.pending.len() - self.pos).min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
            self.pos += n;
            written += n;
        }
        Ok(written)
    }
}
