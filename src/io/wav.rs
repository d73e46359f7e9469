//! The 44-byte RIFF/WAVE header written ahead of every converted stream.

use std::io::Write;

use crate::{
    error::{ConvertError, Result},
    types::PcmFormat,
};

pub const WAV_HEADER_LEN: usize = 44;

const FORMAT_PCM: u16 = 1;
const FORMAT_IEEE_FLOAT: u16 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WavHeader {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub is_float: bool,
    /// Size of the data chunk as declared up front. This is an estimate and
    /// may not match the bytes that follow.
    pub data_size: u32,
}

impl WavHeader {
    pub fn new(fmt: &PcmFormat, data_size: u32) -> Self {
        Self {
            channels: fmt.channels,
            sample_rate: fmt.sample_rate,
            bits_per_sample: fmt.bits_per_sample,
            is_float: fmt.is_float,
            data_size,
        }
    }

    pub fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample / 8
    }

    pub fn to_bytes(&self) -> [u8; WAV_HEADER_LEN] {
        let mut h = [0u8; WAV_HEADER_LEN];
        let tag = if self.is_float { FORMAT_IEEE_FLOAT } else { FORMAT_PCM };
        let byte_rate = self.sample_rate.wrapping_mul(self.block_align() as u32);

        h[0..4].copy_from_slice(b"RIFF");
        h[4..8].copy_from_slice(&self.data_size.saturating_add(36).to_le_bytes());
        h[8..12].copy_from_slice(b"WAVE");
        h[12..16].copy_from_slice(b"fmt ");
        h[16..20].copy_from_slice(&16u32.to_le_bytes());
        h[20..22].copy_from_slice(&tag.to_le_bytes());
        h[22..24].copy_from_slice(&self.channels.to_le_bytes());
        h[24..28].copy_from_slice(&self.sample_rate.to_le_bytes());
        h[28..32].copy_from_slice(&byte_rate.to_le_bytes());
        h[32..34].copy_from_slice(&self.block_align().to_le_bytes());
        h[34..36].copy_from_slice(&self.bits_per_sample.to_le_bytes());
        h[36..40].copy_from_slice(b"data");
        h[40..44].copy_from_slice(&self.data_size.to_le_bytes());
        h
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.to_bytes())?;
        Ok(())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < WAV_HEADER_LEN {
            return Err(ConvertError::InvalidFormat(format!(
                "WAV header needs {WAV_HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" || &bytes[36..40] != b"data" {
            return Err(ConvertError::InvalidFormat("not a canonical WAV header".into()));
        }
        let u16_at = |o: usize| u16::from_le_bytes([bytes[o], bytes[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);

        Ok(Self {
            channels: u16_at(22),
            sample_rate: u32_at(24),
            bits_per_sample: u16_at(34),
            is_float: u16_at(20) == FORMAT_IEEE_FLOAT,
            data_size: u32_at(40),
        })
    }
}

/// Up-front estimate of the data chunk size for a track.
///
/// Uses the track's sample span, falling back to `duration × source_rate`
/// when the span is empty, then scales by `out_rate / source_rate`.
pub fn estimate_data_size(
    span_samples: u64,
    duration: f32,
    source_rate: u32,
    out: &PcmFormat,
) -> u32 {
    let frame = out.frame_size() as u64;
    let mut size = span_samples * frame;
    if size == 0 {
        size = (duration as f64 * source_rate as f64) as u64 * frame;
    }
    if out.sample_rate != source_rate && source_rate > 0 {
        size = size * out.sample_rate as u64 / source_rate as u64;
    }
    size.min(u32::MAX as u64) as u32
}
