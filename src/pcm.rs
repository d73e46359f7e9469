//! Interleaved PCM sample-format conversion.
//!
//! Integer samples are widened to left-justified `i32` on the way through,
//! so converting to a deeper integer format and back is exact.

use crate::types::PcmFormat;

const I32_SCALE: f64 = 2_147_483_648.0;

/// Converts `src` (in `src_fmt`) into `dst_fmt`, replacing the contents of
/// `dst`. Returns the number of bytes written.
///
/// Bit depth, float-ness and channel count are converted; sample rates are
/// taken as equal. A trailing partial frame in `src` is dropped. Extra output
/// channels repeat a mono source and are silent otherwise.
pub fn pcm_convert(src_fmt: &PcmFormat, src: &[u8], dst_fmt: &PcmFormat, dst: &mut Vec<u8>) -> usize {
    dst.clear();
    let frames = src.len() / src_fmt.frame_size();
    let whole = &src[..frames * src_fmt.frame_size()];

    if src_fmt.bits_per_sample == dst_fmt.bits_per_sample
        && src_fmt.is_float == dst_fmt.is_float
        && src_fmt.channels == dst_fmt.channels
    {
        dst.extend_from_slice(whole);
        return dst.len();
    }

    dst.reserve(frames * dst_fmt.frame_size());
    let in_ch = src_fmt.channels as usize;
    let out_ch = dst_fmt.channels as usize;
    let ss = src_fmt.sample_size();
    let float_path = src_fmt.is_float && dst_fmt.is_float;

    for frame in whole.chunks_exact(src_fmt.frame_size()) {
        for c in 0..out_ch {
            let from = if c < in_ch {
                Some(c)
            } else if in_ch == 1 {
                Some(0)
            } else {
                None
            };
            match from {
                Some(i) => {
                    let bytes = &frame[i * ss..(i + 1) * ss];
                    if float_path {
                        dst.extend_from_slice(bytes);
                    } else {
                        write_i32(dst_fmt, read_i32(src_fmt, bytes), dst);
                    }
                }
                None => write_silence(dst_fmt, dst),
            }
        }
    }
    dst.len()
}

/// Decodes interleaved PCM into `f32` samples in [-1, 1), replacing `out`.
/// Returns the frame count.
pub fn decode_f32(fmt: &PcmFormat, src: &[u8], out: &mut Vec<f32>) -> usize {
    out.clear();
    let frames = src.len() / fmt.frame_size();
    let whole = &src[..frames * fmt.frame_size()];
    out.reserve(frames * fmt.channels as usize);
    for bytes in whole.chunks_exact(fmt.sample_size()) {
        let s = if fmt.is_float {
            f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
        } else {
            (read_i32(fmt, bytes) as f64 / I32_SCALE) as f32
        };
        out.push(s);
    }
    frames
}

/// Encodes `f32` samples into `fmt`'s sample layout, replacing `out`.
/// `fmt.channels` is not consulted: samples are written one for one.
pub fn encode_f32(samples: &[f32], fmt: &PcmFormat, out: &mut Vec<u8>) -> usize {
    out.clear();
    out.reserve(samples.len() * fmt.sample_size());
    for &s in samples {
        if fmt.is_float {
            out.extend_from_slice(&s.to_le_bytes());
        } else {
            write_i32(fmt, f32_to_i32(s), out);
        }
    }
    out.len()
}

#[inline]
fn f32_to_i32(s: f32) -> i32 {
    (s as f64 * I32_SCALE)
        .round()
        .clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

/// Reads one sample as a left-justified `i32`.
#[inline]
fn read_i32(fmt: &PcmFormat, b: &[u8]) -> i32 {
    match fmt.bits_per_sample {
        8 => (b[0] as i32 - 128) << 24,
        16 => (i16::from_le_bytes([b[0], b[1]]) as i32) << 16,
        24 => ((b[0] as u32) << 8 | (b[1] as u32) << 16 | (b[2] as u32) << 24) as i32,
        _ if fmt.is_float => f32_to_i32(f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        _ => i32::from_le_bytes([b[0], b[1], b[2], b[3]]),
    }
}

#[inline]
fn write_i32(fmt: &PcmFormat, v: i32, out: &mut Vec<u8>) {
    match fmt.bits_per_sample {
        8 => out.push(((v >> 24) + 128) as u8),
        16 => out.extend_from_slice(&((v >> 16) as i16).to_le_bytes()),
        24 => out.extend_from_slice(&v.to_le_bytes()[1..4]),
        _ if fmt.is_float => out.extend_from_slice(&((v as f64 / I32_SCALE) as f32).to_le_bytes()),
        _ => out.extend_from_slice(&v.to_le_bytes()),
    }
}

#[inline]
fn write_silence(fmt: &PcmFormat, out: &mut Vec<u8>) {
    if fmt.bits_per_sample == 8 {
        out.push(128);
    } else {
        out.extend(std::iter::repeat(0u8).take(fmt.sample_size()));
    }
}
