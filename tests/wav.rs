use std::fs;

use tempfile::tempdir;
use track_converter_core::{
    io::wav::{estimate_data_size, WAV_HEADER_LEN},
    PcmFormat, WavHeader,
};

#[test]
fn header_layout_for_cd_audio() {
    let h = WavHeader::new(&PcmFormat::int(44100, 2, 16), 40000);
    let b = h.to_bytes();
    assert_eq!(b.len(), WAV_HEADER_LEN);
    assert_eq!(&b[0..4], b"RIFF");
    assert_eq!(u32::from_le_bytes(b[4..8].try_into().unwrap()), 36 + 40000);
    assert_eq!(&b[8..16], b"WAVEfmt ");
    assert_eq!(u32::from_le_bytes(b[16..20].try_into().unwrap()), 16);
    assert_eq!(u16::from_le_bytes([b[20], b[21]]), 1);
    assert_eq!(u16::from_le_bytes([b[22], b[23]]), 2);
    assert_eq!(u32::from_le_bytes(b[24..28].try_into().unwrap()), 44100);
    assert_eq!(u32::from_le_bytes(b[28..32].try_into().unwrap()), 176_400);
    assert_eq!(u16::from_le_bytes([b[32], b[33]]), 4);
    assert_eq!(u16::from_le_bytes([b[34], b[35]]), 16);
    assert_eq!(&b[36..40], b"data");
    assert_eq!(u32::from_le_bytes(b[40..44].try_into().unwrap()), 40000);
}

#[test]
fn float_header_uses_ieee_tag() {
    let h = WavHeader::new(&PcmFormat::float32(48000, 1), 0);
    let b = h.to_bytes();
    assert_eq!(u16::from_le_bytes([b[20], b[21]]), 3);
    assert_eq!(WavHeader::parse(&b).unwrap(), h);
}

#[test]
fn parse_rejects_short_or_foreign_data() {
    assert!(WavHeader::parse(&[0u8; 20]).is_err());
    let mut b = WavHeader::new(&PcmFormat::int(8000, 1, 8), 10).to_bytes();
    b[0] = b'X';
    assert!(WavHeader::parse(&b).is_err());
}

#[test]
fn hound_reads_header_plus_data() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("out.wav");
    let fmt = PcmFormat::int(22050, 2, 16);
    let samples: Vec<i16> = (0..200).map(|i| (i * 100 - 10000) as i16).collect();

    let mut bytes = WavHeader::new(&fmt, samples.len() as u32 * 2).to_bytes().to_vec();
    bytes.extend(samples.iter().flat_map(|s| s.to_le_bytes()));
    fs::write(&path, bytes).unwrap();

    let mut r = hound::WavReader::open(&path).unwrap();
    let spec = r.spec();
    assert_eq!(spec.channels, 2);
    assert_eq!(spec.sample_rate, 22050);
    assert_eq!(spec.bits_per_sample, 16);
    let read: Vec<i16> = r.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read, samples);
}

#[test]
fn estimate_prefers_sample_span() {
    let out = PcmFormat::int(44100, 2, 16);
    assert_eq!(estimate_data_size(10000, 99.0, 44100, &out), 40000);
}

#[test]
fn estimate_falls_back_to_duration() {
    let out = PcmFormat::int(44100, 2, 16);
    assert_eq!(estimate_data_size(0, 1.0, 44100, &out), 176_400);
    assert_eq!(estimate_data_size(0, 0.0, 44100, &out), 0);
}

#[test]
fn estimate_scales_by_output_rate() {
    let out = PcmFormat::int(22050, 1, 16);
    assert_eq!(estimate_data_size(1000, 0.0, 44100, &out), 1000);
}
