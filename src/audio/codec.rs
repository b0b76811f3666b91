//! # Telephony Audio Codec Adapter
//!
//! Bidirectional conversion between the telephony transport's companded
//! 8-bit/8kHz/mono µ-law stream and the linear 16-bit PCM WAV containers the
//! speech services consume.
//!
//! ## The two directions:
//! - **Inbound** (caller → transcription): raw µ-law bytes are wrapped in a
//!   minimal WAV container (format tag 7) without touching the sample
//!   values. Pure framing, fully lossless.
//! - **Outbound** (synthesis → caller): a 16-bit mono PCM WAV is parsed and
//!   each linear sample is companded down to one µ-law byte.
//!
//! ## Format policy:
//! Outbound audio with the wrong sample width or channel count is rejected
//! outright - this adapter never resamples. A sample-rate mismatch is only
//! logged: the synthesis provider is asked for 8kHz directly and owns rate
//! correctness.

use crate::error::{AppError, AppResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use tracing::warn;

/// Sample rate of the telephony media stream, in Hz.
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

/// WAVE format tag for µ-law companded audio.
const WAVE_FORMAT_MULAW: u16 = 7;

/// Wrap raw companded bytes in a minimal µ-law WAV container.
///
/// The sample values pass through untouched - only RIFF framing is added so
/// the transcription service recognizes the payload. The container carries a
/// `fact` chunk with the sample count, as non-PCM WAV files are expected to.
pub fn encode_telephony_container(companded: &[u8]) -> AppResult<Vec<u8>> {
    if companded.is_empty() {
        return Err(AppError::Codec(
            "no companded audio to frame".to_string(),
        ));
    }

    let data_len = companded.len() as u32;
    let mut out = Vec::with_capacity(companded.len() + 58);
    write_mulaw_header(&mut out, data_len)
        .map_err(|e| AppError::Codec(format!("failed to construct container writer: {}", e)))?;
    out.extend_from_slice(companded);
    Ok(out)
}

/// Recover the raw companded bytes from a µ-law WAV container.
///
/// Inverse of [`encode_telephony_container`]; together they guarantee the
/// lossless round-trip the media stream depends on. Rejects containers whose
/// `fmt ` chunk is not 8-bit mono µ-law.
pub fn read_telephony_container(container: &[u8]) -> AppResult<Vec<u8>> {
    let mut cursor = Cursor::new(container);

    let mut tag = [0u8; 4];
    cursor
        .read_exact(&mut tag)
        .map_err(|e| AppError::Codec(format!("container too short: {}", e)))?;
    if &tag != b"RIFF" {
        return Err(AppError::Codec("missing RIFF header".to_string()));
    }
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| AppError::Codec(format!("truncated RIFF size: {}", e)))?;
    cursor
        .read_exact(&mut tag)
        .map_err(|e| AppError::Codec(format!("truncated RIFF form: {}", e)))?;
    if &tag != b"WAVE" {
        return Err(AppError::Codec("not a WAVE container".to_string()));
    }

    let mut format_validated = false;
    loop {
        if cursor.read_exact(&mut tag).is_err() {
            return Err(AppError::Codec(
                "container has no data chunk".to_string(),
            ));
        }
        let chunk_size = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| AppError::Codec(format!("truncated chunk header: {}", e)))?;

        match &tag {
            b"fmt " => {
                let audio_format = cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|e| AppError::Codec(format!("truncated fmt chunk: {}", e)))?;
                let channels = cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|e| AppError::Codec(format!("truncated fmt chunk: {}", e)))?;
                // sample rate + byte rate + block align
                cursor.set_position(cursor.position() + 10);
                let bits_per_sample = cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|e| AppError::Codec(format!("truncated fmt chunk: {}", e)))?;

                if audio_format != WAVE_FORMAT_MULAW || channels != 1 || bits_per_sample != 8 {
                    return Err(AppError::Codec(format!(
                        "not an 8-bit mono mu-law container (format={}, channels={}, bits={})",
                        audio_format, channels, bits_per_sample
                    )));
                }
                format_validated = true;

                // Skip whatever remains of the chunk (cbSize extension etc.)
                let consumed = 16u32;
                skip_chunk_remainder(&mut cursor, chunk_size, consumed)?;
            }
            b"data" => {
                if !format_validated {
                    return Err(AppError::Codec(
                        "data chunk appeared before fmt chunk".to_string(),
                    ));
                }
                let mut data = vec![0u8; chunk_size as usize];
                cursor
                    .read_exact(&mut data)
                    .map_err(|e| AppError::Codec(format!("truncated data chunk: {}", e)))?;
                return Ok(data);
            }
            _ => {
                skip_chunk_remainder(&mut cursor, chunk_size, 0)?;
            }
        }
    }
}

/// Convert a linear 16-bit mono PCM WAV into raw, headerless companded bytes
/// suitable for the telephony media stream.
///
/// Any sample width other than 16 bits or channel count other than 1 is a
/// hard error - the caller must skip the turn rather than ship garbled
/// audio. A sample-rate mismatch only logs a warning.
pub fn decode_to_companded(wav_bytes: &[u8]) -> AppResult<Vec<u8>> {
    let (header, samples) = read_pcm16(wav_bytes)?;

    if header.channel_count != 1 {
        return Err(AppError::UnsupportedFormat(format!(
            "expected mono audio, got {} channels",
            header.channel_count
        )));
    }

    if header.sampling_rate != TELEPHONY_SAMPLE_RATE {
        warn!(
            "synthesis audio sample rate is {}Hz, not {}Hz; passing through without resampling",
            header.sampling_rate, TELEPHONY_SAMPLE_RATE
        );
    }

    Ok(samples.iter().map(|&sample| linear_to_mulaw(sample)).collect())
}

/// Reassemble multiple synthesis segments into one PCM WAV container.
///
/// Segments are concatenated as raw sample frames under the first segment's
/// format parameters; the provider sends uniform segments for a single
/// request, so later headers are not re-checked against the first.
pub fn merge_synthesis_segments(segments: &[Vec<u8>]) -> AppResult<Vec<u8>> {
    let first = segments
        .first()
        .ok_or_else(|| AppError::Codec("synthesis returned no audio segments".to_string()))?;

    let (header, mut samples) = read_pcm16(first)?;
    for segment in &segments[1..] {
        let (_, more) = read_pcm16(segment)?;
        samples.extend(more);
    }

    let mut out = Cursor::new(Vec::new());
    wav::write(header, &wav::BitDepth::Sixteen(samples), &mut out)
        .map_err(|e| AppError::Codec(format!("failed to write merged container: {}", e)))?;
    Ok(out.into_inner())
}

/// Parse a WAV container and demand 16-bit samples.
fn read_pcm16(wav_bytes: &[u8]) -> AppResult<(wav::Header, Vec<i16>)> {
    let mut cursor = Cursor::new(wav_bytes);
    let (header, data) = wav::read(&mut cursor)
        .map_err(|e| AppError::Codec(format!("failed to parse PCM container: {}", e)))?;

    match data {
        wav::BitDepth::Sixteen(samples) => Ok((header, samples)),
        _ => Err(AppError::UnsupportedFormat(
            "synthesis audio must be 16-bit linear PCM".to_string(),
        )),
    }
}

/// Compand one 16-bit linear sample down to an 8-bit µ-law byte (G.711).
///
/// The magnitude is biased, the segment (exponent) located from the top set
/// bit, and the four mantissa bits taken from just below it; the result is
/// complemented per the wire convention.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32_635;

    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };
    let mut magnitude = (sample as i32).abs();
    if magnitude > CLIP {
        magnitude = CLIP;
    }
    magnitude += BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (magnitude & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Write the RIFF/fmt/fact header for an 8-bit mono µ-law file.
fn write_mulaw_header(out: &mut Vec<u8>, data_len: u32) -> std::io::Result<()> {
    // WAVE form (4) + fmt chunk (8 + 18) + fact chunk (8 + 4) + data chunk header (8)
    let riff_size = 4 + 26 + 12 + 8 + data_len;

    out.extend_from_slice(b"RIFF");
    out.write_u32::<LittleEndian>(riff_size)?;
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.write_u32::<LittleEndian>(18)?;
    out.write_u16::<LittleEndian>(WAVE_FORMAT_MULAW)?;
    out.write_u16::<LittleEndian>(1)?; // mono
    out.write_u32::<LittleEndian>(TELEPHONY_SAMPLE_RATE)?;
    out.write_u32::<LittleEndian>(TELEPHONY_SAMPLE_RATE)?; // byte rate: 1 byte per sample
    out.write_u16::<LittleEndian>(1)?; // block align
    out.write_u16::<LittleEndian>(8)?; // bits per sample
    out.write_u16::<LittleEndian>(0)?; // no format extension

    // Non-PCM containers carry a fact chunk with the frame count
    out.extend_from_slice(b"fact");
    out.write_u32::<LittleEndian>(4)?;
    out.write_u32::<LittleEndian>(data_len)?;

    out.extend_from_slice(b"data");
    out.write_u32::<LittleEndian>(data_len)?;
    Ok(())
}

/// Advance past the unread part of a chunk, honoring RIFF's even-byte padding.
fn skip_chunk_remainder(
    cursor: &mut Cursor<&[u8]>,
    chunk_size: u32,
    already_read: u32,
) -> AppResult<()> {
    let mut remaining = chunk_size.saturating_sub(already_read) as u64;
    if chunk_size % 2 == 1 {
        remaining += 1;
    }
    let target = cursor.position() + remaining;
    if target > cursor.get_ref().len() as u64 {
        return Err(AppError::Codec("chunk extends past end of container".to_string()));
    }
    cursor.set_position(target);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// WAVE format tag for linear PCM.
    const WAVE_FORMAT_PCM: u16 = 1;

    /// Build a PCM WAV in memory with the wav crate (the same parser the
    /// decode path uses), so format rejection tests exercise real headers.
    fn pcm_wav(channels: u16, sample_rate: u32, data: wav::BitDepth) -> Vec<u8> {
        let bits = match data {
            wav::BitDepth::Eight(_) => 8,
            wav::BitDepth::Sixteen(_) => 16,
            _ => panic!("unused in tests"),
        };
        let header = wav::Header::new(WAVE_FORMAT_PCM, channels, sample_rate, bits);
        let mut out = Cursor::new(Vec::new());
        wav::write(header, &data, &mut out).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_container_round_trip_is_lossless() {
        // Every possible companded byte value, several times over
        let companded: Vec<u8> = (0..24_000).map(|i| (i % 256) as u8).collect();

        let container = encode_telephony_container(&companded).unwrap();
        let recovered = read_telephony_container(&container).unwrap();

        assert_eq!(recovered, companded);
    }

    #[test]
    fn test_encode_rejects_empty_input() {
        assert!(matches!(
            encode_telephony_container(&[]),
            Err(AppError::Codec(_))
        ));
    }

    #[test]
    fn test_read_rejects_non_riff_input() {
        assert!(read_telephony_container(b"definitely not audio").is_err());
    }

    #[test]
    fn test_read_rejects_pcm_container() {
        let wav_bytes = pcm_wav(1, 8000, wav::BitDepth::Sixteen(vec![0i16; 16]));
        // A linear PCM file is not a telephony container
        assert!(read_telephony_container(&wav_bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_stereo() {
        let wav_bytes = pcm_wav(2, 8000, wav::BitDepth::Sixteen(vec![0i16; 32]));
        assert!(matches!(
            decode_to_companded(&wav_bytes),
            Err(AppError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_decode_rejects_eight_bit_samples() {
        let wav_bytes = pcm_wav(1, 8000, wav::BitDepth::Eight(vec![0u8; 32]));
        assert!(matches!(
            decode_to_companded(&wav_bytes),
            Err(AppError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_decode_accepts_rate_mismatch() {
        // 22.05kHz instead of 8kHz: logged, not rejected
        let wav_bytes = pcm_wav(1, 22_050, wav::BitDepth::Sixteen(vec![100i16; 64]));
        let companded = decode_to_companded(&wav_bytes).unwrap();
        assert_eq!(companded.len(), 64);
    }

    #[test]
    fn test_mulaw_companding_reference_values() {
        // Well-known G.711 edge values
        assert_eq!(linear_to_mulaw(0), 0xFF);
        assert_eq!(linear_to_mulaw(32_767), 0x80);
        assert_eq!(linear_to_mulaw(-32_768), 0x00);
        // Companding is odd-symmetric apart from the sign bit
        assert_eq!(linear_to_mulaw(1000) & 0x7F, linear_to_mulaw(-1000) & 0x7F);
    }

    #[test]
    fn test_merge_preserves_total_sample_count() {
        let first = pcm_wav(1, 8000, wav::BitDepth::Sixteen(vec![10i16; 100]));
        let second = pcm_wav(1, 8000, wav::BitDepth::Sixteen(vec![-10i16; 50]));
        let third = pcm_wav(1, 8000, wav::BitDepth::Sixteen(vec![0i16; 25]));

        let merged = merge_synthesis_segments(&[first, second, third]).unwrap();
        let (header, samples) = read_pcm16(&merged).unwrap();

        assert_eq!(header.channel_count, 1);
        assert_eq!(samples.len(), 175);
        // Frame order preserved across the seams
        assert_eq!(samples[99], 10);
        assert_eq!(samples[100], -10);
        assert_eq!(samples[150], 0);
    }

    #[test]
    fn test_merge_rejects_empty_segment_list() {
        assert!(matches!(
            merge_synthesis_segments(&[]),
            Err(AppError::Codec(_))
        ));
    }

    #[test]
    fn test_decoded_output_length_matches_input_frames() {
        let samples: Vec<i16> = (0..256).map(|i| (i * 100) as i16).collect();
        let wav_bytes = pcm_wav(1, 8000, wav::BitDepth::Sixteen(samples));
        let companded = decode_to_companded(&wav_bytes).unwrap();
        assert_eq!(companded.len(), 256);
    }
}
