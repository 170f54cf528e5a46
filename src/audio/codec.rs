//! Conversion between captured float samples and wire PCM.
//!
//! The wire format is mono 16-bit little-endian PCM at a fixed target rate.
//! Resampling is nearest-neighbour index selection with no anti-aliasing
//! filter.

/// Encode float samples captured at `raw_rate` into i16 PCM at `target_rate`.
///
/// Rates at or below the target pass through without resampling.
pub fn encode(raw: &[f32], raw_rate: u32, target_rate: u32) -> Vec<i16> {
    if raw.is_empty() || raw_rate == 0 || target_rate == 0 {
        return Vec::new();
    }

    if raw_rate <= target_rate {
        return raw.iter().map(|&s| float_to_pcm(s)).collect();
    }

    let ratio = raw_rate as f64 / target_rate as f64;
    let out_len = (raw.len() as f64 / ratio).floor() as usize;

    (0..out_len)
        .map(|i| {
            let idx = ((i as f64 * ratio).floor() as usize).min(raw.len() - 1);
            float_to_pcm(raw[idx])
        })
        .collect()
}

/// Nearest-neighbour resampling in either direction (playback path)
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return Vec::new();
    }
    if from_rate == to_rate {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio).floor() as usize;
    (0..out_len)
        .map(|i| samples[((i as f64 * ratio).floor() as usize).min(samples.len() - 1)])
        .collect()
}

/// Decode little-endian i16 PCM bytes into float samples in [-1, 1].
///
/// A trailing odd byte is ignored.
pub fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| pcm_to_float(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

/// Serialize samples as little-endian bytes for the wire
pub fn to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Root-mean-square energy of a PCM block (diagnostics only)
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Downmix interleaved multi-channel samples to mono by averaging
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn float_to_pcm(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

fn pcm_to_float(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_empty_block() {
        assert!(encode(&[], 48000, 16000).is_empty());
        assert!(decode(&[]).is_empty());
    }

    #[test]
    fn test_encode_downsamples_by_index_selection() {
        // 48kHz -> 16kHz keeps every third sample
        let raw: Vec<f32> = (0..9).map(|i| i as f32 / 10.0).collect();
        let pcm = encode(&raw, 48000, 16000);

        assert_eq!(pcm.len(), 3);
        assert_eq!(pcm[0], float_to_pcm(0.0));
        assert_eq!(pcm[1], float_to_pcm(0.3));
        assert_eq!(pcm[2], float_to_pcm(0.6));
    }

    #[test]
    fn test_encode_fractional_ratio() {
        // 44.1kHz block of 4096 samples
        let raw = vec![0.25f32; 4096];
        let pcm = encode(&raw, 44100, 16000);

        assert_eq!(pcm.len(), (4096.0 / (44100.0 / 16000.0)) as usize);
        assert!(pcm.iter().all(|&s| s == float_to_pcm(0.25)));
    }

    #[test]
    fn test_encode_passes_through_at_target_rate() {
        let raw = vec![0.5f32, -0.5, 0.0];
        assert_eq!(encode(&raw, 16000, 16000).len(), 3);
    }

    #[test]
    fn test_encode_clamps_out_of_range() {
        let pcm = encode(&[2.0, -3.0, f32::NAN], 16000, 16000);
        assert_eq!(pcm, vec![i16::MAX, i16::MIN, 0]);
    }

    #[test]
    fn test_decode_ignores_trailing_byte() {
        let bytes = [0x00, 0x40, 0x7f];
        let samples = decode(&bytes);
        assert_eq!(samples.len(), 1);
        assert!((samples[0] - 16384.0 / 32767.0).abs() < 1e-6);
    }

    #[test]
    fn test_round_trip_within_one_step() {
        let step = 1.0 / 32767.0;
        let raw: Vec<f32> = (0..2000).map(|i| ((i as f32) * 0.37).sin()).collect();

        let decoded = decode(&to_le_bytes(&encode(&raw, 16000, 16000)));

        assert_eq!(decoded.len(), raw.len());
        for (orig, back) in raw.iter().zip(decoded.iter()) {
            assert!((orig - back).abs() <= step, "{} vs {}", orig, back);
        }
    }

    #[test]
    fn test_resample_up_repeats_samples() {
        let up = resample(&[0.1, 0.2], 16000, 48000);
        assert_eq!(up, vec![0.1, 0.1, 0.1, 0.2, 0.2, 0.2]);
    }

    #[test]
    fn test_rms_of_silence_is_zero() {
        assert_eq!(rms(&[0; 480]), 0.0);
        assert!((rms(&[100, -100]) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[0.2, 0.4, -1.0, 1.0], 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!(mono[1].abs() < 1e-6);
    }
}
