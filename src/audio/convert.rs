// Sample format conversion between i16 PCM and normalized f32.
//
// Scaling uses 32768 in both directions so every i16 value survives the
// round trip exactly. Conversion back rounds and clips to the i16 range.

const SCALE: f32 = 32768.0;

/// Append i16 samples to `buffer` as normalized floats
pub fn extend_normalized(buffer: &mut Vec<f32>, samples: &[i16]) {
    buffer.reserve(samples.len());
    buffer.extend(samples.iter().map(|&s| s as f32 / SCALE));
}

pub fn to_normalized(samples: &[i16]) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len());
    extend_normalized(&mut out, samples);
    out
}

/// Convert normalized floats back to i16, applying `gain` first
pub fn to_pcm(samples: &[f32], gain: f32) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let scaled = (s * gain * SCALE).round();
            // NaN maps to silence rather than i16::MIN
            if scaled.is_nan() {
                return 0;
            }
            scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_is_exact_at_full_scale() {
        let samples = vec![i16::MIN, -12345, -1, 0, 1, 12345, i16::MAX];
        let back = to_pcm(&to_normalized(&samples), 1.0);
        assert_eq!(back, samples);
    }

    #[test]
    fn test_conversion_clips_out_of_range() {
        let back = to_pcm(&[1.5, -1.5, 1.0, -1.0], 1.0);
        assert_eq!(back, vec![i16::MAX, i16::MIN, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_gain_is_applied_before_clipping() {
        let back = to_pcm(&[0.25, 0.75], 2.0);
        assert_eq!(back, vec![16384, i16::MAX]);
    }

    #[test]
    fn test_nan_becomes_silence() {
        assert_eq!(to_pcm(&[f32::NAN], 1.0), vec![0]);
    }
}
