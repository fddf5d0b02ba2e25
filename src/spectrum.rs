/// Spectral extraction
///
/// Turns a PCM frame into the magnitude of its real FFT (`n / 2 + 1` bins),
/// optionally scaled to unit Euclidean norm for shape comparison.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use tracing::trace;

use crate::audio::AudioSample;

/// Magnitude spectrum (raw or unit-normalized)
pub type Spectrum = Vec<f64>;

/// Number of samples in a frame of `duration_secs` at `sample_rate`
pub fn frame_len(sample_rate: u32, duration_secs: f64) -> usize {
    (duration_secs * sample_rate as f64).round() as usize
}

/// Number of bins in the real-FFT magnitude layout of a frame
pub fn spectrum_len(frame_len: usize) -> usize {
    frame_len / 2 + 1
}

/// Dot product of two equally sized vectors.
///
/// # Panics
///
/// Panics if the lengths differ.
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    assert_eq!(
        a.len(),
        b.len(),
        "spectrum length mismatch: {} vs {}",
        a.len(),
        b.len()
    );
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Energy of a raw spectrum (its squared Euclidean norm)
pub fn energy(spectrum: &[f64]) -> f64 {
    dot(spectrum, spectrum)
}

/// Divide every bin by the Euclidean norm of the vector.
///
/// A silent vector (norm 0) produces non-finite values; callers gate on
/// energy before normalizing.
pub fn l2_normalize(spectrum: &mut [f64]) {
    let norm = energy(spectrum).sqrt();
    for bin in spectrum.iter_mut() {
        *bin /= norm;
    }
}

/// FFT-based magnitude spectrum extractor
///
/// Plans are cached by the underlying planner, so frames of a fixed size
/// only pay for planning once.
pub struct SpectralExtractor {
    planner: FftPlanner<f64>,
    buffer: Vec<Complex<f64>>,
}

impl SpectralExtractor {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
            buffer: Vec::new(),
        }
    }

    /// Compute the magnitude spectrum of `frame`
    pub fn extract(&mut self, frame: &[AudioSample], normalize: bool) -> Spectrum {
        let n = frame.len();
        if n == 0 {
            return vec![0.0];
        }

        self.buffer.clear();
        self.buffer
            .extend(frame.iter().map(|&s| Complex::new(s as f64, 0.0)));

        let fft = self.planner.plan_fft_forward(n);
        fft.process(&mut self.buffer);

        let mut spectrum: Spectrum = self.buffer[..spectrum_len(n)]
            .iter()
            .map(|c| c.norm())
            .collect();

        if normalize {
            l2_normalize(&mut spectrum);
        }

        trace!("Extracted {} bins from {} samples", spectrum.len(), n);
        spectrum
    }
}

impl Default for SpectralExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn generate_tone(frequency: f32, sample_rate: f32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let t = i as f32 / sample_rate;
                amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
            })
            .collect()
    }

    #[test]
    fn test_frame_and_spectrum_len() {
        assert_eq!(frame_len(44100, 0.10), 4410);
        assert_eq!(spectrum_len(4410), 2206);
        assert_eq!(spectrum_len(7), 4);
    }

    #[test]
    fn test_extract_length() {
        let mut extractor = SpectralExtractor::new();
        let frame = generate_tone(440.0, 44100.0, 4410, 0.5);
        assert_eq!(extractor.extract(&frame, false).len(), 2206);
        assert_eq!(extractor.extract(&frame[..101], false).len(), 51);
    }

    #[test]
    fn test_normalized_has_unit_energy() {
        let mut extractor = SpectralExtractor::new();
        for freq in [100.0, 440.0, 2500.0] {
            let frame = generate_tone(freq, 44100.0, 4410, 0.3);
            let spectrum = extractor.extract(&frame, true);
            assert_relative_eq!(energy(&spectrum), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut extractor = SpectralExtractor::new();
        let frame = generate_tone(1000.0, 44100.0, 4410, 0.8);
        let once = extractor.extract(&frame, true);
        let mut twice = once.clone();
        l2_normalize(&mut twice);

        for (a, b) in once.iter().zip(&twice) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_peak_bin_matches_tone() {
        let mut extractor = SpectralExtractor::new();
        // 1000 Hz at 44.1 kHz over 4410 samples lands exactly on bin 100
        let frame = generate_tone(1000.0, 44100.0, 4410, 0.5);
        let spectrum = extractor.extract(&frame, false);

        let peak = spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 100);
    }

    #[test]
    fn test_dc_frame() {
        let mut extractor = SpectralExtractor::new();
        let spectrum = extractor.extract(&[1.0; 8], false);
        assert_relative_eq!(spectrum[0], 8.0, epsilon = 1e-9);
        assert!(spectrum[1..].iter().all(|&m| m < 1e-9));
    }

    #[test]
    fn test_silence_normalization_is_not_finite() {
        let mut extractor = SpectralExtractor::new();
        let spectrum = extractor.extract(&[0.0; 64], true);
        assert!(spectrum.iter().all(|m| !m.is_finite()));
    }

    #[test]
    #[should_panic(expected = "spectrum length mismatch")]
    fn test_dot_length_mismatch_panics() {
        dot(&[1.0, 2.0], &[1.0]);
    }
}
