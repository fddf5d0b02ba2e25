/// Detection loop
///
/// Fans every normalized live spectrum out to all loaded detectors and
/// forwards detections to a sink.

use std::time::Instant;
use tracing::{debug, info};

use crate::audio::CaptureError;
use crate::detector::{DetectorError, SoundDetector};
use crate::sink::DetectionSink;
use crate::spectrum::Spectrum;

/// Frames between periodic progress logs
const STATS_LOG_INTERVAL: u64 = 1000;

/// Detection loop statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub frames_processed: u64,
    pub detections: u64,
}

/// Owns the detector set for one listening session
pub struct DetectionLoop {
    detectors: Vec<SoundDetector>,
    sink: Box<dyn DetectionSink>,
    stats: LoopStats,
}

impl DetectionLoop {
    /// Create a loop over `detectors`, checking every reference has
    /// `spectrum_len` bins
    pub fn new(
        detectors: Vec<SoundDetector>,
        spectrum_len: usize,
        sink: Box<dyn DetectionSink>,
    ) -> Result<Self, DetectorError> {
        for detector in &detectors {
            let actual = detector.reference().len();
            if actual != spectrum_len {
                return Err(DetectorError::ShapeMismatch {
                    name: detector.name().to_string(),
                    expected: spectrum_len,
                    actual,
                });
            }
        }

        info!(
            "Detection loop ready with {} detector(s): [{}]",
            detectors.len(),
            detectors
                .iter()
                .map(SoundDetector::name)
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            detectors,
            sink,
            stats: LoopStats::default(),
        })
    }

    /// Feed one spectrum observed at `now` to every detector.
    ///
    /// Returns the number of detections fired for this frame.
    pub fn process(&mut self, spectrum: &[f64], now: Instant) -> usize {
        let mut fired = 0;

        for detector in &mut self.detectors {
            if let Some(detection) = detector.compare_at(spectrum, now) {
                self.sink.on_detect(&detection);
                fired += 1;
            }
        }

        self.stats.frames_processed += 1;
        self.stats.detections += fired as u64;

        if self.stats.frames_processed % STATS_LOG_INTERVAL == 0 {
            debug!(
                "Processed {} frames, {} detections",
                self.stats.frames_processed, self.stats.detections
            );
        }

        fired
    }

    /// Run until the stream ends (cancellation or end of input)
    pub fn run<I>(&mut self, spectra: I) -> Result<LoopStats, CaptureError>
    where
        I: IntoIterator<Item = Result<Spectrum, CaptureError>>,
    {
        for spectrum in spectra {
            self.process(&spectrum?, Instant::now());
        }

        info!(
            "Detection loop stopped after {} frames, {} detections",
            self.stats.frames_processed, self.stats.detections
        );
        Ok(self.stats.clone())
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn detectors(&self) -> &[SoundDetector] {
        &self.detectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorConfig;
    use crate::reference::ReferenceSpectrum;
    use crate::sink::MockDetectionSink;
    use std::sync::Arc;

    fn detector(name: &str, values: Vec<f64>) -> SoundDetector {
        SoundDetector::new(
            Arc::new(ReferenceSpectrum::new(name, values)),
            DetectorConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_shape_mismatch_at_construction() {
        let detectors = vec![detector("a", vec![1.0, 0.0]), detector("b", vec![1.0, 0.0, 0.0])];
        let result = DetectionLoop::new(detectors, 2, Box::new(MockDetectionSink::new()));

        match result {
            Err(DetectorError::ShapeMismatch { name, expected, actual }) => {
                assert_eq!(name, "b");
                assert_eq!(expected, 2);
                assert_eq!(actual, 3);
            }
            _ => panic!("Expected ShapeMismatch error"),
        }
    }

    #[test]
    fn test_fans_out_to_every_detector() {
        let mut sink = MockDetectionSink::new();
        sink.expect_on_detect()
            .withf(|d| d.name == "bell")
            .times(1)
            .return_const(());
        sink.expect_on_detect()
            .withf(|d| d.name == "alarm")
            .times(1)
            .return_const(());

        let detectors = vec![detector("bell", vec![1.0, 0.0]), detector("alarm", vec![0.0, 1.0])];
        let mut lp = DetectionLoop::new(detectors, 2, Box::new(sink)).unwrap();
        let now = Instant::now();

        let bell = [1.0, 0.0];
        let alarm = [0.0, 1.0];
        let fired: Vec<usize> = [bell, bell, bell, alarm, alarm, alarm]
            .iter()
            .map(|s| lp.process(s, now))
            .collect();

        assert_eq!(fired, vec![0, 0, 1, 0, 0, 1]);
        assert_eq!(
            lp.stats(),
            &LoopStats {
                frames_processed: 6,
                detections: 2
            }
        );
    }

    #[test]
    fn test_simultaneous_matches() {
        let mut sink = MockDetectionSink::new();
        sink.expect_on_detect().times(2).return_const(());

        let detectors = vec![detector("a", vec![1.0, 0.0]), detector("b", vec![0.99, 0.141])];
        let mut lp = DetectionLoop::new(detectors, 2, Box::new(sink)).unwrap();
        let now = Instant::now();

        lp.process(&[1.0, 0.0], now);
        lp.process(&[1.0, 0.0], now);
        assert_eq!(lp.process(&[1.0, 0.0], now), 2);
    }

    #[test]
    fn test_run_stops_on_capture_error() {
        let mut sink = MockDetectionSink::new();
        sink.expect_on_detect().never();

        let mut lp =
            DetectionLoop::new(vec![detector("a", vec![1.0, 0.0])], 2, Box::new(sink)).unwrap();
        let stream = vec![
            Ok(vec![1.0, 0.0]),
            Err(CaptureError::Stream("device lost".to_string())),
            Ok(vec![1.0, 0.0]),
        ];

        assert!(matches!(lp.run(stream), Err(CaptureError::Stream(_))));
        assert_eq!(lp.stats().frames_processed, 1);
    }

    #[test]
    fn test_no_detectors() {
        let mut lp = DetectionLoop::new(Vec::new(), 2206, Box::new(MockDetectionSink::new())).unwrap();
        let stats = lp.run((0..4).map(|_| Ok(vec![0.0; 2206]))).unwrap();
        assert_eq!(stats.frames_processed, 4);
        assert_eq!(stats.detections, 0);
    }
}
