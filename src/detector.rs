/// Sound detector
///
/// Matches normalized live spectra against one reference spectrum by cosine
/// similarity. A detection fires once per sustained match (edge-triggered)
/// after a minimum streak of matching frames, and a cooldown starts when the
/// match ends.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Span};

use crate::reference::ReferenceSpectrum;
use crate::spectrum::dot;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Reference '{name}' has {actual} bins, live spectra have {expected}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Reference '{0}' is empty")]
    EmptyReference(String),
}

/// Detection result
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Name of the reference that matched
    pub name: String,

    /// Cosine similarity of the frame that fired
    pub similarity: f64,

    /// Length of the matching streak when it fired
    pub consecutive: u32,

    /// Wall-clock time of the detection (microseconds since epoch)
    pub timestamp_micros: i64,
}

/// Matching and debounce parameters
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Frames match when similarity is strictly above this value
    pub similarity_threshold: f64,

    /// Matching frames in a row required before firing
    pub min_consecutive_ok: u32,

    /// Minimum time between the end of one detection and the next
    pub trigger_min_interval: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
            min_consecutive_ok: 3,
            trigger_min_interval: Duration::from_secs(10),
        }
    }
}

impl DetectorConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !self.similarity_threshold.is_finite()
            || self.similarity_threshold < -1.0
            || self.similarity_threshold > 1.0
        {
            return Err(DetectorError::InvalidConfig(
                "similarity_threshold must be between -1.0 and 1.0".to_string(),
            ));
        }

        if self.min_consecutive_ok == 0 {
            return Err(DetectorError::InvalidConfig(
                "min_consecutive_ok must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Per-reference debounce state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectorState {
    pub consecutive_match_count: u32,
    pub is_triggered: bool,
    pub cooldown_until: Option<Instant>,
}

/// Detector for one reference sound
pub struct SoundDetector {
    reference: Arc<ReferenceSpectrum>,
    config: DetectorConfig,
    state: DetectorState,
    span: Span,
}

impl SoundDetector {
    pub fn new(
        reference: Arc<ReferenceSpectrum>,
        config: DetectorConfig,
    ) -> Result<Self, DetectorError> {
        config.validate()?;

        if reference.is_empty() {
            return Err(DetectorError::EmptyReference(reference.name().to_string()));
        }

        let span = info_span!("detector", sound = %reference.name());
        span.in_scope(|| {
            debug!(
                "Initializing detector ({} bins, threshold {}, streak {})",
                reference.len(),
                config.similarity_threshold,
                config.min_consecutive_ok
            )
        });

        Ok(Self {
            reference,
            config,
            state: DetectorState::default(),
            span,
        })
    }

    /// Compare a normalized live spectrum against the reference, now
    pub fn compare(&mut self, spectrum: &[f64]) -> Option<Detection> {
        self.compare_at(spectrum, Instant::now())
    }

    /// Compare a normalized live spectrum observed at `now`.
    ///
    /// Returns the detection when this frame fires.
    ///
    /// # Panics
    ///
    /// Panics if `spectrum` and the reference differ in length.
    pub fn compare_at(&mut self, spectrum: &[f64], now: Instant) -> Option<Detection> {
        let _enter = self.span.enter();

        let similarity = dot(self.reference.values(), spectrum);
        let state = &mut self.state;

        if similarity > self.config.similarity_threshold {
            state.consecutive_match_count = state.consecutive_match_count.saturating_add(1);

            if state.consecutive_match_count >= self.config.min_consecutive_ok {
                debug!(
                    "+ streak={} similarity={:.3}",
                    state.consecutive_match_count, similarity
                );

                let cooled_down = state.cooldown_until.map_or(true, |until| now >= until);
                if !state.is_triggered && cooled_down {
                    state.is_triggered = true;
                    info!("Detected (similarity {:.3})", similarity);

                    return Some(Detection {
                        name: self.reference.name().to_string(),
                        similarity,
                        consecutive: state.consecutive_match_count,
                        timestamp_micros: current_timestamp_micros(),
                    });
                }
            }
        } else {
            if state.consecutive_match_count > self.config.min_consecutive_ok {
                info!(
                    "- match ended after {} frames",
                    state.consecutive_match_count
                );
            }
            state.consecutive_match_count = 0;

            if state.is_triggered {
                match now.checked_add(self.config.trigger_min_interval) {
                    Some(until) => {
                        state.is_triggered = false;
                        state.cooldown_until = Some(until);
                        info!(
                            "Next trigger allowed in {:?}",
                            self.config.trigger_min_interval
                        );
                    }
                    // Cooldown past the end of the clock: stay triggered for good
                    None => warn!(
                        "Cooldown of {:?} cannot be scheduled, detector will not fire again",
                        self.config.trigger_min_interval
                    ),
                }
            }
        }

        None
    }

    /// Display name of the reference
    pub fn name(&self) -> &str {
        self.reference.name()
    }

    pub fn reference(&self) -> &Arc<ReferenceSpectrum> {
        &self.reference
    }

    pub fn state(&self) -> &DetectorState {
        &self.state
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }
}

/// Get current timestamp in microseconds
fn current_timestamp_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> SoundDetector {
        let reference = ReferenceSpectrum::new("doorbell", vec![1.0, 0.0]);
        SoundDetector::new(Arc::new(reference), DetectorConfig::default()).unwrap()
    }

    /// Unit vector whose similarity with [1, 0] is `p`
    fn with_similarity(p: f64) -> Vec<f64> {
        vec![p, (1.0 - p * p).sqrt()]
    }

    #[test]
    fn test_config_validation() {
        let mut config = DetectorConfig::default();
        assert!(config.validate().is_ok());

        config.similarity_threshold = 1.5;
        assert!(config.validate().is_err());

        config.similarity_threshold = 0.8;
        config.min_consecutive_ok = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_reference_rejected() {
        let reference = Arc::new(ReferenceSpectrum::new("empty", vec![]));
        let result = SoundDetector::new(reference, DetectorConfig::default());
        assert!(matches!(result, Err(DetectorError::EmptyReference(_))));
    }

    #[test]
    fn test_fires_once_on_third_frame() {
        let mut det = detector();
        let now = Instant::now();

        let fired: Vec<bool> = [0.9, 0.9, 0.9, 0.2]
            .iter()
            .map(|&p| det.compare_at(&with_similarity(p), now).is_some())
            .collect();

        assert_eq!(fired, vec![false, false, true, false]);
    }

    #[test]
    fn test_sustained_match_is_edge_triggered() {
        let mut det = detector();
        let now = Instant::now();

        let detections = (0..50)
            .filter_map(|_| det.compare_at(&[1.0, 0.0], now))
            .count();

        assert_eq!(detections, 1);
        assert!(det.state().is_triggered);
        assert_eq!(det.state().consecutive_match_count, 50);
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut det = detector();
        let now = Instant::now();
        for _ in 0..5 {
            assert!(det.compare_at(&with_similarity(0.8), now).is_none());
        }
        assert_eq!(det.state().consecutive_match_count, 0);
    }

    #[test]
    fn test_interrupted_streak_resets() {
        let mut det = detector();
        let now = Instant::now();

        det.compare_at(&[1.0, 0.0], now);
        det.compare_at(&[1.0, 0.0], now);
        det.compare_at(&[0.0, 1.0], now);
        assert_eq!(det.state().consecutive_match_count, 0);

        // Not triggered, so no cooldown is armed
        assert_eq!(det.state().cooldown_until, None);
        assert!(det.compare_at(&[1.0, 0.0], now).is_none());
        assert!(det.compare_at(&[1.0, 0.0], now).is_none());
        assert!(det.compare_at(&[1.0, 0.0], now).is_some());
    }

    #[test]
    fn test_cooldown_blocks_then_allows() {
        let mut det = detector();
        let start = Instant::now();

        for _ in 0..3 {
            det.compare_at(&[1.0, 0.0], start);
        }
        det.compare_at(&[0.0, 1.0], start);
        assert_eq!(
            det.state().cooldown_until,
            Some(start + Duration::from_secs(10))
        );
        assert!(!det.state().is_triggered);

        // Streak inside the cooldown window
        let early = start + Duration::from_secs(5);
        for _ in 0..5 {
            assert!(det.compare_at(&[1.0, 0.0], early).is_none());
        }
        assert!(!det.state().is_triggered);

        // Same streak continuing past the window fires
        let late = start + Duration::from_secs(10);
        let detection = det.compare_at(&[1.0, 0.0], late).unwrap();
        assert_eq!(detection.name, "doorbell");
        assert_eq!(detection.consecutive, 6);
    }

    #[test]
    fn test_unschedulable_cooldown_disarms_for_good() {
        let config = DetectorConfig {
            trigger_min_interval: Duration::MAX,
            ..DetectorConfig::default()
        };
        let reference = ReferenceSpectrum::new("doorbell", vec![1.0, 0.0]);
        let mut det = SoundDetector::new(Arc::new(reference), config).unwrap();
        let now = Instant::now();

        for _ in 0..3 {
            det.compare_at(&[1.0, 0.0], now);
        }
        det.compare_at(&[0.0, 1.0], now);
        assert!(det.state().is_triggered);
        assert_eq!(det.state().cooldown_until, None);

        let later = now + Duration::from_secs(3600);
        for _ in 0..5 {
            assert!(det.compare_at(&[1.0, 0.0], later).is_none());
        }
    }

    #[test]
    fn test_detection_fields() {
        let mut det = detector();
        let now = Instant::now();
        det.compare_at(&with_similarity(0.95), now);
        det.compare_at(&with_similarity(0.95), now);
        let detection = det.compare_at(&with_similarity(0.95), now).unwrap();

        assert_eq!(detection.name, "doorbell");
        assert_eq!(detection.consecutive, 3);
        assert!((detection.similarity - 0.95).abs() < 1e-9);
        assert!(detection.timestamp_micros > 0);
    }

    #[test]
    fn test_nan_spectrum_never_matches() {
        let mut det = detector();
        let now = Instant::now();
        for _ in 0..5 {
            assert!(det.compare_at(&[f64::NAN, f64::NAN], now).is_none());
        }
        assert_eq!(det.state().consecutive_match_count, 0);
    }

    #[test]
    #[should_panic(expected = "spectrum length mismatch")]
    fn test_shape_mismatch_fails_fast() {
        let mut det = detector();
        det.compare(&[1.0, 0.0, 0.0]);
    }
}
