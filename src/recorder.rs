/// Reference clip recorder
///
/// Isolates a single acoustic event from a stream of raw magnitude spectra
/// using energy thresholds relative to the ambient level, and accumulates
/// the event into one normalized composite spectrum.

use thiserror::Error;
use tracing::{debug, info, info_span, trace, Span};

use crate::audio::CaptureError;
use crate::spectrum::{energy, l2_normalize, Spectrum};

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Recording cancelled before the event ended")]
    Cancelled,

    #[error("Recording not finished (state: {0:?})")]
    NotFinished(RecorderState),

    #[error("Captured event is empty: no frames left after discarding the boundaries")]
    EmptyEvent,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),
}

/// Recorder configuration
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Frames discarded while the device settles
    pub warmup_frames: usize,

    /// Onset when frame energy exceeds ambient energy times this ratio
    pub min_energy_ratio: f64,

    /// Offset when frame energy drops below ambient energy times this ratio
    pub offset_energy_ratio: f64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            warmup_frames: 5,
            min_energy_ratio: 100.0,
            offset_energy_ratio: 2.0,
        }
    }
}

impl RecorderConfig {
    pub fn validate(&self) -> Result<(), RecorderError> {
        if !(self.min_energy_ratio.is_finite() && self.min_energy_ratio > 0.0) {
            return Err(RecorderError::InvalidConfig(
                "min_energy_ratio must be a positive number".to_string(),
            ));
        }

        if !(self.offset_energy_ratio.is_finite() && self.offset_energy_ratio > 0.0) {
            return Err(RecorderError::InvalidConfig(
                "offset_energy_ratio must be a positive number".to_string(),
            ));
        }

        Ok(())
    }
}

/// Recorder state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// Discarding the first frames
    Warmup,

    /// Next frame sets the ambient energy
    Calibrating,

    /// Waiting for onset
    Idle,

    /// Accumulating the event
    Capturing,

    /// Event ended (terminal)
    Done,
}

/// Single-event recorder
pub struct ClipRecorder {
    config: RecorderConfig,
    state: RecorderState,
    frames_seen: usize,
    ambient_energy: f64,
    accumulator: Option<Spectrum>,
    prev: Option<Spectrum>,
    frames_kept: usize,
    span: Span,
}

impl ClipRecorder {
    pub fn new() -> Self {
        Self::with_config(RecorderConfig::default())
    }

    pub fn with_config(config: RecorderConfig) -> Self {
        let span = info_span!("recorder");
        span.in_scope(|| debug!("Initializing recorder with config: {:?}", config));

        Self {
            state: if config.warmup_frames == 0 {
                RecorderState::Calibrating
            } else {
                RecorderState::Warmup
            },
            config,
            frames_seen: 0,
            ambient_energy: 0.0,
            accumulator: None,
            prev: None,
            frames_kept: 0,
            span,
        }
    }

    /// Process one raw (unnormalized) spectrum and return the new state
    pub fn push(&mut self, frame: &[f64]) -> RecorderState {
        let span = self.span.clone();
        let _enter = span.enter();

        let e = energy_checked(frame, self.accumulator.as_deref());
        trace!("Frame {}: energy={:.6e}, state={:?}", self.frames_seen, e, self.state);

        match self.state {
            RecorderState::Warmup => {
                if self.frames_seen + 1 >= self.config.warmup_frames {
                    self.state = RecorderState::Calibrating;
                }
            }

            RecorderState::Calibrating => {
                self.ambient_energy = e;
                self.accumulator = Some(vec![0.0; frame.len()]);
                self.state = RecorderState::Idle;
                info!("Waiting for sound (ambient energy {:.6e})", e);
            }

            RecorderState::Idle => {
                // The onset frame is an attack transient; it only becomes `prev`
                if e > self.ambient_energy * self.config.min_energy_ratio {
                    self.state = RecorderState::Capturing;
                    info!("Capturing");
                    debug!("State: Idle -> Capturing (energy {:.6e})", e);
                }
            }

            RecorderState::Capturing => {
                if e < self.ambient_energy * self.config.offset_energy_ratio {
                    // The frame straddling the offset is unreliable
                    if let (Some(acc), Some(prev)) = (self.accumulator.as_mut(), self.prev.as_ref()) {
                        for (a, p) in acc.iter_mut().zip(prev) {
                            *a -= p;
                        }
                    }
                    self.frames_kept = self.frames_kept.saturating_sub(1);
                    self.state = RecorderState::Done;
                    info!("Capturing done");
                    debug!("State: Capturing -> Done ({} frames kept)", self.frames_kept);
                } else if let Some(acc) = self.accumulator.as_mut() {
                    for (a, f) in acc.iter_mut().zip(frame) {
                        *a += f;
                    }
                    self.frames_kept += 1;
                }
            }

            RecorderState::Done => {}
        }

        self.prev = Some(frame.to_vec());
        self.frames_seen += 1;

        self.state
    }

    /// Normalized composite spectrum of the captured event
    pub fn finish(self) -> Result<Spectrum, RecorderError> {
        if self.state != RecorderState::Done {
            return Err(RecorderError::NotFinished(self.state));
        }

        let mut composite = self.accumulator.unwrap_or_default();
        if self.frames_kept == 0 || !(energy(&composite) > 0.0) {
            return Err(RecorderError::EmptyEvent);
        }

        l2_normalize(&mut composite);
        Ok(composite)
    }

    /// Drive the recorder from a spectrum stream until the event ends.
    ///
    /// Stops pulling as soon as the recorder reaches `Done`. A stream that
    /// ends first (cancellation or end of input) yields `Cancelled`.
    pub fn record<I>(mut self, spectra: I) -> Result<Spectrum, RecorderError>
    where
        I: IntoIterator<Item = Result<Spectrum, CaptureError>>,
    {
        for spectrum in spectra {
            if self.push(&spectrum?) == RecorderState::Done {
                return self.finish();
            }
        }

        Err(RecorderError::Cancelled)
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Ambient energy measured during calibration
    pub fn ambient_energy(&self) -> f64 {
        self.ambient_energy
    }

    /// Frames currently contributing to the composite
    pub fn frames_kept(&self) -> usize {
        self.frames_kept
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }
}

impl Default for ClipRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame energy, asserting the frame matches the accumulator shape
fn energy_checked(frame: &[f64], accumulator: Option<&[f64]>) -> f64 {
    if let Some(acc) = accumulator {
        assert_eq!(
            acc.len(),
            frame.len(),
            "spectrum length changed mid-recording: {} vs {}",
            acc.len(),
            frame.len()
        );
    }
    energy(frame)
}
