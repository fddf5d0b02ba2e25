/// Detection sinks
///
/// A sink receives every detection fired by the detection loop. Sinks run on
/// the audio thread, so anything slow (network calls) goes through
/// [`ChannelSink`] and is handled by an async consumer instead.

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::detector::Detection;

/// Receiver of detection events
#[cfg_attr(test, mockall::automock)]
pub trait DetectionSink: Send {
    fn on_detect(&self, detection: &Detection);
}

impl<F> DetectionSink for F
where
    F: Fn(&Detection) + Send,
{
    fn on_detect(&self, detection: &Detection) {
        self(detection)
    }
}

/// Logs each detection
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DetectionSink for LogSink {
    fn on_detect(&self, detection: &Detection) {
        info!(
            "Sound detected: '{}' (similarity {:.3}, {} frames)",
            detection.name, detection.similarity, detection.consecutive
        );
    }
}

/// Queues detections on an unbounded channel for an async consumer
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Detection>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Detection>) -> Self {
        Self { tx }
    }

    /// Create a sink together with the receiving end of its queue
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Detection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DetectionSink for ChannelSink {
    fn on_detect(&self, detection: &Detection) {
        if let Err(e) = self.tx.send(detection.clone()) {
            error!("Failed to queue detection '{}': {}", detection.name, e);
        }
    }
}

/// Forwards each detection to several sinks, in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn DetectionSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl DetectionSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl DetectionSink for FanoutSink {
    fn on_detect(&self, detection: &Detection) {
        for sink in &self.sinks {
            sink.on_detect(detection);
        }
    }
}
