/// Sound detector library
///
/// Records reference spectra of short acoustic events (a doorbell, a kettle
/// whistle) and recognizes them in live microphone audio by cosine similarity
/// of magnitude spectra, with debounce and cooldown per sound.

pub mod audio;
pub mod config;
pub mod detection_loop;
pub mod detector;
pub mod notify;
pub mod recorder;
pub mod reference;
pub mod sink;
pub mod spectrum;

// Re-export main types
pub use audio::{
    AudioSample, CaptureError, Frame, FrameSource, MemorySource, MicrophoneSource,
    SpectrumStream, WavFileSource,
};
pub use config::{Config, ConfigError};
pub use detection_loop::{DetectionLoop, LoopStats};
pub use detector::{Detection, DetectorConfig, DetectorError, DetectorState, SoundDetector};
pub use notify::{dispatch_notifications, Heartbeat, NotifyError, WebhookNotifier};
pub use recorder::{ClipRecorder, RecorderConfig, RecorderError, RecorderState};
pub use reference::{ReferenceSpectrum, ReferenceStore, StorageError};
pub use sink::{ChannelSink, DetectionSink, FanoutSink, LogSink};
pub use spectrum::{SpectralExtractor, Spectrum};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging; `RUST_LOG` takes precedence over `debug`
pub fn init_logging(debug: bool) {
    let default_filter = if debug {
        "sound_detector=debug"
    } else {
        "sound_detector=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_configs_agree() {
        let config = Config::default();
        assert_eq!(
            config.detector_config().similarity_threshold,
            DetectorConfig::default().similarity_threshold
        );
        assert_eq!(
            config.recorder_config().min_energy_ratio,
            RecorderConfig::default().min_energy_ratio
        );
    }
}
