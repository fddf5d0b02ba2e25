/// Sound detector binary
///
/// With a NAME argument, records one reference sound and exits. Without one,
/// listens for every recorded sound until interrupted.

use anyhow::{bail, Context, Result};
use clap::Parser;
use sound_detector::spectrum::spectrum_len;
use sound_detector::{
    dispatch_notifications, init_logging, CaptureError, ChannelSink, ClipRecorder, Config,
    DetectionLoop, FanoutSink, FrameSource, Heartbeat, LogSink, MicrophoneSource, RecorderError,
    ReferenceStore, SoundDetector, Spectrum, SpectrumStream, WavFileSource, WebhookNotifier, VERSION,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sound-detector", version)]
#[command(about = "Record reference sounds and detect them in live audio", long_about = None)]
struct Cli {
    /// Record a reference sample under NAME and exit
    name: Option<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reference directory
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Read frames from a WAV file instead of the microphone
    #[arg(short, long, value_name = "WAV")]
    input: Option<PathBuf>,

    /// Notification URL template ({sound} is replaced by the sound name)
    #[arg(long, value_name = "URL")]
    notify_url: Option<String>,

    /// Liveness heartbeat URL
    #[arg(long, value_name = "URL")]
    heartbeat_url: Option<String>,

    /// Debug logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    /// CLI flags override every other configuration source
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.dir {
            config.references_dir = dir.clone();
        }
        if let Some(url) = &self.notify_url {
            config.notify_url = Some(url.clone());
        }
        if let Some(url) = &self.heartbeat_url {
            config.heartbeat_url = Some(url.clone());
        }
        if self.debug {
            config.debug = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);

    init_logging(config.debug);
    config.validate()?;

    info!("Starting sound detector v{}", VERSION);
    debug!("Configuration: {:?}", config);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, stopping");
                cancel.cancel();
            }
        }
    });

    let heartbeat = match &config.heartbeat_url {
        Some(url) => {
            let heartbeat = Heartbeat::new(
                url,
                config.heartbeat_payload.clone(),
                config.heartbeat_period(),
                config.http_timeout(),
            )
            .context("Invalid heartbeat URL")?;
            Some(tokio::spawn(heartbeat.run(cancel.clone())))
        }
        None => None,
    };

    let result = match cli.name {
        Some(name) => record(&config, name, cli.input, cancel.clone()).await,
        None => listen(&config, cli.input, cancel.clone()).await,
    };

    cancel.cancel();
    if let Some(task) = heartbeat {
        let _ = task.await;
    }

    result
}

fn open_source(
    input: Option<&Path>,
    sample_rate: u32,
    frame_duration: f64,
) -> Result<Box<dyn FrameSource>, CaptureError> {
    match input {
        Some(path) => {
            let source = WavFileSource::open(path, frame_duration)?;
            if source.sample_rate() != sample_rate {
                warn!(
                    "{} is sampled at {} Hz, configured rate is {} Hz",
                    path.display(),
                    source.sample_rate(),
                    sample_rate
                );
            }
            Ok(Box::new(source))
        }
        None => Ok(Box::new(MicrophoneSource::open(sample_rate, frame_duration)?)),
    }
}

/// Record one event and save its composite spectrum under `name`
async fn record(
    config: &Config,
    name: String,
    input: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<()> {
    let store = ReferenceStore::new(&config.references_dir);
    let path = store.path_for(&name)?;
    info!("Recording '{}' into {}", name, path.display());

    let recorder = ClipRecorder::with_config(config.recorder_config());
    let sample_rate = config.sample_rate;
    let frame_duration = config.record_frame_duration;
    let stream_cancel = cancel.clone();

    // cpal streams are not Send; the source lives on the blocking thread
    let result = tokio::task::spawn_blocking(move || -> Result<Spectrum, RecorderError> {
        let source = open_source(input.as_deref(), sample_rate, frame_duration)?;
        recorder.record(SpectrumStream::new(source, false, stream_cancel))
    })
    .await
    .context("Recording task failed")?;

    match result {
        Ok(composite) => {
            let path = store.save(&name, &composite)?;
            info!("Saved '{}' ({} bins) to {}", name, composite.len(), path.display());
            Ok(())
        }
        Err(RecorderError::Cancelled) if cancel.is_cancelled() => {
            warn!("Recording interrupted, nothing saved");
            Ok(())
        }
        Err(RecorderError::Cancelled) => {
            bail!("Input ended before a complete sound event was captured")
        }
        Err(e) => Err(e).context("Recording failed"),
    }
}

/// Listen for every stored reference until interrupted or input ends
async fn listen(config: &Config, input: Option<PathBuf>, cancel: CancellationToken) -> Result<()> {
    let store = ReferenceStore::new(&config.references_dir);
    let references = store
        .load_all()
        .context("Failed to load reference sounds")?;
    if references.is_empty() {
        warn!("Listening without reference sounds, nothing will be detected");
    }

    let detector_config = config.detector_config();
    let detectors = references
        .into_iter()
        .map(|reference| SoundDetector::new(Arc::new(reference), detector_config.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut sink = FanoutSink::new().with(LogSink);
    let mut dispatcher: Option<JoinHandle<u64>> = None;
    if let Some(template) = &config.notify_url {
        let notifier = WebhookNotifier::new(template.as_str(), config.http_timeout())
            .context("Invalid notification URL")?;
        let (channel, rx) = ChannelSink::channel();
        sink = sink.with(channel);
        dispatcher = Some(tokio::spawn(dispatch_notifications(rx, notifier)));
    }

    let sample_rate = config.sample_rate;
    let frame_duration = config.frame_duration;

    // The sink, and with it the notification queue, is dropped when the loop ends
    let outcome = tokio::task::spawn_blocking(move || -> Result<_> {
        let source = open_source(input.as_deref(), sample_rate, frame_duration)?;
        let mut detection_loop = DetectionLoop::new(
            detectors,
            spectrum_len(source.frame_len()),
            Box::new(sink),
        )?;

        info!("Listening");
        Ok(detection_loop.run(SpectrumStream::new(source, true, cancel))?)
    })
    .await
    .context("Detection task failed")?;

    // Deliver queued detections even when the loop stopped on a capture error
    if let Some(dispatcher) = dispatcher {
        let delivered = dispatcher.await.unwrap_or_default();
        debug!("{} notification(s) delivered", delivered);
    }

    let stats = outcome?;

    info!(
        "Stopped after {} frames, {} detection(s)",
        stats.frames_processed, stats.detections
    );
    Ok(())
}
