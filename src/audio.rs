/// Audio frame sources
///
/// Wraps an audio input into a pull-based sequence of fixed-size mono PCM
/// frames. The microphone source feeds a lock-free ring buffer from the
/// device callback; pulls block until a whole frame is available.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SampleRate, SizedSample, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::spectrum::{frame_len, SpectralExtractor, Spectrum};

/// Audio sample format (f32 in -1.0..=1.0)
pub type AudioSample = f32;

/// One fixed-length block of mono samples
pub type Frame = Vec<AudioSample>;

/// Only mono capture is supported
pub const CHANNELS: u16 = 1;

/// Ring capacity in frames
const RING_FRAMES: usize = 8;

/// Sleep between ring buffer polls while waiting for a frame
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Give up on a device that stops delivering samples
const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No input device available")]
    NoDevice,

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("No audio received for {0:?}")]
    Timeout(Duration),

    #[error("Invalid frame duration: {0}s")]
    InvalidFrameDuration(f64),

    #[error("WAV file error: {0}")]
    Wav(#[from] hound::Error),
}

/// Pull-based producer of fixed-size frames
pub trait FrameSource {
    /// Block until the next frame is available.
    ///
    /// Returns `Ok(None)` once a finite source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Samples per frame
    fn frame_len(&self) -> usize;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).next_frame()
    }

    fn frame_len(&self) -> usize {
        (**self).frame_len()
    }
}

impl<S: FrameSource + ?Sized> FrameSource for &mut S {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).next_frame()
    }

    fn frame_len(&self) -> usize {
        (**self).frame_len()
    }
}

fn checked_frame_len(sample_rate: u32, duration_secs: f64) -> Result<usize, CaptureError> {
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return Err(CaptureError::InvalidFrameDuration(duration_secs));
    }
    let len = frame_len(sample_rate, duration_secs);
    if len < 2 {
        return Err(CaptureError::InvalidFrameDuration(duration_secs));
    }
    Ok(len)
}

/// Convert a device sample to f32 in -1.0..=1.0
fn to_audio_sample<T: Sample>(sample: T) -> AudioSample
where
    AudioSample: FromSample<T>,
{
    AudioSample::from_sample(sample)
}

type RingBuffer = HeapRb<AudioSample>;
type RingProducer = <RingBuffer as Split>::Prod;
type RingConsumer = <RingBuffer as Split>::Cons;

/// Live microphone input via the default cpal host and input device
pub struct MicrophoneSource {
    // Dropping the stream stops the device callback
    _stream: cpal::Stream,
    consumer: RingConsumer,
    frame_len: usize,
    sample_rate: u32,
    stream_failed: Arc<AtomicBool>,
    overruns: Arc<AtomicUsize>,
    reported_overruns: usize,
}

impl MicrophoneSource {
    /// Open the default input device as a mono stream at `sample_rate`
    pub fn open(sample_rate: u32, frame_duration: f64) -> Result<Self, CaptureError> {
        let frame_len = checked_frame_len(sample_rate, frame_duration)?;

        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;
        let device_name = device.name().unwrap_or_else(|_| "<unknown>".to_string());

        let sample_format = device
            .default_input_config()
            .map_err(|e| CaptureError::Device(format!("Failed to query input config: {}", e)))?
            .sample_format();

        let config = StreamConfig {
            channels: CHANNELS,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let capacity = (frame_len * RING_FRAMES).max(sample_rate as usize);
        let (producer, consumer) = RingBuffer::new(capacity).split();
        let stream_failed = Arc::new(AtomicBool::new(false));
        let overruns = Arc::new(AtomicUsize::new(0));

        let stream = match sample_format {
            SampleFormat::F32 => Self::build_stream::<f32>(
                &device,
                &config,
                producer,
                stream_failed.clone(),
                overruns.clone(),
            ),
            SampleFormat::I16 => Self::build_stream::<i16>(
                &device,
                &config,
                producer,
                stream_failed.clone(),
                overruns.clone(),
            ),
            SampleFormat::U16 => Self::build_stream::<u16>(
                &device,
                &config,
                producer,
                stream_failed.clone(),
                overruns.clone(),
            ),
            other => return Err(CaptureError::UnsupportedFormat(format!("{:?}", other))),
        }?;

        stream
            .play()
            .map_err(|e| CaptureError::Stream(format!("Failed to start stream: {}", e)))?;

        info!(
            "Capturing from '{}' at {} Hz, {} samples per frame ({:?})",
            device_name, sample_rate, frame_len, sample_format
        );

        Ok(Self {
            _stream: stream,
            consumer,
            frame_len,
            sample_rate,
            stream_failed,
            overruns,
            reported_overruns: 0,
        })
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut producer: RingProducer,
        stream_failed: Arc<AtomicBool>,
        overruns: Arc<AtomicUsize>,
    ) -> Result<cpal::Stream, CaptureError>
    where
        T: SizedSample + Send + 'static,
        f32: FromSample<T>,
    {
        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let pushed = producer.push_iter(data.iter().map(|&s| to_audio_sample(s)));
                    if pushed < data.len() {
                        overruns.fetch_add(data.len() - pushed, Ordering::Relaxed);
                    }
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                    stream_failed.store(true, Ordering::Release);
                },
                None,
            )
            .map_err(|e| CaptureError::Stream(format!("Failed to build stream: {}", e)))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn report_overruns(&mut self) {
        let total = self.overruns.load(Ordering::Relaxed);
        if total > self.reported_overruns {
            warn!(
                "Ring buffer full, dropped {} samples",
                total - self.reported_overruns
            );
            self.reported_overruns = total;
        }
    }
}

impl FrameSource for MicrophoneSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let started = Instant::now();

        loop {
            if self.stream_failed.load(Ordering::Acquire) {
                return Err(CaptureError::Stream(
                    "input stream reported an error".to_string(),
                ));
            }

            if self.consumer.occupied_len() >= self.frame_len {
                let mut frame = vec![0.0; self.frame_len];
                let read = self.consumer.pop_slice(&mut frame);
                frame.truncate(read);
                self.report_overruns();
                return Ok(Some(frame));
            }

            if started.elapsed() > READ_TIMEOUT {
                return Err(CaptureError::Timeout(READ_TIMEOUT));
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn frame_len(&self) -> usize {
        self.frame_len
    }
}

/// Frames read from a WAV file (first channel only)
///
/// A trailing partial frame is dropped.
pub struct WavFileSource {
    samples: Vec<AudioSample>,
    position: usize,
    frame_len: usize,
    sample_rate: u32,
}

impl WavFileSource {
    pub fn open<P: AsRef<Path>>(path: P, frame_duration: f64) -> Result<Self, CaptureError> {
        let mut reader = hound::WavReader::open(path.as_ref())?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<AudioSample> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()?
            }
        };

        let samples: Vec<AudioSample> = interleaved.into_iter().step_by(channels).collect();
        let frame_len = checked_frame_len(spec.sample_rate, frame_duration)?;

        debug!(
            "Loaded {} samples from {} ({} Hz, {} channels)",
            samples.len(),
            path.as_ref().display(),
            spec.sample_rate,
            spec.channels
        );

        Ok(Self {
            samples,
            position: 0,
            frame_len,
            sample_rate: spec.sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl FrameSource for WavFileSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let end = self.position + self.frame_len;
        if end > self.samples.len() {
            return Ok(None);
        }
        let frame = self.samples[self.position..end].to_vec();
        self.position = end;
        Ok(Some(frame))
    }

    fn frame_len(&self) -> usize {
        self.frame_len
    }
}

/// Frames held in memory, replayed in order
pub struct MemorySource {
    frames: VecDeque<Frame>,
    frame_len: usize,
}

impl MemorySource {
    pub fn new(frames: Vec<Frame>) -> Self {
        let frame_len = frames.first().map(Vec::len).unwrap_or(0);
        Self {
            frames: frames.into(),
            frame_len,
        }
    }
}

impl FrameSource for MemorySource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        Ok(self.frames.pop_front())
    }

    fn frame_len(&self) -> usize {
        self.frame_len
    }
}

/// Cancellable stream of spectra pulled from a frame source
///
/// The token is polled once per frame; the stream ends on cancellation,
/// at end of input, or right after yielding a capture error.
pub struct SpectrumStream<S> {
    source: S,
    extractor: SpectralExtractor,
    normalize: bool,
    cancel: CancellationToken,
    finished: bool,
}

impl<S: FrameSource> SpectrumStream<S> {
    pub fn new(source: S, normalize: bool, cancel: CancellationToken) -> Self {
        Self {
            source,
            extractor: SpectralExtractor::new(),
            normalize,
            cancel,
            finished: false,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: FrameSource> Iterator for SpectrumStream<S> {
    type Item = Result<Spectrum, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if self.cancel.is_cancelled() {
            debug!("Spectrum stream cancelled");
            self.finished = true;
            return None;
        }

        match self.source.next_frame() {
            Ok(Some(frame)) => Some(Ok(self.extractor.extract(&frame, self.normalize))),
            Ok(None) => {
                debug!("Frame source exhausted");
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::spectrum::energy;

    fn write_wav(path: &Path, channels: u16, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_invalid_frame_duration() {
        assert!(checked_frame_len(44100, 0.0).is_err());
        assert!(checked_frame_len(44100, -1.0).is_err());
        assert!(checked_frame_len(44100, f64::NAN).is_err());
        assert!(checked_frame_len(10, 0.1).is_err());
        assert_eq!(checked_frame_len(44100, 0.1).unwrap(), 4410);
    }

    #[test]
    fn test_device_sample_conversion() {
        assert_relative_eq!(to_audio_sample(0.25f32), 0.25);
        assert_relative_eq!(to_audio_sample(i16::MIN), -1.0);
        assert_relative_eq!(to_audio_sample(i16::MAX), 1.0, epsilon = 1e-4);
        assert_relative_eq!(to_audio_sample(u16::MAX / 2 + 1), 0.0);
    }

    #[test]
    fn test_memory_source_replays_in_order() {
        let mut source = MemorySource::new(vec![vec![1.0; 4], vec![2.0; 4]]);
        assert_eq!(source.frame_len(), 4);
        assert_eq!(source.next_frame().unwrap(), Some(vec![1.0; 4]));
        assert_eq!(source.next_frame().unwrap(), Some(vec![2.0; 4]));
        assert_eq!(source.next_frame().unwrap(), None);
    }

    #[test]
    fn test_wav_source_frames_and_first_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");

        // Left channel carries the signal, right channel is silent
        let mut interleaved = Vec::new();
        for i in 0..2000 {
            interleaved.push(if i % 2 == 0 { i16::MAX / 2 } else { -(i16::MAX / 2) });
            interleaved.push(0);
        }
        write_wav(&path, 2, &interleaved);

        // 0.1s at 8 kHz = 800 samples; 2000 samples -> 2 whole frames
        let mut source = WavFileSource::open(&path, 0.1).unwrap();
        assert_eq!(source.sample_rate(), 8000);
        assert_eq!(source.frame_len(), 800);

        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.len(), 800);
        assert_relative_eq!(frame[0], 0.5, epsilon = 1e-3);
        assert_relative_eq!(frame[1], -0.5, epsilon = 1e-3);

        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_wav_source_missing_file() {
        let result = WavFileSource::open("/nonexistent/clip.wav", 0.1);
        assert!(matches!(result, Err(CaptureError::Wav(_))));
    }

    #[test]
    fn test_spectrum_stream_normalizes() {
        let frames = vec![vec![0.0, 1.0, 0.0, -1.0]; 3];
        let stream = SpectrumStream::new(MemorySource::new(frames), true, CancellationToken::new());

        let spectra: Vec<Spectrum> = stream.map(|s| s.unwrap()).collect();
        assert_eq!(spectra.len(), 3);
        for spectrum in &spectra {
            assert_eq!(spectrum.len(), 3);
            assert_relative_eq!(energy(spectrum), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_spectrum_stream_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let frames = vec![vec![0.5; 16]; 10];
        let mut stream = SpectrumStream::new(MemorySource::new(frames), false, cancel.clone());

        assert!(stream.next().is_some());
        assert!(stream.next().is_some());
        cancel.cancel();
        assert!(stream.next().is_none());
        assert!(stream.next().is_none());
    }

    struct FailingSource;

    impl FrameSource for FailingSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            Err(CaptureError::Stream("device unplugged".to_string()))
        }

        fn frame_len(&self) -> usize {
            16
        }
    }

    #[test]
    fn test_spectrum_stream_ends_after_error() {
        let mut stream = SpectrumStream::new(FailingSource, false, CancellationToken::new());
        assert!(matches!(stream.next(), Some(Err(CaptureError::Stream(_)))));
        assert!(stream.next().is_none());
    }
}
