//! WAV encoding and file-backed audio source

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use super::capture::FramePipeline;
use super::{AudioSource, FrameSink};
use crate::{Error, Result};

/// Longest file the recognizer accepts as one sentence
pub const MAX_FILE_DURATION: Duration = Duration::from_secs(60);

/// Samples fed per pacing step (10 ms at 16 kHz)
const STEP_MS: u64 = 10;

/// Convert f32 samples to 16-bit mono WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;
        for &sample in samples {
            writer
                .write_sample(super::f32_to_i16(sample))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }
        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Decoded WAV contents as interleaved floats
#[derive(Debug, Clone)]
pub struct WavData {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl WavData {
    /// Playing time of the audio
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() / usize::from(self.channels.max(1));
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate.max(1)))
    }
}

/// Read a WAV stream (16-bit integer or 32-bit float)
///
/// # Errors
///
/// Returns `Error::Audio` if the data is not a supported WAV
pub fn read_wav<R: std::io::Read>(reader: R) -> Result<WavData> {
    let mut reader = hound::WavReader::new(reader).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| f32::from(v) / 32768.0))
            .collect::<std::result::Result<_, _>>(),
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>(),
        (format, bits) => {
            return Err(Error::Audio(format!(
                "unsupported WAV encoding: {format:?} {bits}-bit"
            )));
        }
    }
    .map_err(|e| Error::Audio(e.to_string()))?;

    Ok(WavData {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Streams a WAV file through the frame pipeline at real-time pace
pub struct WavFileSource {
    data: Arc<WavData>,
    frame_bytes: usize,
    paced: bool,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WavFileSource {
    /// Load a file, rejecting anything longer than [`MAX_FILE_DURATION`]
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or decoded, or is too long
    pub fn open(path: &Path, frame_bytes: usize) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let data = read_wav(std::io::BufReader::new(file))?;
        let source = Self::from_data(data, frame_bytes)?;

        tracing::debug!(
            path = %path.display(),
            duration_ms = source.duration().as_millis(),
            "wav source loaded"
        );
        Ok(source)
    }

    /// Wrap already-decoded audio
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if the audio is longer than [`MAX_FILE_DURATION`]
    pub fn from_data(data: WavData, frame_bytes: usize) -> Result<Self> {
        if data.duration() > MAX_FILE_DURATION {
            return Err(Error::Audio(format!(
                "audio is {:.1}s long; at most {}s is supported",
                data.duration().as_secs_f64(),
                MAX_FILE_DURATION.as_secs()
            )));
        }

        Ok(Self {
            data: Arc::new(data),
            frame_bytes,
            paced: true,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        })
    }

    /// Deliver as fast as possible instead of in real time
    #[must_use]
    pub const fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.data.duration()
    }
}

impl AudioSource for WavFileSource {
    fn start(&mut self, sink: Arc<dyn FrameSink>) -> Result<()> {
        if self.is_capturing() {
            return Ok(());
        }
        self.stop();

        let mut pipeline =
            FramePipeline::new(self.data.sample_rate, self.data.channels, self.frame_bytes)?;
        let data = Arc::clone(&self.data);
        let stop = Arc::clone(&self.stop);
        let paced = self.paced;
        stop.store(false, Ordering::SeqCst);

        let thread = std::thread::Builder::new()
            .name("parley-wav".to_string())
            .spawn(move || {
                let channels = usize::from(data.channels.max(1));
                let per_step = usize::try_from(u64::from(data.sample_rate) * STEP_MS / 1000)
                    .unwrap_or(160)
                    .max(1)
                    * channels;

                for chunk in data.samples.chunks(per_step) {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    pipeline.push(chunk, sink.as_ref());
                    if paced {
                        std::thread::sleep(Duration::from_millis(STEP_MS));
                    }
                }
                pipeline.finish(sink.as_ref());
                tracing::debug!("wav source drained");
            })
            .map_err(|e| Error::Audio(format!("failed to spawn wav thread: {e}")))?;

        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("wav source thread panicked");
        }
    }

    fn is_capturing(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for WavFileSource {
    fn drop(&mut self) {
        self.stop();
    }
}
