//! Audio playback to speakers

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::resample::LinearResampler;
use super::wav::read_wav;
use crate::{Error, Result};

/// Give up when the device stops consuming samples for this long
const STALL_TIMEOUT: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Mono samples ready for playback
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate.max(1)))
    }
}

/// Decode WAV or MP3 bytes to mono samples
///
/// # Errors
///
/// Returns `Error::Audio` if the data cannot be decoded
pub fn decode_audio(bytes: &[u8]) -> Result<DecodedAudio> {
    if bytes.starts_with(b"RIFF") {
        let wav = read_wav(Cursor::new(bytes))?;
        return Ok(DecodedAudio {
            samples: super::downmix(&wav.samples, usize::from(wav.channels)),
            sample_rate: wav.sample_rate,
        });
    }
    decode_mp3(bytes)
}

/// Decode MP3 bytes to mono f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);
                let pcm: Vec<f32> = frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(super::downmix(&pcm, frame.channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Audio("no audio frames decoded".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Shared pause/stop switches for an in-progress playback
#[derive(Debug, Clone, Default)]
pub struct PlaybackControl {
    paused: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl PlaybackControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// End playback; the playing call returns promptly
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Plays audio to an output device
#[derive(Debug, Clone, Default)]
pub struct AudioPlayback {
    device_name: Option<String>,
}

impl AudioPlayback {
    #[must_use]
    pub const fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    /// Play samples to completion, honouring pause and stop
    ///
    /// Blocks the calling thread; run it on a blocking worker.
    ///
    /// # Errors
    ///
    /// Returns error if no output device can be opened or the device stalls
    pub fn play_blocking(&self, audio: &DecodedAudio, control: &PlaybackControl) -> Result<()> {
        if audio.samples.is_empty() || control.is_stopped() {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = match &self.device_name {
            Some(wanted) => host
                .output_devices()
                .map_err(|e| Error::Audio(e.to_string()))?
                .find(|d| d.name().is_ok_and(|n| n.contains(wanted.as_str())))
                .ok_or_else(|| Error::Audio(format!("output device not found: {wanted}")))?,
            None => host
                .default_output_device()
                .ok_or_else(|| Error::Audio("no output device available".to_string()))?,
        };

        let (config, samples) = output_config(&device, audio)?;
        let channels = usize::from(config.channels.max(1));

        let samples = Arc::new(samples);
        let position = Arc::new(AtomicUsize::new(0));

        let stream = {
            let samples = Arc::clone(&samples);
            let position = Arc::clone(&position);
            let control = control.clone();
            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        if control.is_paused() || control.is_stopped() {
                            data.fill(0.0);
                            return;
                        }
                        let mut pos = position.load(Ordering::Relaxed);
                        for frame in data.chunks_mut(channels) {
                            let sample = samples.get(pos).copied().unwrap_or(0.0);
                            frame.fill(sample);
                            if pos < samples.len() {
                                pos += 1;
                            }
                        }
                        position.store(pos, Ordering::Relaxed);
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                )
                .map_err(|e| Error::Audio(e.to_string()))?
        };

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        tracing::debug!(
            samples = samples.len(),
            sample_rate = config.sample_rate.0,
            channels,
            "playback started"
        );

        let mut last_pos = 0;
        let mut last_progress = Instant::now();
        let outcome = loop {
            if control.is_stopped() {
                tracing::debug!("playback stopped");
                break Ok(());
            }

            let pos = position.load(Ordering::Relaxed);
            if pos >= samples.len() {
                break Ok(());
            }

            if pos != last_pos || control.is_paused() {
                last_pos = pos;
                last_progress = Instant::now();
            } else if last_progress.elapsed() > STALL_TIMEOUT {
                break Err(Error::Audio("output device stalled".to_string()));
            }

            std::thread::sleep(POLL_INTERVAL);
        };

        // Let the device drain its last buffer
        if outcome.is_ok() && !control.is_stopped() {
            std::thread::sleep(Duration::from_millis(100));
        }

        drop(stream);
        tracing::debug!(played = position.load(Ordering::Relaxed), "playback complete");
        outcome
    }
}

/// Pick an output config for the audio, resampling if the device cannot run
/// at its native rate
fn output_config(device: &cpal::Device, audio: &DecodedAudio) -> Result<(StreamConfig, Vec<f32>)> {
    let rate = SampleRate(audio.sample_rate);
    let native = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .min_by_key(cpal::SupportedStreamConfigRange::channels);

    if let Some(range) = native {
        return Ok((range.with_sample_rate(rate).config(), audio.samples.clone()));
    }

    let fallback = device
        .default_output_config()
        .map_err(|e| Error::Audio(e.to_string()))?;
    if fallback.sample_format() != cpal::SampleFormat::F32 {
        return Err(Error::Audio("no float output config available".to_string()));
    }

    let device_rate = fallback.sample_rate().0;
    let mut resampler = LinearResampler::new(audio.sample_rate, device_rate)?;
    let mut samples = resampler.process(&audio.samples)?;
    samples.extend(resampler.flush()?);

    tracing::debug!(from = audio.sample_rate, to = device_rate, "resampling for output");
    Ok((fallback.config(), samples))
}
