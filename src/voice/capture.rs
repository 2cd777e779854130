//! Audio capture from microphone
//!
//! cpal streams cannot move between threads, so each capture session owns a
//! dedicated thread that opens the device, converts the callback buffers and
//! hands finished frames to the sink.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, SupportedStreamConfig};

use super::frame::{FrameChunker, f32_to_i16};
use super::resample::{LinearResampler, downmix};
use super::{AudioSource, FrameSink, SAMPLE_RATE};
use crate::config::AudioConfig;
use crate::{Error, Result};

/// Converts interleaved device samples into wire frames
pub(super) struct FramePipeline {
    channels: usize,
    resampler: LinearResampler,
    chunker: FrameChunker,
}

impl FramePipeline {
    pub(super) fn new(from_rate: u32, channels: u16, frame_bytes: usize) -> Result<Self> {
        Ok(Self {
            channels: usize::from(channels.max(1)),
            resampler: LinearResampler::new(from_rate, SAMPLE_RATE)?,
            chunker: FrameChunker::new(frame_bytes),
        })
    }

    pub(super) fn push(&mut self, interleaved: &[f32], sink: &dyn FrameSink) {
        let mono = downmix(interleaved, self.channels);
        match self.resampler.process(&mono) {
            Ok(resampled) => self.emit(&resampled, sink),
            Err(e) => tracing::warn!(error = %e, "dropping capture buffer"),
        }
    }

    /// Drain the resampler and send the trailing partial frame
    pub(super) fn finish(&mut self, sink: &dyn FrameSink) {
        match self.resampler.flush() {
            Ok(tail) => self.emit(&tail, sink),
            Err(e) => tracing::warn!(error = %e, "dropping resampler tail"),
        }
        if let Some(frame) = self.chunker.flush() {
            tracing::trace!(bytes = frame.len(), "flushing partial frame");
            sink.send_frame(frame);
        }
    }

    fn emit(&mut self, samples: &[f32], sink: &dyn FrameSink) {
        if samples.is_empty() {
            return;
        }
        let pcm: Vec<i16> = samples.iter().map(|&s| f32_to_i16(s)).collect();
        for frame in self.chunker.push_samples(&pcm) {
            sink.send_frame(frame);
        }
    }
}

enum CaptureMsg {
    Samples(Vec<f32>),
    Stop,
}

struct Worker {
    control: Sender<CaptureMsg>,
    thread: JoinHandle<()>,
}

/// Captures audio from an input device
pub struct MicrophoneCapture {
    device_name: Option<String>,
    frame_bytes: usize,
    worker: Option<Worker>,
}

impl MicrophoneCapture {
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.device.clone(),
            frame_bytes: config.frame_bytes,
            worker: None,
        }
    }

    /// Names of the available input devices
    ///
    /// # Errors
    ///
    /// Returns error if the host cannot enumerate devices
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices().map_err(|e| device_error(&e))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl AudioSource for MicrophoneCapture {
    fn start(&mut self, sink: Arc<dyn FrameSink>) -> Result<()> {
        if self.is_capturing() {
            return Ok(());
        }
        // A finished thread means the device went away; reap it first
        self.stop();

        let (control, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let device_name = self.device_name.clone();
        let frame_bytes = self.frame_bytes;
        let samples_tx = control.clone();

        let thread = std::thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || {
                run_capture(
                    device_name.as_deref(),
                    frame_bytes,
                    sink.as_ref(),
                    samples_tx,
                    &inbox,
                    &ready_tx,
                );
            })
            .map_err(|e| Error::Audio(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(Worker { control, thread });
                tracing::debug!("audio capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Audio("capture thread exited during startup".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.control.send(CaptureMsg::Stop);
            if worker.thread.join().is_err() {
                tracing::warn!("capture thread panicked");
            }
            tracing::debug!("audio capture stopped");
        }
    }

    fn is_capturing(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| !w.thread.is_finished())
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture(
    device_name: Option<&str>,
    frame_bytes: usize,
    sink: &dyn FrameSink,
    samples_tx: Sender<CaptureMsg>,
    inbox: &Receiver<CaptureMsg>,
    ready: &SyncSender<Result<()>>,
) {
    let opened = open_device(device_name).and_then(|device| {
        let supported = device.default_input_config().map_err(|e| device_error(&e))?;
        let pipeline = FramePipeline::new(
            supported.sample_rate().0,
            supported.channels(),
            frame_bytes,
        )?;
        let stream = build_stream(&device, &supported, samples_tx)?;
        stream.play().map_err(|e| device_error(&e))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            device_rate = supported.sample_rate().0,
            channels = supported.channels(),
            format = ?supported.sample_format(),
            "input stream open"
        );
        Ok((stream, pipeline))
    });

    let (stream, mut pipeline) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            tracing::warn!(error = %e, "failed to open input device");
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    while let Ok(msg) = inbox.recv() {
        match msg {
            CaptureMsg::Samples(samples) => pipeline.push(&samples, sink),
            CaptureMsg::Stop => break,
        }
    }

    drop(stream);
    pipeline.finish(sink);
}

fn open_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(wanted) = name {
        let mut devices = host.input_devices().map_err(|e| device_error(&e))?;
        return devices
            .find(|d| d.name().is_ok_and(|n| n.contains(wanted)))
            .ok_or_else(|| Error::Audio(format!("input device not found: {wanted}")));
    }

    host.default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))
}

fn build_stream(
    device: &Device,
    supported: &SupportedStreamConfig,
    tx: Sender<CaptureMsg>,
) -> Result<Stream> {
    let config = supported.config();
    let on_error = |err: cpal::StreamError| {
        tracing::error!(error = %err, "audio capture error");
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = tx.send(CaptureMsg::Samples(data.to_vec()));
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples = data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                let _ = tx.send(CaptureMsg::Samples(samples));
            },
            on_error,
            None,
        ),
        other => {
            return Err(Error::Audio(format!(
                "unsupported input sample format: {other:?}"
            )));
        }
    };

    stream.map_err(|e| device_error(&e))
}

/// Map a host error, singling out refused access
fn device_error(err: &impl std::fmt::Display) -> Error {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        Error::PermissionDenied(message)
    } else {
        Error::Audio(message)
    }
}
