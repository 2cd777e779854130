//! Voice I/O
//!
//! Captures microphone (or file) audio, converts it to the recognizer's wire
//! format and cuts it into fixed-size frames. Also hosts speaker playback for
//! synthesized replies.

mod capture;
mod frame;
mod playback;
mod resample;
mod wav;

use std::sync::Arc;

pub use capture::MicrophoneCapture;
pub use frame::{FrameChunker, f32_to_i16, samples_to_bytes};
pub use playback::{AudioPlayback, DecodedAudio, PlaybackControl, decode_audio};
pub use resample::{LinearResampler, downmix};
pub use wav::{MAX_FILE_DURATION, WavData, WavFileSource, read_wav, samples_to_wav};

use crate::Result;

/// Wire sample rate (16 kHz speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Default frame size: 100 ms of 16 kHz mono 16-bit PCM
pub const DEFAULT_FRAME_BYTES: usize = 3200;

/// A block of mono 16 kHz little-endian 16-bit PCM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame(Vec<u8>);

impl AudioFrame {
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Destination for captured frames
///
/// Called from the capture thread, so implementations must not block.
pub trait FrameSink: Send + Sync + 'static {
    fn send_frame(&self, frame: AudioFrame);
}

impl FrameSink for tokio::sync::mpsc::UnboundedSender<AudioFrame> {
    fn send_frame(&self, frame: AudioFrame) {
        if self.send(frame).is_err() {
            tracing::trace!("frame receiver gone");
        }
    }
}

/// Something that produces audio frames until stopped
pub trait AudioSource: Send {
    /// Begin delivering frames to `sink`
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` if the host refuses access,
    /// `Error::Audio` for other device failures
    fn start(&mut self, sink: Arc<dyn FrameSink>) -> Result<()>;

    /// Stop delivering frames; any partial frame is flushed first
    fn stop(&mut self);

    fn is_capturing(&self) -> bool;
}
