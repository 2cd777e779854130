//! Fixed-size frame assembly

use super::AudioFrame;

/// Convert a float sample in [-1.0, 1.0] to 16-bit PCM
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Encode samples as little-endian bytes
#[must_use]
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Accumulates PCM bytes into frames of a fixed size, preserving order
#[derive(Debug)]
pub struct FrameChunker {
    frame_bytes: usize,
    pending: Vec<u8>,
}

impl FrameChunker {
    /// Create a chunker; odd sizes are rounded down to keep samples whole
    #[must_use]
    pub fn new(frame_bytes: usize) -> Self {
        let frame_bytes = (frame_bytes.max(2) / 2) * 2;
        Self {
            frame_bytes,
            pending: Vec::with_capacity(frame_bytes),
        }
    }

    #[must_use]
    pub const fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Bytes waiting for a full frame
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Append bytes and return every frame completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(bytes);

        let complete = self.pending.len() / self.frame_bytes;
        if complete == 0 {
            return Vec::new();
        }

        let tail = self.pending.split_off(complete * self.frame_bytes);
        let full = std::mem::replace(&mut self.pending, tail);
        full.chunks_exact(self.frame_bytes)
            .map(|chunk| AudioFrame::new(chunk.to_vec()))
            .collect()
    }

    /// Append samples and return every frame completed by them
    pub fn push_samples(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.push(&samples_to_bytes(samples))
    }

    /// Take the remainder as a short frame, if any
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.pending.is_empty() {
            None
        } else {
            Some(AudioFrame::new(std::mem::take(&mut self.pending)))
        }
    }
}
