//! Channel downmix and sample-rate conversion

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::{Error, Result};

/// Input frames per resampler chunk
const CHUNK_SIZE: usize = 1024;

/// Average interleaved channels into mono
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Streaming mono resampler using linear interpolation
///
/// Passes samples through untouched when both rates match.
pub struct LinearResampler {
    inner: Option<FastFixedIn<f32>>,
    ratio: f64,
    pending: Vec<f32>,
}

impl LinearResampler {
    /// Create a resampler converting `from_rate` to `to_rate`
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if either rate is unusable
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(Error::Audio(format!(
                "invalid sample rates {from_rate} -> {to_rate}"
            )));
        }

        let ratio = f64::from(to_rate) / f64::from(from_rate);
        let inner = if from_rate == to_rate {
            None
        } else {
            Some(
                FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Linear, CHUNK_SIZE, 1)
                    .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?,
            )
        };

        tracing::debug!(from_rate, to_rate, passthrough = inner.is_none(), "resampler ready");

        Ok(Self {
            inner,
            ratio,
            pending: Vec::new(),
        })
    }

    /// Feed samples; returns whatever output is ready
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if resampling fails
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);
        let mut output = Vec::new();

        while self.pending.len() >= inner.input_frames_next() {
            let needed = inner.input_frames_next();
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let result = inner
                .process(&[chunk], None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            if let Some(channel) = result.into_iter().next() {
                output.extend(channel);
            }
        }

        Ok(output)
    }

    /// Drain the samples held back for an incomplete chunk
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if resampling fails
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let chunk = std::mem::take(&mut self.pending);
        let expected = (chunk.len() as f64 * self.ratio).round() as usize;
        let result = inner
            .process_partial(Some([chunk].as_slice()), None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;

        // The partial chunk is zero-padded; keep only its share of the output
        let mut output = result.into_iter().next().unwrap_or_default();
        output.truncate(expected);
        Ok(output)
    }
}
