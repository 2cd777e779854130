//! Speech synthesis and playback
//!
//! Requests an utterance from DashScope's multimodal generation endpoint,
//! downloads the audio it links to and plays it on the output device.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::TtsConfig;
use crate::conversation::Synthesizer;
use crate::voice::{AudioPlayback, DecodedAudio, PlaybackControl, decode_audio};
use crate::{Error, Result};

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    model: &'a str,
    input: SynthesisInput<'a>,
}

#[derive(Debug, Serialize)]
struct SynthesisInput<'a> {
    text: &'a str,
    voice: &'a str,
    language_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct SynthesisResponse {
    #[serde(default)]
    output: Option<SynthesisOutput>,
}

#[derive(Debug, Deserialize)]
struct SynthesisOutput {
    #[serde(default)]
    audio: Option<AudioRef>,
    #[serde(default)]
    audio_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AudioRef {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Resets the speaking flag however `speak` ends
struct SpeakingGuard<'a>(&'a AtomicBool);

impl Drop for SpeakingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// DashScope speech synthesizer with local playback
pub struct SpeechSynthesizer {
    client: reqwest::Client,
    config: TtsConfig,
    api_key: Option<SecretString>,
    playback: AudioPlayback,
    current: Mutex<Option<PlaybackControl>>,
    /// Bumped by `stop`; a `speak` that started earlier never begins playback
    generation: AtomicU64,
    speaking: AtomicBool,
}

impl SpeechSynthesizer {
    /// Create a synthesizer
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &TtsConfig, api_key: Option<SecretString>, playback: AudioPlayback) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            config: config.clone(),
            api_key,
            playback,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            speaking: AtomicBool::new(false),
        })
    }

    fn current(&self) -> MutexGuard<'_, Option<PlaybackControl>> {
        self.current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Ask the service to synthesize `text`; returns the audio URL
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` without a credential, `Error::Synthesis` if the
    /// service rejects the request or returns no audio
    pub async fn synthesize(&self, text: &str) -> Result<String> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| Error::Config("DashScope API key required for speech".to_string()))?;

        let request = SynthesisRequest {
            model: &self.config.model,
            input: SynthesisInput {
                text,
                voice: &self.config.voice,
                language_type: &self.config.language_type,
            },
        };

        let response = self
            .client
            .post(&self.config.url)
            .bearer_auth(api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Synthesis(format!("{status}: {}", service_message(&body))));
        }

        audio_url(&body)
    }

    /// Synthesize `text` and download the resulting audio
    ///
    /// # Errors
    ///
    /// Returns error if synthesis, download or decoding fails
    pub async fn fetch_audio(&self, text: &str) -> Result<DecodedAudio> {
        let url = self.synthesize(text).await?;
        tracing::debug!(chars = text.chars().count(), "downloading synthesized audio");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Synthesis(format!("audio download failed: {status}")));
        }
        let bytes = response.bytes().await?;

        let audio = decode_audio(&bytes)?;
        tracing::debug!(
            bytes = bytes.len(),
            sample_rate = audio.sample_rate,
            duration_ms = audio.duration().as_millis(),
            "synthesized audio decoded"
        );
        Ok(audio)
    }
}

#[async_trait]
impl Synthesizer for SpeechSynthesizer {
    async fn speak(&self, text: &str) -> Result<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        let audio = self.fetch_audio(text).await?;

        let control = PlaybackControl::new();
        {
            let mut current = self.current();
            if self.generation.load(Ordering::SeqCst) != generation {
                tracing::debug!("speech stopped before playback");
                return Ok(());
            }
            *current = Some(control.clone());
        }

        self.speaking.store(true, Ordering::SeqCst);
        let _guard = SpeakingGuard(&self.speaking);

        let playback = self.playback.clone();
        let played =
            tokio::task::spawn_blocking(move || playback.play_blocking(&audio, &control)).await;

        {
            let mut current = self.current();
            if self.generation.load(Ordering::SeqCst) == generation {
                *current = None;
            }
        }

        played.map_err(|e| Error::Synthesis(format!("playback task failed: {e}")))?
    }

    fn pause(&self) {
        if let Some(control) = self.current().as_ref() {
            control.pause();
            tracing::debug!("speech paused");
        }
    }

    fn resume(&self) {
        if let Some(control) = self.current().as_ref() {
            control.resume();
            tracing::debug!("speech resumed");
        }
    }

    fn stop(&self) {
        let mut current = self.current();
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(control) = current.take() {
            control.stop();
            tracing::debug!("speech stopped");
        }
    }

    fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }
}

/// Audio URL from a synthesis response body
fn audio_url(body: &str) -> Result<String> {
    let parsed: SynthesisResponse = serde_json::from_str(body)?;
    parsed
        .output
        .and_then(|o| o.audio.and_then(|a| a.url).or(o.audio_url))
        .filter(|url| !url.is_empty())
        .ok_or_else(|| Error::Synthesis("response carried no audio".to_string()))
}

fn service_message(body: &str) -> String {
    match serde_json::from_str::<ServiceError>(body) {
        Ok(ServiceError {
            code: Some(code),
            message,
        }) => format!("{code}: {}", message.unwrap_or_default()),
        Ok(ServiceError {
            message: Some(message),
            ..
        }) => message,
        _ => body.to_string(),
    }
}
