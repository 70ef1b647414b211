/*
 * RPG Scribe - Rust Edition
 * Copyright (c) 2024 RPG Scribe Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

//! Bounded-concurrency batch processor that turns `AudioChunk` events into
//! `Transcription` events via a remote speech-to-text service, with retry,
//! memoization by audio hash, and queue backpressure.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use md5::{Digest, Md5};
use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::bus::{EventBus, Handler};
use crate::config::TranscriberConfig;
use crate::resilience::{retry, RetryConfig};
use crate::types::{AudioChunk, Event, EventKind, SystemStatus, Transcription};

pub const HANDLER_ID: &str = "transcription-worker";

/// Cache confidence for a memoized hit, distinct from the configured
/// confidence a fresh STT call reports.
const CACHED_CONFIDENCE: f32 = 1.0;

/// Remote speech-to-text service. Implementations receive a WAV-wrapped
/// clip and an optional contextual prompt hint.
#[async_trait]
pub trait SttClient: Send + Sync {
    async fn transcribe(&self, wav_bytes: &[u8], config: &TranscriberConfig) -> Result<String>;
}

/// HTTP client against an OpenAI-compatible transcription endpoint,
/// mirroring the teacher's `OpenAIClient::transcribe_audio` multipart
/// upload shape.
pub struct HttpSttClient {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl HttpSttClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_endpoint(api_key, "https://api.openai.com/v1/audio/transcriptions")
    }

    /// Used by tests to point the client at a local mock server instead of
    /// the real STT endpoint.
    pub fn with_endpoint(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SttClient for HttpSttClient {
    async fn transcribe(&self, wav_bytes: &[u8], config: &TranscriberConfig) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(wav_bytes.to_vec())
            .file_name("chunk.wav")
            .mime_str("audio/wav")?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", config.model.clone())
            .text("language", config.language.clone())
            .text("response_format", "text");
        if !config.prompt_hint.is_empty() {
            form = form.text("prompt", config.prompt_hint.clone());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .context("stt request failed")?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("stt service returned an error: {body}");
        }

        Ok(response.text().await?.trim().to_string())
    }
}

fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn wrap_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for pair in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Subscribes to `AudioChunk` on `start`, unsubscribes on `stop`. Holds the
/// transcription cache and the concurrency semaphore for its own lifetime.
pub struct TranscriptionWorker {
    session_id: String,
    config: TranscriberConfig,
    client: Arc<dyn SttClient>,
    bus: Arc<EventBus>,
    cache: Mutex<HashMap<String, String>>,
    semaphore: Arc<Semaphore>,
    queue_tx: mpsc::Sender<AudioChunk>,
    queue_rx: Mutex<Option<mpsc::Receiver<AudioChunk>>>,
    worker_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TranscriptionWorker {
    pub fn new(
        session_id: impl Into<String>,
        config: TranscriberConfig,
        client: Arc<dyn SttClient>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_max_size);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests));
        Arc::new(Self {
            session_id: session_id.into(),
            config,
            client,
            bus,
            cache: Mutex::new(HashMap::new()),
            semaphore,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            worker_task: Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        self.bus
            .subscribe(
                EventKind::AudioChunk,
                HANDLER_ID,
                Arc::new(QueueingHandler {
                    session_id: self.session_id.clone(),
                    tx: self.queue_tx.clone(),
                    bus: self.bus.clone(),
                }),
            )
            .await;

        let rx = self.queue_rx.lock().await.take();
        if let Some(mut rx) = rx {
            let this = self.clone();
            let handle = tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    this.clone().process_chunk(chunk).await;
                }
            });
            *self.worker_task.lock().await = Some(handle);
        }
    }

    pub async fn stop(&self) {
        self.bus.unsubscribe(EventKind::AudioChunk, HANDLER_ID).await;
        if let Some(handle) = self.worker_task.lock().await.take() {
            handle.abort();
        }
    }

    async fn process_chunk(self: Arc<Self>, chunk: AudioChunk) {
        if let Err(err) = self.transcribe_chunk(&chunk).await {
            tracing::error!(
                session_id = %chunk.session_id,
                speaker_id = %chunk.speaker_id,
                error = %err,
                "transcription failed for chunk"
            );
            self.bus
                .publish(SystemStatus::error("transcriber", err.to_string()).into())
                .await;
        }
    }

    /// The per-chunk pipeline: cache lookup, WAV wrap, semaphore, retrying
    /// STT call, cache insert, and publish (dropping empty/whitespace
    /// results without emitting an event).
    async fn transcribe_chunk(&self, chunk: &AudioChunk) -> Result<()> {
        let hash = md5_hex(&chunk.pcm);

        if let Some(cached) = self.cache.lock().await.get(&hash).cloned() {
            self.emit(chunk, cached, CACHED_CONFIDENCE).await;
            return Ok(());
        }

        let wav_bytes = wrap_wav(&chunk.pcm, 48_000)?;
        let _permit = self.semaphore.acquire().await.context("semaphore closed")?;

        let retry_config = RetryConfig {
            max_attempts: self.config.max_retries + 1,
            base_delay: self.config.retry_base_delay,
            max_delay: self.config.retry_base_delay * 8,
            exponential_base: 2.0,
        };

        let client = &self.client;
        let config = &self.config;
        let text = retry(
            &retry_config,
            |attempt, err: &anyhow::Error| {
                tracing::warn!(attempt, error = %err, "stt call failed, retrying");
            },
            || async {
                tokio::time::timeout(config.api_timeout, client.transcribe(&wav_bytes, config))
                    .await
                    .context("stt request timed out")?
            },
        )
        .await?;

        let trimmed = text.trim().to_string();
        if trimmed.is_empty() {
            return Ok(());
        }

        self.cache.lock().await.insert(hash, trimmed.clone());
        self.emit(chunk, trimmed, 0.95).await;
        Ok(())
    }

    async fn emit(&self, chunk: &AudioChunk, text: String, confidence: f32) {
        self.bus
            .publish(
                Transcription {
                    session_id: chunk.session_id.clone(),
                    speaker_id: chunk.speaker_id.clone(),
                    speaker_name: chunk.speaker_name.clone(),
                    text,
                    timestamp: chrono::Utc::now(),
                    confidence,
                    is_partial: false,
                }
                .into(),
            )
            .await;
    }
}

/// Bus-facing adapter: filters by session, then `try_send`s into the
/// bounded queue so a slow STT backend never blocks `publish`. A full
/// queue drops the chunk with a warning and a `SystemStatus` error.
struct QueueingHandler {
    session_id: String,
    tx: mpsc::Sender<AudioChunk>,
    bus: Arc<EventBus>,
}

#[async_trait]
impl Handler for QueueingHandler {
    async fn handle(&self, event: Event) -> Result<()> {
        let Event::AudioChunk(chunk) = event else {
            return Ok(());
        };
        if chunk.session_id != self.session_id {
            return Ok(());
        }
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(chunk) {
            tracing::warn!("transcription queue full, dropping audio chunk");
            self.bus
                .publish(
                    SystemStatus::error("transcriber", "transcription queue full, chunk dropped")
                        .into(),
                )
                .await;
        }
        Ok(())
    }
}

/// Builds the contextual prompt hint the orchestrator passes to every STT
/// call: `"Expected names: <player character names...>"`.
pub fn build_prompt_hint(character_names: &[String]) -> String {
    if character_names.is_empty() {
        return String::new();
    }
    format!("Expected names: {}", character_names.join(", "))
}
