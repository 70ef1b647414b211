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

//! Per-speaker VAD-based chunking: turns a continuous PCM stream into
//! discrete [`AudioChunk`] events. See the emission policy in the design
//! notes - checked on every frame arrival and on a 250ms tick so a speaker
//! who stops mid-buffer still flushes without a new frame arriving.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audio::vad::VoiceActivityDetector;
use crate::bus::EventBus;
use crate::config::ListenerConfig;
use crate::types::{AudioChunk, AudioSourceTag};

const FLUSH_TICK: Duration = Duration::from_millis(250);
const MID_UTTERANCE_FLOOR: Duration = Duration::from_secs(5);

struct SpeakerBuffer {
    speaker_name: String,
    pcm: Vec<u8>,
    first_sample_ts: Option<Instant>,
    start_wall_clock: Option<chrono::DateTime<Utc>>,
    last_voice_ts: Option<Instant>,
    vad: VoiceActivityDetector,
}

impl SpeakerBuffer {
    fn new(speaker_name: String, aggressiveness: u8) -> Self {
        Self {
            speaker_name,
            pcm: Vec::new(),
            first_sample_ts: None,
            start_wall_clock: None,
            last_voice_ts: None,
            vad: VoiceActivityDetector::new(aggressiveness),
        }
    }

    fn duration(&self) -> Duration {
        bytes_to_duration(self.pcm.len())
    }

    fn silence(&self, now: Instant) -> Duration {
        self.last_voice_ts
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO)
    }

    fn reset(&mut self) {
        self.pcm.clear();
        self.first_sample_ts = None;
        self.start_wall_clock = None;
        self.last_voice_ts = None;
    }

    fn is_empty(&self) -> bool {
        self.pcm.is_empty()
    }
}

fn bytes_to_duration(num_bytes: usize) -> Duration {
    let samples = num_bytes / 2;
    Duration::from_secs_f64(samples as f64 / 48_000.0)
}

/// Checked on frame arrival and on the periodic tick. `d` is the current
/// buffer duration, `silence` the time since voice was last detected.
pub fn should_emit(d: Duration, silence: Duration, cfg: &ListenerConfig) -> bool {
    if d < cfg.min_chunk_duration {
        return false;
    }
    d >= cfg.chunk_duration
        || silence >= cfg.silence_threshold
        || (d >= MID_UTTERANCE_FLOOR && silence >= cfg.short_silence_threshold)
}

/// Converts interleaved stereo 16-bit LE PCM to mono by averaging channels,
/// truncating toward zero (matching the reference's `(l + r) / 2`).
pub fn stereo_to_mono(stereo: &[u8]) -> Vec<u8> {
    let mut mono = Vec::with_capacity(stereo.len() / 2);
    for pair in stereo.chunks_exact(4) {
        let l = i16::from_le_bytes([pair[0], pair[1]]) as i32;
        let r = i16::from_le_bytes([pair[2], pair[3]]) as i32;
        let avg = ((l + r) / 2) as i16;
        mono.extend_from_slice(&avg.to_le_bytes());
    }
    mono
}

pub struct AudioSegmenter {
    session_id: String,
    config: ListenerConfig,
    bus: Arc<EventBus>,
    buffers: Mutex<HashMap<String, SpeakerBuffer>>,
    cancel: CancellationToken,
    flush_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AudioSegmenter {
    pub fn new(session_id: impl Into<String>, config: ListenerConfig, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.into(),
            config,
            bus,
            buffers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            flush_task: Mutex::new(None),
        })
    }

    /// Spawns the 250ms periodic flush tick.
    pub async fn start(self: &Arc<Self>) {
        let this = self.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(FLUSH_TICK) => {
                        this.tick(Instant::now()).await;
                    }
                }
            }
        });
        *self.flush_task.lock().await = Some(handle);
    }

    /// Cancels the flush tick and flushes all non-empty buffers once,
    /// regardless of thresholds (still subject to `min_chunk_duration`).
    /// Idempotent and safe on a never-started segmenter.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.flush_task.lock().await.take() {
            let _ = handle.await;
        }
        self.flush_all().await;
    }

    /// Feeds one frame of interleaved stereo 16-bit 48 kHz PCM for
    /// `speaker_id`, lazily creating its buffer. Runs VAD over complete
    /// 20ms windows of the converted mono audio, then checks emission.
    pub async fn ingest_frame(
        &self,
        speaker_id: &str,
        speaker_name: &str,
        stereo_pcm: &[u8],
        source: AudioSourceTag,
    ) {
        let now = Instant::now();
        let mono = stereo_to_mono(stereo_pcm);
        if mono.is_empty() {
            return;
        }

        let mut buffers = self.buffers.lock().await;
        let buffer = buffers
            .entry(speaker_id.to_string())
            .or_insert_with(|| SpeakerBuffer::new(speaker_name.to_string(), self.config.vad_aggressiveness));
        buffer.speaker_name = speaker_name.to_string();

        if buffer.first_sample_ts.is_none() {
            buffer.first_sample_ts = Some(now);
            buffer.start_wall_clock = Some(Utc::now());
        }

        let samples: Vec<i16> = mono
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        let mut saw_speech = false;
        for window in samples.chunks(960) {
            if buffer.vad.is_speech(window) {
                saw_speech = true;
            }
        }
        if saw_speech {
            buffer.last_voice_ts = Some(now);
        } else if buffer.last_voice_ts.is_none() {
            // first frame with no detected speech still needs a baseline
            // so silence is measured from arrival, not from epoch.
            buffer.last_voice_ts = Some(now);
        }

        buffer.pcm.extend_from_slice(&mono);

        let chunk = self.maybe_emit(buffer, speaker_id, now, source);
        drop(buffers);
        if let Some(chunk) = chunk {
            self.bus.publish(chunk.into()).await;
        }
    }

    fn maybe_emit(
        &self,
        buffer: &mut SpeakerBuffer,
        speaker_id: &str,
        now: Instant,
        source: AudioSourceTag,
    ) -> Option<AudioChunk> {
        let d = buffer.duration();
        let silence = buffer.silence(now);
        if !should_emit(d, silence, &self.config) {
            return None;
        }
        Some(self.drain_into_chunk(buffer, speaker_id, source))
    }

    fn drain_into_chunk(
        &self,
        buffer: &mut SpeakerBuffer,
        speaker_id: &str,
        source: AudioSourceTag,
    ) -> AudioChunk {
        let pcm = std::mem::take(&mut buffer.pcm);
        let duration_ms = bytes_to_duration(pcm.len()).as_millis() as u64;
        let start_ts = buffer.start_wall_clock.unwrap_or_else(Utc::now);
        let chunk = AudioChunk {
            session_id: self.session_id.clone(),
            speaker_id: speaker_id.to_string(),
            speaker_name: buffer.speaker_name.clone(),
            pcm,
            start_ts,
            duration_ms,
            source,
        };
        buffer.reset();
        chunk
    }

    /// Periodic re-evaluation of every open buffer.
    async fn tick(&self, now: Instant) {
        let mut buffers = self.buffers.lock().await;
        let mut to_emit = Vec::new();
        for (speaker_id, buffer) in buffers.iter_mut() {
            if let Some(chunk) = self.maybe_emit(buffer, speaker_id, now, AudioSourceTag::Live) {
                to_emit.push(chunk);
            }
        }
        drop(buffers);
        for chunk in to_emit {
            self.bus.publish(chunk.into()).await;
        }
    }

    /// Flushes every non-empty buffer once, ignoring the normal emission
    /// thresholds but still requiring `min_chunk_duration`. Clears every
    /// buffer (even those below the floor - their tail is discarded).
    async fn flush_all(&self) {
        let mut buffers = self.buffers.lock().await;
        let mut to_emit = Vec::new();
        for (speaker_id, buffer) in buffers.iter_mut() {
            if buffer.is_empty() {
                continue;
            }
            if buffer.duration() >= self.config.min_chunk_duration {
                to_emit.push(self.drain_into_chunk(buffer, speaker_id, AudioSourceTag::Live));
            } else {
                buffer.reset();
            }
        }
        drop(buffers);
        for chunk in to_emit {
            self.bus.publish(chunk.into()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;

    fn cfg() -> ListenerConfig {
        ListenerConfig {
            chunk_duration: Duration::from_secs(10),
            silence_threshold: Duration::from_millis(1500),
            short_silence_threshold: Duration::from_millis(500),
            min_chunk_duration: Duration::from_millis(500),
            sample_rate: 48_000,
            channels: 2,
            sample_width: 2,
            vad_aggressiveness: 2,
        }
    }

    #[test]
    fn exactly_at_min_chunk_duration_emits() {
        let c = cfg();
        assert!(should_emit(c.min_chunk_duration, c.silence_threshold, &c));
    }

    #[test]
    fn strictly_below_min_chunk_duration_does_not_emit() {
        let c = cfg();
        let d = c.min_chunk_duration - Duration::from_millis(1);
        assert!(!should_emit(d, c.silence_threshold, &c));
    }

    #[test]
    fn silence_exactly_at_threshold_emits() {
        let c = cfg();
        let d = Duration::from_secs(2);
        assert!(should_emit(d, c.silence_threshold, &c));
    }

    #[test]
    fn silence_strictly_below_threshold_does_not_emit_without_other_triggers() {
        let c = cfg();
        let d = Duration::from_secs(2);
        let silence = c.silence_threshold - Duration::from_millis(1);
        assert!(!should_emit(d, silence, &c));
    }

    #[test]
    fn hard_cap_emits_regardless_of_silence() {
        let c = cfg();
        assert!(should_emit(c.chunk_duration, Duration::ZERO, &c));
    }

    #[test]
    fn mid_utterance_rule_requires_five_seconds_and_short_silence() {
        let c = cfg();
        assert!(should_emit(
            Duration::from_secs(5),
            c.short_silence_threshold,
            &c
        ));
        assert!(!should_emit(
            Duration::from_millis(4999),
            c.short_silence_threshold,
            &c
        ));
    }

    #[test]
    fn stereo_to_mono_averages_truncating_toward_zero() {
        let stereo = [
            10i16.to_le_bytes(),
            3i16.to_le_bytes(),
        ]
        .concat();
        let mono = stereo_to_mono(&stereo);
        let sample = i16::from_le_bytes([mono[0], mono[1]]);
        assert_eq!(sample, 6); // (10 + 3) / 2 == 6 (integer division)
    }

    #[tokio::test]
    async fn segmenter_emits_chunk_conserving_pcm_bytes() {
        let bus = Arc::new(EventBus::new());
        let mut small_cfg = cfg();
        small_cfg.chunk_duration = Duration::from_millis(50);
        small_cfg.min_chunk_duration = Duration::from_millis(10);
        let segmenter = AudioSegmenter::new("s1", small_cfg, bus);

        // 50ms of stereo silence at 48kHz = 50ms * 48 samples/ms * 4 bytes
        let stereo_bytes = vec![0u8; 48 * 50 * 4];
        segmenter
            .ingest_frame("u1", "TestUser", &stereo_bytes, AudioSourceTag::File)
            .await;

        segmenter.stop().await;
    }
}
