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

//! Abstracts delivery of raw PCM frames from "upstream" - a live voice
//! platform in production, a WAV file in this repo. The core only ever
//! talks to the `AudioSource` trait.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// One frame of interleaved stereo 16-bit LE PCM attributed to a speaker.
#[derive(Debug, Clone)]
pub struct Frame {
    pub speaker_id: String,
    pub speaker_name: String,
    pub pcm: Vec<u8>,
}

#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Connects to the upstream and begins delivering frames on `tx`.
    async fn connect(&self, tx: tokio::sync::mpsc::Sender<Frame>) -> Result<()>;
    async fn disconnect(&self);
    async fn is_connected(&self) -> bool;
}

/// Replays one WAV file per speaker on a wall-clock-paced schedule,
/// standing in for a live voice platform adapter. Each file is expected to
/// be 16-bit, and is upmixed to stereo if it is mono (upstream is always
/// documented as stereo 48 kHz).
pub struct FileAudioSource {
    files: Vec<(String, String, PathBuf)>,
    frame_duration: Duration,
    connected: std::sync::atomic::AtomicBool,
}

impl FileAudioSource {
    pub fn new(files: Vec<(String, String, PathBuf)>) -> Self {
        Self {
            files,
            frame_duration: Duration::from_millis(20),
            connected: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn read_stereo_pcm(path: &PathBuf) -> Result<(Vec<u8>, u32, u16)> {
        let mut reader =
            hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
        let spec = reader.spec();
        let samples: Vec<i16> = reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("reading wav samples")?;
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for s in &samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        Ok((bytes, spec.sample_rate, spec.channels))
    }
}

#[async_trait]
impl AudioSource for FileAudioSource {
    async fn connect(&self, tx: tokio::sync::mpsc::Sender<Frame>) -> Result<()> {
        self.connected
            .store(true, std::sync::atomic::Ordering::SeqCst);

        for (speaker_id, speaker_name, path) in &self.files {
            let (mono_or_stereo, sample_rate, channels) = Self::read_stereo_pcm(path)?;
            let stereo = if channels == 1 {
                upmix_mono_to_stereo(&mono_or_stereo)
            } else {
                mono_or_stereo
            };
            let bytes_per_frame = (sample_rate as usize / 1000) * 20 * 2 * 2;
            for chunk in stereo.chunks(bytes_per_frame.max(1)) {
                if tx
                    .send(Frame {
                        speaker_id: speaker_id.clone(),
                        speaker_name: speaker_name.clone(),
                        pcm: chunk.to_vec(),
                    })
                    .await
                    .is_err()
                {
                    return Ok(());
                }
                tokio::time::sleep(self.frame_duration).await;
            }
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::SeqCst)
    }
}

fn upmix_mono_to_stereo(mono: &[u8]) -> Vec<u8> {
    let mut stereo = Vec::with_capacity(mono.len() * 2);
    for pair in mono.chunks_exact(2) {
        stereo.extend_from_slice(pair);
        stereo.extend_from_slice(pair);
    }
    stereo
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn write_mono_wav(path: &std::path::Path, samples: &[i16], sample_rate: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[tokio::test]
    async fn connect_upmixes_mono_file_and_delivers_frames_for_each_speaker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player.wav");
        let samples: Vec<i16> = (0..1600i16).collect();
        write_mono_wav(&path, &samples, 16_000);

        let source = FileAudioSource::new(vec![("u1".into(), "Tim".into(), path)]);
        let (tx, mut rx) = mpsc::channel(64);
        source.connect(tx).await.unwrap();

        let mut total_bytes = 0usize;
        while let Some(frame) = rx.recv().await {
            assert_eq!(frame.speaker_id, "u1");
            assert_eq!(frame.speaker_name, "Tim");
            total_bytes += frame.pcm.len();
        }
        // stereo (2ch) * 2 bytes/sample
        assert_eq!(total_bytes, samples.len() * 2 * 2);
        assert!(source.is_connected().await);
        source.disconnect().await;
        assert!(!source.is_connected().await);
    }
}
