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

//! Runtime configuration: credentials and tunables from the environment
//! (`Config::load`), and the per-campaign TOML file (`CampaignFile`) that
//! seeds a `CampaignContext`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{CampaignContext, Npc, Player};

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub chunk_duration: Duration,
    pub silence_threshold: Duration,
    pub short_silence_threshold: Duration,
    pub min_chunk_duration: Duration,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_width: u16,
    pub vad_aggressiveness: u8,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            chunk_duration: Duration::from_secs_f64(10.0),
            silence_threshold: Duration::from_secs_f64(1.5),
            short_silence_threshold: Duration::from_secs_f64(0.5),
            min_chunk_duration: Duration::from_secs_f64(0.5),
            sample_rate: 48_000,
            channels: 2,
            sample_width: 2,
            vad_aggressiveness: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscriberConfig {
    pub model: String,
    pub language: String,
    pub api_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub queue_max_size: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub prompt_hint: String,
    pub local_model_size: String,
    pub device: String,
    pub compute_type: String,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            model: "whisper-1".to_string(),
            language: "en".to_string(),
            api_timeout: Duration::from_secs(30),
            max_concurrent_requests: 4,
            queue_max_size: 64,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            prompt_hint: String::new(),
            local_model_size: "base".to_string(),
            device: "cpu".to_string(),
            compute_type: "int8".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub model: String,
    pub max_tokens: u32,
    pub update_interval: Duration,
    pub max_pending_transcriptions: usize,
    pub api_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet".to_string(),
            max_tokens: 2048,
            update_interval: Duration::from_secs(120),
            max_pending_transcriptions: 20,
            api_timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Top-level application configuration, assembled from environment
/// variables. Mirrors the teacher's `Config::load` shape: a `dotenv` load
/// followed by `env::var(...).unwrap_or_else(...)` per knob.
#[derive(Debug, Clone)]
pub struct Config {
    pub listener: ListenerConfig,
    pub transcriber: TranscriberConfig,
    pub summarizer: SummarizerConfig,
    pub stt_api_key: String,
    pub llm_api_key: String,
    pub upstream_token: Option<String>,
    pub database_path: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let stt_api_key =
            env::var("STT_API_KEY").context("STT_API_KEY environment variable not found")?;
        let llm_api_key =
            env::var("LLM_API_KEY").context("LLM_API_KEY environment variable not found")?;
        let upstream_token = env::var("UPSTREAM_TOKEN").ok();

        let database_path =
            env::var("RPG_SCRIBE_DB").unwrap_or_else(|_| "rpg-scribe.db".to_string());

        let listener = ListenerConfig {
            chunk_duration: secs_from_env("RPG_SCRIBE_CHUNK_DURATION_S", 10.0),
            silence_threshold: secs_from_env("RPG_SCRIBE_SILENCE_THRESHOLD_S", 1.5),
            short_silence_threshold: secs_from_env("RPG_SCRIBE_SHORT_SILENCE_THRESHOLD_S", 0.5),
            min_chunk_duration: secs_from_env("RPG_SCRIBE_MIN_CHUNK_DURATION_S", 0.5),
            sample_rate: env::var("RPG_SCRIBE_SAMPLE_RATE")
                .unwrap_or_else(|_| "48000".to_string())
                .parse()
                .unwrap_or(48_000),
            channels: 2,
            sample_width: 2,
            vad_aggressiveness: env::var("RPG_SCRIBE_VAD_AGGRESSIVENESS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .unwrap_or(2),
        };

        let transcriber = TranscriberConfig {
            model: env::var("TRANSCRIBER_MODEL").unwrap_or_else(|_| "whisper-1".to_string()),
            language: env::var("TRANSCRIBER_LANGUAGE").unwrap_or_else(|_| "en".to_string()),
            api_timeout: secs_from_env("TRANSCRIBER_API_TIMEOUT_S", 30.0),
            max_concurrent_requests: env::var("TRANSCRIBER_MAX_CONCURRENT_REQUESTS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .unwrap_or(4),
            queue_max_size: env::var("TRANSCRIBER_QUEUE_MAX_SIZE")
                .unwrap_or_else(|_| "64".to_string())
                .parse()
                .unwrap_or(64),
            max_retries: env::var("TRANSCRIBER_MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
            retry_base_delay: secs_from_env("TRANSCRIBER_RETRY_BASE_DELAY_S", 0.5),
            prompt_hint: String::new(),
            local_model_size: env::var("TRANSCRIBER_LOCAL_MODEL_SIZE")
                .unwrap_or_else(|_| "base".to_string()),
            device: env::var("TRANSCRIBER_DEVICE").unwrap_or_else(|_| "cpu".to_string()),
            compute_type: env::var("TRANSCRIBER_COMPUTE_TYPE").unwrap_or_else(|_| "int8".to_string()),
        };

        let summarizer = SummarizerConfig {
            model: env::var("SUMMARIZER_MODEL").unwrap_or_else(|_| "claude-sonnet".to_string()),
            max_tokens: env::var("SUMMARIZER_MAX_TOKENS")
                .unwrap_or_else(|_| "2048".to_string())
                .parse()
                .unwrap_or(2048),
            update_interval: secs_from_env("SUMMARIZER_UPDATE_INTERVAL_S", 120.0),
            max_pending_transcriptions: env::var("SUMMARIZER_MAX_PENDING_TRANSCRIPTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),
            api_timeout: secs_from_env("SUMMARIZER_API_TIMEOUT_S", 60.0),
            max_retries: env::var("SUMMARIZER_MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
            retry_base_delay: secs_from_env("SUMMARIZER_RETRY_BASE_DELAY_S", 0.5),
        };

        Ok(Self {
            listener,
            transcriber,
            summarizer,
            stt_api_key,
            llm_api_key,
            upstream_token,
            database_path,
        })
    }
}

fn secs_from_env(key: &str, default: f64) -> Duration {
    let value = env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default);
    Duration::from_secs_f64(value)
}

// --- Campaign TOML file -----------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CampaignDm {
    #[serde(default)]
    pub discord_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CampaignPlayer {
    pub discord_id: String,
    #[serde(default)]
    pub discord_name: String,
    pub character_name: String,
    #[serde(default)]
    pub character_description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CampaignNpc {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CustomInstructions {
    #[serde(default)]
    pub text: String,
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub game_system: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub campaign_summary: String,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub dm: CampaignDm,
    #[serde(default)]
    pub players: Vec<CampaignPlayer>,
    #[serde(default)]
    pub npcs: Vec<CampaignNpc>,
    #[serde(default)]
    pub custom_instructions: CustomInstructions,
}

/// Deserializes under a `[campaign]` table, matching the reference TOML
/// shape described in the external-interfaces section of the design.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CampaignFileWrapper {
    campaign: CampaignFile,
}

impl CampaignFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read campaign file {}", path.display()))?;
        let wrapper: CampaignFileWrapper = toml::from_str(&text)
            .with_context(|| format!("failed to parse campaign file {}", path.display()))?;
        Ok(wrapper.campaign)
    }

    /// Builds the immutable per-session context the summarizer works from.
    pub fn to_context(&self) -> CampaignContext {
        let players = self
            .players
            .iter()
            .map(|p| Player {
                speaker_id: p.discord_id.clone(),
                speaker_name: p.discord_name.clone(),
                character_name: p.character_name.clone(),
                character_description: p.character_description.clone(),
            })
            .collect();
        let npcs = self
            .npcs
            .iter()
            .map(|n| Npc {
                id: uuid::Uuid::new_v4().to_string(),
                campaign_id: self.id.clone(),
                name: n.name.clone(),
                description: n.description.clone(),
                first_seen_session: None,
            })
            .collect();

        CampaignContext {
            campaign_id: self.id.clone(),
            name: self.name.clone(),
            game_system: self.game_system.clone(),
            language: self.language.clone(),
            description: self.description.clone(),
            players,
            npcs,
            campaign_summary: self.campaign_summary.clone(),
            custom_instructions: self.custom_instructions.text.clone(),
            dm_speaker_id: self.dm.discord_id.clone(),
        }
    }
}

pub fn default_db_path() -> PathBuf {
    PathBuf::from("rpg-scribe.db")
}
