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

//! Core data model: sessions, speakers, and the events that flow across the
//! [`crate::bus::EventBus`]. Event payload structs are intentionally plain
//! data - no behavior lives here beyond small constructors and the
//! `EventKind` tag used by the bus registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status of a bounded recording interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub campaign_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub session_summary: String,
    pub status: SessionStatus,
}

/// One player's mapping from the upstream voice identity to the name used
/// in-fiction, resolved from the campaign's speaker map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub speaker_id: String,
    pub speaker_name: String,
    pub character_name: String,
    pub character_description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Npc {
    pub id: String,
    pub campaign_id: String,
    pub name: String,
    pub description: String,
    pub first_seen_session: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Pending,
    Answered,
    Processed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub session_id: String,
    pub text: String,
    pub answer: Option<String>,
    pub status: QuestionStatus,
}

/// Immutable per-session campaign context: everything the summarizer needs
/// to build its system prompt, plus the speaker map used throughout the
/// pipeline to turn a `speaker_id` into a display name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignContext {
    pub campaign_id: String,
    pub name: String,
    pub game_system: String,
    pub language: String,
    pub description: String,
    pub players: Vec<Player>,
    pub npcs: Vec<Npc>,
    pub campaign_summary: String,
    pub custom_instructions: String,
    pub dm_speaker_id: String,
}

impl CampaignContext {
    /// `speaker_id -> character_name`, used by the segmenter's prompt hint,
    /// the summarizer's ingestion and the DM lookup.
    pub fn speaker_map(&self) -> HashMap<String, String> {
        self.players
            .iter()
            .map(|p| (p.speaker_id.clone(), p.character_name.clone()))
            .collect()
    }

    pub fn display_name(&self, speaker_id: &str, fallback: &str) -> String {
        self.speaker_map()
            .get(speaker_id)
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }

    pub fn dm_display_name(&self) -> String {
        self.speaker_map()
            .get(&self.dm_speaker_id)
            .cloned()
            .unwrap_or_else(|| self.dm_speaker_id.clone())
    }
}

/// Tag for the upstream source that produced an `AudioChunk`, carried
/// through to storage for debugging/replay provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSourceTag {
    Live,
    File,
}

/// A discrete utterance-shaped slice of mono 16-bit 48 kHz PCM, emitted by
/// the audio segmenter for one speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioChunk {
    pub session_id: String,
    pub speaker_id: String,
    pub speaker_name: String,
    pub pcm: Vec<u8>,
    pub start_ts: DateTime<Utc>,
    pub duration_ms: u64,
    pub source: AudioSourceTag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcription {
    pub session_id: String,
    pub speaker_id: String,
    pub speaker_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub is_partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryUpdateType {
    Incremental,
    Revision,
    Final,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryUpdate {
    pub session_id: String,
    pub session_summary: String,
    pub campaign_summary: String,
    pub last_updated: DateTime<Utc>,
    pub update_type: SummaryUpdateType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Running,
    Idle,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub component: String,
    pub status: ComponentStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl SystemStatus {
    pub fn error(component: &str, message: impl Into<String>) -> Self {
        Self {
            component: component.to_string(),
            status: ComponentStatus::Error,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn running(component: &str, message: impl Into<String>) -> Self {
        Self {
            component: component.to_string(),
            status: ComponentStatus::Running,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// One event as it travels through the bus. Each variant corresponds to an
/// `EventKind`; the bus dispatches on the kind, never on the producer's
/// concrete type (see the REDESIGN notes in DESIGN.md).
#[derive(Debug, Clone)]
pub enum Event {
    AudioChunk(AudioChunk),
    Transcription(Transcription),
    SummaryUpdate(SummaryUpdate),
    SystemStatus(SystemStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AudioChunk,
    Transcription,
    SummaryUpdate,
    SystemStatus,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::AudioChunk(_) => EventKind::AudioChunk,
            Event::Transcription(_) => EventKind::Transcription,
            Event::SummaryUpdate(_) => EventKind::SummaryUpdate,
            Event::SystemStatus(_) => EventKind::SystemStatus,
        }
    }
}

impl From<AudioChunk> for Event {
    fn from(v: AudioChunk) -> Self {
        Event::AudioChunk(v)
    }
}

impl From<Transcription> for Event {
    fn from(v: Transcription) -> Self {
        Event::Transcription(v)
    }
}

impl From<SummaryUpdate> for Event {
    fn from(v: SummaryUpdate) -> Self {
        Event::SummaryUpdate(v)
    }
}

impl From<SystemStatus> for Event {
    fn from(v: SystemStatus) -> Self {
        Event::SystemStatus(v)
    }
}
