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

pub mod sqlite;
pub mod subscriber;

use async_trait::async_trait;

use crate::types::{CampaignContext, Npc, Question, Session, Transcription};

/// Narrow persistence boundary the core calls through. Every operation is
/// async; implementations serialize their own writes (the SQLite adapter
/// does so naturally via a single-connection pool).
#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn upsert_campaign(&self, campaign: &CampaignContext) -> anyhow::Result<()>;
    async fn get_campaign(&self, campaign_id: &str) -> anyhow::Result<Option<CampaignContext>>;
    async fn update_campaign_summary(&self, campaign_id: &str, summary: &str) -> anyhow::Result<()>;

    async fn create_session(&self, session: &Session) -> anyhow::Result<()>;
    async fn end_session(&self, session_id: &str, summary: &str) -> anyhow::Result<()>;
    async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<Session>>;
    async fn list_sessions(&self, campaign_id: &str) -> anyhow::Result<Vec<Session>>;

    async fn save_transcription(&self, transcription: &Transcription) -> anyhow::Result<i64>;
    async fn get_transcriptions(&self, session_id: &str) -> anyhow::Result<Vec<Transcription>>;

    async fn save_npc(&self, npc: &Npc) -> anyhow::Result<()>;
    async fn get_npcs(&self, campaign_id: &str) -> anyhow::Result<Vec<Npc>>;
    async fn npc_exists(&self, campaign_id: &str, name: &str) -> anyhow::Result<bool>;

    async fn save_question(&self, session_id: &str, text: &str) -> anyhow::Result<i64>;
    async fn answer_question(&self, id: i64, answer: &str) -> anyhow::Result<()>;
    async fn get_pending_questions(&self, session_id: &str) -> anyhow::Result<Vec<Question>>;
    async fn get_answered_unprocessed_questions(
        &self,
        session_id: &str,
    ) -> anyhow::Result<Vec<Question>>;
    async fn mark_questions_processed(&self, ids: &[i64]) -> anyhow::Result<()>;
}
