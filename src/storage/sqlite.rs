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

//! SQLite-backed `StorageGateway`. A single-connection pool matches the
//! reference design's single-connection `aiosqlite` wrapper: concurrent
//! writers queue on SQLite's own lock rather than an extra mutex.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::types::{
    CampaignContext, Npc, Player, Question, QuestionStatus, Session, SessionStatus, Transcription,
};

use super::StorageGateway;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS campaigns (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    game_system TEXT NOT NULL,
    language TEXT NOT NULL,
    description TEXT NOT NULL,
    campaign_summary TEXT NOT NULL,
    speaker_map TEXT NOT NULL,
    dm_speaker_id TEXT NOT NULL,
    custom_instructions TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS players (
    campaign_id TEXT NOT NULL,
    speaker_id TEXT NOT NULL,
    speaker_name TEXT NOT NULL,
    character_name TEXT NOT NULL,
    character_description TEXT NOT NULL,
    PRIMARY KEY (campaign_id, speaker_id)
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    campaign_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    session_summary TEXT NOT NULL,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transcriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    speaker_id TEXT NOT NULL,
    speaker_name TEXT NOT NULL,
    text TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    confidence REAL NOT NULL,
    is_ingame INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS npcs (
    id TEXT PRIMARY KEY,
    campaign_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    first_seen_session TEXT
);

CREATE TABLE IF NOT EXISTS questions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    question TEXT NOT NULL,
    answer TEXT,
    answered_at TEXT,
    status TEXT NOT NULL
);
"#;

pub struct SqliteStorageGateway {
    pool: SqlitePool,
}

impl SqliteStorageGateway {
    pub async fn connect(path: &str) -> Result<Self> {
        let options = if path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?.create_if_missing(true)
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }
}

fn status_to_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Completed => "completed",
    }
}

fn status_from_str(s: &str) -> SessionStatus {
    match s {
        "completed" => SessionStatus::Completed,
        _ => SessionStatus::Active,
    }
}

fn question_status_to_str(status: QuestionStatus) -> &'static str {
    match status {
        QuestionStatus::Pending => "pending",
        QuestionStatus::Answered => "answered",
        QuestionStatus::Processed => "processed",
    }
}

fn question_status_from_str(s: &str) -> QuestionStatus {
    match s {
        "answered" => QuestionStatus::Answered,
        "processed" => QuestionStatus::Processed,
        _ => QuestionStatus::Pending,
    }
}

#[async_trait]
impl StorageGateway for SqliteStorageGateway {
    async fn upsert_campaign(&self, campaign: &CampaignContext) -> Result<()> {
        let speaker_map: HashMap<String, String> = campaign.speaker_map();
        let speaker_map_json = serde_json::to_string(&speaker_map)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO campaigns (id, name, game_system, language, description, campaign_summary, speaker_map, dm_speaker_id, custom_instructions, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                game_system = excluded.game_system,
                language = excluded.language,
                description = excluded.description,
                campaign_summary = excluded.campaign_summary,
                speaker_map = excluded.speaker_map,
                dm_speaker_id = excluded.dm_speaker_id,
                custom_instructions = excluded.custom_instructions,
                updated_at = excluded.updated_at",
        )
        .bind(&campaign.campaign_id)
        .bind(&campaign.name)
        .bind(&campaign.game_system)
        .bind(&campaign.language)
        .bind(&campaign.description)
        .bind(&campaign.campaign_summary)
        .bind(&speaker_map_json)
        .bind(&campaign.dm_speaker_id)
        .bind(&campaign.custom_instructions)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        for player in &campaign.players {
            sqlx::query(
                "INSERT INTO players (campaign_id, speaker_id, speaker_name, character_name, character_description)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(campaign_id, speaker_id) DO UPDATE SET
                    speaker_name = excluded.speaker_name,
                    character_name = excluded.character_name,
                    character_description = excluded.character_description",
            )
            .bind(&campaign.campaign_id)
            .bind(&player.speaker_id)
            .bind(&player.speaker_name)
            .bind(&player.character_name)
            .bind(&player.character_description)
            .execute(&self.pool)
            .await?;
        }

        for npc in &campaign.npcs {
            self.save_npc(npc).await?;
        }

        Ok(())
    }

    async fn get_campaign(&self, campaign_id: &str) -> Result<Option<CampaignContext>> {
        let row = sqlx::query(
            "SELECT name, game_system, language, description, campaign_summary, dm_speaker_id, custom_instructions
             FROM campaigns WHERE id = ?",
        )
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let players = sqlx::query(
            "SELECT speaker_id, speaker_name, character_name, character_description FROM players WHERE campaign_id = ?",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| Player {
            speaker_id: r.get("speaker_id"),
            speaker_name: r.get("speaker_name"),
            character_name: r.get("character_name"),
            character_description: r.get("character_description"),
        })
        .collect();

        let npcs = self.get_npcs(campaign_id).await?;

        Ok(Some(CampaignContext {
            campaign_id: campaign_id.to_string(),
            name: row.get("name"),
            game_system: row.get("game_system"),
            language: row.get("language"),
            description: row.get("description"),
            players,
            npcs,
            campaign_summary: row.get("campaign_summary"),
            custom_instructions: row.get("custom_instructions"),
            dm_speaker_id: row.get("dm_speaker_id"),
        }))
    }

    async fn update_campaign_summary(&self, campaign_id: &str, summary: &str) -> Result<()> {
        sqlx::query("UPDATE campaigns SET campaign_summary = ?, updated_at = ? WHERE id = ?")
            .bind(summary)
            .bind(Utc::now().to_rfc3339())
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, campaign_id, started_at, ended_at, session_summary, status)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.session_id)
        .bind(&session.campaign_id)
        .bind(session.started_at.to_rfc3339())
        .bind(session.ended_at.map(|t| t.to_rfc3339()))
        .bind(&session.session_summary)
        .bind(status_to_str(session.status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn end_session(&self, session_id: &str, summary: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET ended_at = ?, session_summary = ?, status = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(summary)
        .bind(status_to_str(SessionStatus::Completed))
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            "SELECT id, campaign_id, started_at, ended_at, session_summary, status FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Session {
            session_id: r.get("id"),
            campaign_id: r.get("campaign_id"),
            started_at: parse_ts(r.get("started_at")),
            ended_at: r
                .get::<Option<String>, _>("ended_at")
                .map(|s| parse_ts(s)),
            session_summary: r.get("session_summary"),
            status: status_from_str(r.get::<String, _>("status").as_str()),
        }))
    }

    async fn list_sessions(&self, campaign_id: &str) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT id, campaign_id, started_at, ended_at, session_summary, status
             FROM sessions WHERE campaign_id = ? ORDER BY started_at DESC",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Session {
                session_id: r.get("id"),
                campaign_id: r.get("campaign_id"),
                started_at: parse_ts(r.get("started_at")),
                ended_at: r
                    .get::<Option<String>, _>("ended_at")
                    .map(|s| parse_ts(s)),
                session_summary: r.get("session_summary"),
                status: status_from_str(r.get::<String, _>("status").as_str()),
            })
            .collect())
    }

    async fn save_transcription(&self, transcription: &Transcription) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO transcriptions (session_id, speaker_id, speaker_name, text, timestamp, confidence, is_ingame)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&transcription.session_id)
        .bind(&transcription.speaker_id)
        .bind(&transcription.speaker_name)
        .bind(&transcription.text)
        .bind(transcription.timestamp.to_rfc3339())
        .bind(transcription.confidence)
        .bind(!transcription.is_partial)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn get_transcriptions(&self, session_id: &str) -> Result<Vec<Transcription>> {
        let rows = sqlx::query(
            "SELECT session_id, speaker_id, speaker_name, text, timestamp, confidence
             FROM transcriptions WHERE session_id = ? ORDER BY timestamp ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Transcription {
                session_id: r.get("session_id"),
                speaker_id: r.get("speaker_id"),
                speaker_name: r.get("speaker_name"),
                text: r.get("text"),
                timestamp: parse_ts(r.get("timestamp")),
                confidence: r.get("confidence"),
                is_partial: false,
            })
            .collect())
    }

    async fn save_npc(&self, npc: &Npc) -> Result<()> {
        sqlx::query(
            "INSERT INTO npcs (id, campaign_id, name, description, first_seen_session)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                first_seen_session = excluded.first_seen_session",
        )
        .bind(&npc.id)
        .bind(&npc.campaign_id)
        .bind(&npc.name)
        .bind(&npc.description)
        .bind(&npc.first_seen_session)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_npcs(&self, campaign_id: &str) -> Result<Vec<Npc>> {
        let rows = sqlx::query(
            "SELECT id, campaign_id, name, description, first_seen_session FROM npcs
             WHERE campaign_id = ? ORDER BY name ASC",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Npc {
                id: r.get("id"),
                campaign_id: r.get("campaign_id"),
                name: r.get("name"),
                description: r.get("description"),
                first_seen_session: r.get("first_seen_session"),
            })
            .collect())
    }

    async fn npc_exists(&self, campaign_id: &str, name: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 as present FROM npcs WHERE campaign_id = ? AND name = ?")
            .bind(campaign_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn save_question(&self, session_id: &str, text: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO questions (session_id, question, answer, answered_at, status)
             VALUES (?, ?, NULL, NULL, ?)",
        )
        .bind(session_id)
        .bind(text)
        .bind(question_status_to_str(QuestionStatus::Pending))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn answer_question(&self, id: i64, answer: &str) -> Result<()> {
        sqlx::query("UPDATE questions SET answer = ?, answered_at = ?, status = ? WHERE id = ?")
            .bind(answer)
            .bind(Utc::now().to_rfc3339())
            .bind(question_status_to_str(QuestionStatus::Answered))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_pending_questions(&self, session_id: &str) -> Result<Vec<Question>> {
        self.questions_with_status(session_id, QuestionStatus::Pending)
            .await
    }

    async fn get_answered_unprocessed_questions(&self, session_id: &str) -> Result<Vec<Question>> {
        self.questions_with_status(session_id, QuestionStatus::Answered)
            .await
    }

    async fn mark_questions_processed(&self, ids: &[i64]) -> Result<()> {
        for id in ids {
            sqlx::query("UPDATE questions SET status = ? WHERE id = ?")
                .bind(question_status_to_str(QuestionStatus::Processed))
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

impl SqliteStorageGateway {
    async fn questions_with_status(
        &self,
        session_id: &str,
        status: QuestionStatus,
    ) -> Result<Vec<Question>> {
        let rows = sqlx::query(
            "SELECT id, session_id, question, answer, status FROM questions
             WHERE session_id = ? AND status = ? ORDER BY id ASC",
        )
        .bind(session_id)
        .bind(question_status_to_str(status))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Question {
                id: r.get("id"),
                session_id: r.get("session_id"),
                text: r.get("question"),
                answer: r.get("answer"),
                status: question_status_from_str(r.get::<String, _>("status").as_str()),
            })
            .collect())
    }
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_gateway() -> SqliteStorageGateway {
        SqliteStorageGateway::connect(":memory:").await.unwrap()
    }

    fn campaign() -> CampaignContext {
        CampaignContext {
            campaign_id: "camp-1".into(),
            name: "Test Campaign".into(),
            game_system: "D&D 5e".into(),
            language: "en".into(),
            description: "a test".into(),
            players: vec![Player {
                speaker_id: "u1".into(),
                speaker_name: "Tim".into(),
                character_name: "Aelar".into(),
                character_description: "a ranger".into(),
            }],
            npcs: vec![],
            campaign_summary: String::new(),
            custom_instructions: String::new(),
            dm_speaker_id: "dm1".into(),
        }
    }

    #[tokio::test]
    async fn upsert_then_get_campaign_round_trips() {
        let gw = memory_gateway().await;
        gw.upsert_campaign(&campaign()).await.unwrap();
        let loaded = gw.get_campaign("camp-1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Test Campaign");
        assert_eq!(loaded.players[0].character_name, "Aelar");
    }

    #[tokio::test]
    async fn question_lifecycle_is_a_strict_prefix() {
        let gw = memory_gateway().await;
        let id = gw.save_question("s1", "Who leads?").await.unwrap();

        let pending = gw.get_pending_questions("s1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, QuestionStatus::Pending);

        gw.answer_question(id, "Aelar leads").await.unwrap();
        let answered = gw.get_answered_unprocessed_questions("s1").await.unwrap();
        assert_eq!(answered.len(), 1);
        assert_eq!(answered[0].answer.as_deref(), Some("Aelar leads"));

        gw.mark_questions_processed(&[id]).await.unwrap();
        let answered_again = gw.get_answered_unprocessed_questions("s1").await.unwrap();
        assert!(answered_again.is_empty());
    }

    #[tokio::test]
    async fn transcriptions_are_ordered_by_timestamp_ascending() {
        let gw = memory_gateway().await;
        let later = Transcription {
            session_id: "s1".into(),
            speaker_id: "u1".into(),
            speaker_name: "Tim".into(),
            text: "second".into(),
            timestamp: Utc::now(),
            confidence: 0.9,
            is_partial: false,
        };
        let mut earlier = later.clone();
        earlier.text = "first".into();
        earlier.timestamp = later.timestamp - chrono::Duration::seconds(5);

        gw.save_transcription(&later).await.unwrap();
        gw.save_transcription(&earlier).await.unwrap();

        let rows = gw.get_transcriptions("s1").await.unwrap();
        assert_eq!(rows[0].text, "first");
        assert_eq!(rows[1].text, "second");
    }

    #[tokio::test]
    async fn npc_exists_reflects_saved_npcs() {
        let gw = memory_gateway().await;
        assert!(!gw.npc_exists("camp-1", "Belak").await.unwrap());
        gw.save_npc(&Npc {
            id: "npc-1".into(),
            campaign_id: "camp-1".into(),
            name: "Belak".into(),
            description: "a druid".into(),
            first_seen_session: Some("s1".into()),
        })
        .await
        .unwrap();
        assert!(gw.npc_exists("camp-1", "Belak").await.unwrap());
    }

    #[tokio::test]
    async fn session_lifecycle_create_end_and_list() {
        let gw = memory_gateway().await;
        let session = Session {
            session_id: "s1".into(),
            campaign_id: "camp-1".into(),
            started_at: Utc::now(),
            ended_at: None,
            session_summary: String::new(),
            status: SessionStatus::Active,
        };
        gw.create_session(&session).await.unwrap();
        gw.end_session("s1", "final summary").await.unwrap();

        let loaded = gw.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert_eq!(loaded.session_summary, "final summary");
        assert!(loaded.ended_at.is_some());

        let listed = gw.list_sessions("camp-1").await.unwrap();
        assert_eq!(listed.len(), 1);
    }
}
