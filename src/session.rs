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

//! Wires the event bus, audio segmenter, transcription worker, incremental
//! summarizer and storage gateway together into one running recording
//! session. This is the only place that holds every component at once; each
//! component only knows about the bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::source::{AudioSource, Frame};
use crate::audio::AudioSegmenter;
use crate::bus::{EventBus, Handler};
use crate::config::Config;
use crate::storage::subscriber::StorageSubscriber;
use crate::storage::StorageGateway;
use crate::summarizer::{IncrementalSummarizer, LlmClient};
use crate::transcriber::{build_prompt_hint, SttClient, TranscriptionWorker};
use crate::types::{
    AudioSourceTag, CampaignContext, Event, EventKind, Session as SessionRecord, SessionStatus,
};

const CAMPAIGN_SUMMARY_HANDLER_ID: &str = "session-campaign-summary";
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// One running recording session: owns the bus and every subscriber, and is
/// the only component aware of the campaign's `campaign_id`, which is why it
/// (not the bus-only [`StorageSubscriber`]) persists campaign summary
/// updates.
pub struct ScribeSession {
    pub session_id: String,
    pub campaign: CampaignContext,
    bus: Arc<EventBus>,
    storage: Arc<dyn StorageGateway>,
    storage_subscriber: Arc<StorageSubscriber>,
    segmenter: Arc<AudioSegmenter>,
    transcriber: Arc<TranscriptionWorker>,
    summarizer: Arc<IncrementalSummarizer>,
    source: Arc<dyn AudioSource>,
    connect_task: Mutex<Option<JoinHandle<()>>>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    source_done: Arc<Notify>,
}

impl ScribeSession {
    /// Creates the session row, starts every component, and begins pumping
    /// frames from `source` into the segmenter.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        campaign: CampaignContext,
        config: Config,
        source: Arc<dyn AudioSource>,
        source_tag: AudioSourceTag,
        stt_client: Arc<dyn SttClient>,
        llm_client: Arc<dyn LlmClient>,
        storage: Arc<dyn StorageGateway>,
    ) -> Result<Arc<Self>> {
        let session_id = Uuid::new_v4().to_string();
        let bus = Arc::new(EventBus::new());

        storage
            .upsert_campaign(&campaign)
            .await
            .context("persisting campaign before session start")?;
        storage
            .create_session(&SessionRecord {
                session_id: session_id.clone(),
                campaign_id: campaign.campaign_id.clone(),
                started_at: chrono::Utc::now(),
                ended_at: None,
                session_summary: String::new(),
                status: SessionStatus::Active,
            })
            .await
            .context("creating session row")?;

        let character_names: Vec<String> = campaign
            .players
            .iter()
            .map(|p| p.character_name.clone())
            .collect();
        let mut transcriber_config = config.transcriber.clone();
        transcriber_config.prompt_hint = build_prompt_hint(&character_names);

        let segmenter = AudioSegmenter::new(session_id.clone(), config.listener.clone(), bus.clone());
        let transcriber = TranscriptionWorker::new(
            session_id.clone(),
            transcriber_config,
            stt_client,
            bus.clone(),
        );
        let summarizer = IncrementalSummarizer::new(
            session_id.clone(),
            campaign.clone(),
            config.summarizer.clone(),
            llm_client,
            storage.clone(),
            bus.clone(),
        );
        let storage_subscriber = StorageSubscriber::new(storage.clone());

        segmenter.start().await;
        transcriber.start().await;
        summarizer.start().await;
        storage_subscriber.start(&bus).await;
        bus.subscribe(
            EventKind::SummaryUpdate,
            CAMPAIGN_SUMMARY_HANDLER_ID,
            Arc::new(CampaignSummaryPersister {
                storage: storage.clone(),
                campaign_id: campaign.campaign_id.clone(),
            }),
        )
        .await;

        let scribe_session = Arc::new(Self {
            session_id,
            campaign,
            bus,
            storage,
            storage_subscriber,
            segmenter: segmenter.clone(),
            transcriber,
            summarizer,
            source: source.clone(),
            connect_task: Mutex::new(None),
            pump_task: Mutex::new(None),
            source_done: Arc::new(Notify::new()),
        });

        scribe_session.spawn_frame_pump(source, segmenter, source_tag).await;
        Ok(scribe_session)
    }

    async fn spawn_frame_pump(
        self: &Arc<Self>,
        source: Arc<dyn AudioSource>,
        segmenter: Arc<AudioSegmenter>,
        source_tag: AudioSourceTag,
    ) {
        let (tx, mut rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_CAPACITY);

        let connect_source = source.clone();
        let source_done = self.source_done.clone();
        let connect_task = tokio::spawn(async move {
            if let Err(err) = connect_source.connect(tx).await {
                tracing::error!(error = %err, "audio source connect failed");
            }
            source_done.notify_one();
        });

        let pump_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                segmenter
                    .ingest_frame(&frame.speaker_id, &frame.speaker_name, &frame.pcm, source_tag.clone())
                    .await;
            }
        });

        *self.connect_task.lock().await = Some(connect_task);
        *self.pump_task.lock().await = Some(pump_task);
    }

    /// Publishes a manually-supplied question answer onto the storage layer
    /// directly; the next summarizer pass will pick it up as part of its
    /// answered-unprocessed-questions fetch.
    pub async fn answer_question(&self, question_id: i64, answer: &str) -> Result<()> {
        self.storage.answer_question(question_id, answer).await
    }

    /// Stops every component in dependency order and runs the final
    /// summarization pass, returning the finished session summary.
    pub async fn finalize(self: &Arc<Self>) -> Result<String> {
        if let Some(handle) = self.connect_task.lock().await.take() {
            handle.abort();
        }
        self.source.disconnect().await;
        self.segmenter.stop().await;

        // Gives the transcription worker a short window to drain chunks the
        // final segmenter flush just queued before the worker is aborted.
        tokio::time::sleep(Duration::from_millis(500)).await;

        if let Some(handle) = self.pump_task.lock().await.take() {
            handle.abort();
        }
        self.transcriber.stop().await;

        let summary = self.summarizer.finalize().await?;
        self.summarizer.stop().await;

        self.storage_subscriber.stop(&self.bus).await;
        self.bus
            .unsubscribe(EventKind::SummaryUpdate, CAMPAIGN_SUMMARY_HANDLER_ID)
            .await;

        Ok(summary)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Resolves once every audio source has finished delivering frames
    /// (reached EOF, in the file-replay case). Useful for a caller that
    /// wants to finalize as soon as playback ends rather than waiting on a
    /// separate cancellation signal.
    pub async fn wait_for_source_eof(&self) {
        self.source_done.notified().await;
    }
}

struct CampaignSummaryPersister {
    storage: Arc<dyn StorageGateway>,
    campaign_id: String,
}

#[async_trait]
impl Handler for CampaignSummaryPersister {
    async fn handle(&self, event: Event) -> Result<()> {
        let Event::SummaryUpdate(update) = event else {
            return Ok(());
        };
        self.storage
            .update_campaign_summary(&self.campaign_id, &update.campaign_summary)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStorageGateway;
    use crate::types::{Player, Transcription};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SilentAudioSource;

    #[async_trait]
    impl AudioSource for SilentAudioSource {
        async fn connect(&self, _tx: mpsc::Sender<Frame>) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) {}
        async fn is_connected(&self) -> bool {
            false
        }
    }

    struct FakeSttClient;
    #[async_trait]
    impl SttClient for FakeSttClient {
        async fn transcribe(
            &self,
            _wav: &[u8],
            _cfg: &crate::config::TranscriberConfig,
        ) -> Result<String> {
            Ok("hello".to_string())
        }
    }

    struct FakeLlmClient(AtomicUsize);
    #[async_trait]
    impl LlmClient for FakeLlmClient {
        async fn complete(
            &self,
            _system: &str,
            _user: &str,
            _config: &crate::config::SummarizerConfig,
        ) -> Result<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok("---SESSION_SUMMARY---\nAll quiet.\n---CAMPAIGN_SUMMARY---\nStill quiet.".to_string())
        }
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
    async fn finalize_persists_session_and_campaign_summary() {
        let storage: Arc<dyn StorageGateway> =
            Arc::new(SqliteStorageGateway::connect(":memory:").await.unwrap());
        let config = Config {
            listener: crate::config::ListenerConfig::default(),
            transcriber: crate::config::TranscriberConfig::default(),
            summarizer: crate::config::SummarizerConfig::default(),
            stt_api_key: "test".into(),
            llm_api_key: "test".into(),
            upstream_token: None,
            database_path: ":memory:".into(),
        };

        let scribe_session = ScribeSession::start(
            campaign(),
            config,
            Arc::new(SilentAudioSource),
            AudioSourceTag::File,
            Arc::new(FakeSttClient),
            Arc::new(FakeLlmClient(AtomicUsize::new(0))),
            storage.clone(),
        )
        .await
        .unwrap();

        scribe_session
            .bus()
            .publish(
                Transcription {
                    session_id: scribe_session.session_id.clone(),
                    speaker_id: "u1".into(),
                    speaker_name: "Tim".into(),
                    text: "we search the ruins".into(),
                    timestamp: chrono::Utc::now(),
                    confidence: 0.9,
                    is_partial: false,
                }
                .into(),
            )
            .await;

        let summary = scribe_session.finalize().await.unwrap();
        assert_eq!(summary, "All quiet.");

        let loaded = storage.get_session(&scribe_session.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.session_summary, "All quiet.");

        let campaign_loaded = storage.get_campaign("camp-1").await.unwrap().unwrap();
        assert_eq!(campaign_loaded.campaign_summary, "Still quiet.");
    }
}
