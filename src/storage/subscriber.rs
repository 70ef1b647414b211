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

//! Bus-facing adapter: persists `Transcription` and `SummaryUpdate` events
//! as they cross the bus. The summarizer still talks to `StorageGateway`
//! directly for the read-then-mark-processed question protocol, since that
//! needs a synchronous round trip the fire-and-forget bus can't give it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{EventBus, Handler};
use crate::storage::StorageGateway;
use crate::types::{Event, EventKind};

pub const TRANSCRIPTION_HANDLER_ID: &str = "storage-transcriptions";
pub const SUMMARY_HANDLER_ID: &str = "storage-summaries";

pub struct StorageSubscriber {
    storage: Arc<dyn StorageGateway>,
}

impl StorageSubscriber {
    pub fn new(storage: Arc<dyn StorageGateway>) -> Arc<Self> {
        Arc::new(Self { storage })
    }

    pub async fn start(self: &Arc<Self>, bus: &EventBus) {
        bus.subscribe(
            EventKind::Transcription,
            TRANSCRIPTION_HANDLER_ID,
            Arc::new(TranscriptionPersister {
                storage: self.storage.clone(),
            }),
        )
        .await;
        bus.subscribe(
            EventKind::SummaryUpdate,
            SUMMARY_HANDLER_ID,
            Arc::new(SummaryPersister {
                storage: self.storage.clone(),
            }),
        )
        .await;
    }

    pub async fn stop(&self, bus: &EventBus) {
        bus.unsubscribe(EventKind::Transcription, TRANSCRIPTION_HANDLER_ID)
            .await;
        bus.unsubscribe(EventKind::SummaryUpdate, SUMMARY_HANDLER_ID)
            .await;
    }
}

struct TranscriptionPersister {
    storage: Arc<dyn StorageGateway>,
}

#[async_trait]
impl Handler for TranscriptionPersister {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        let Event::Transcription(t) = event else {
            return Ok(());
        };
        if t.is_partial {
            return Ok(());
        }
        self.storage.save_transcription(&t).await?;
        Ok(())
    }
}

struct SummaryPersister {
    storage: Arc<dyn StorageGateway>,
}

#[async_trait]
impl Handler for SummaryPersister {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        let Event::SummaryUpdate(update) = event else {
            return Ok(());
        };
        if update.update_type == crate::types::SummaryUpdateType::Final {
            self.storage
                .end_session(&update.session_id, &update.session_summary)
                .await?;
        }
        Ok(())
    }
}
