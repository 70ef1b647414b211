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

//! Typed in-process publish/subscribe registry. Handlers of one `EventKind`
//! are fanned out to concurrently and joined before `publish` returns; a
//! handler that errors is logged and otherwise invisible to its siblings.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{Event, EventKind};

/// A bus subscriber. Implementors are free to suspend (do I/O, call a
/// remote service); the bus does not serialize them against each other.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

struct Subscription {
    handler_id: String,
    handler: Arc<dyn Handler>,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscription>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Idempotent: re-subscribing the same `(event_kind, handler_id)`
    /// replaces the closure rather than duplicating the registration.
    pub async fn subscribe(
        &self,
        kind: EventKind,
        handler_id: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) {
        let handler_id = handler_id.into();
        let mut subs = self.subscribers.write().await;
        let bucket = subs.entry(kind).or_default();
        if let Some(existing) = bucket.iter_mut().find(|s| s.handler_id == handler_id) {
            existing.handler = handler;
        } else {
            bucket.push(Subscription { handler_id, handler });
        }
    }

    /// No-op if the `(event_kind, handler_id)` pair is not registered.
    pub async fn unsubscribe(&self, kind: EventKind, handler_id: &str) {
        let mut subs = self.subscribers.write().await;
        if let Some(bucket) = subs.get_mut(&kind) {
            bucket.retain(|s| s.handler_id != handler_id);
        }
    }

    /// Fans the event out to every subscriber of `event.kind()` concurrently
    /// and awaits them all. A handler failure is logged with its id and the
    /// error and never propagates out of `publish`, nor affects siblings.
    /// A no-subscriber publish is a fast no-op (no lock is even read past
    /// the initial snapshot).
    pub async fn publish(&self, event: Event) {
        let kind = event.kind();
        let handlers: Vec<(String, Arc<dyn Handler>)> = {
            let subs = self.subscribers.read().await;
            match subs.get(&kind) {
                Some(bucket) if !bucket.is_empty() => bucket
                    .iter()
                    .map(|s| (s.handler_id.clone(), s.handler.clone()))
                    .collect(),
                _ => return,
            }
        };

        let futures = handlers.into_iter().map(|(handler_id, handler)| {
            let event = event.clone();
            async move {
                if let Err(err) = handler.handle(event).await {
                    tracing::error!(handler_id = %handler_id, kind = ?kind, error = %err, "event handler failed");
                }
            }
        });
        futures::future::join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ComponentStatus, SystemStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct Failing;
    #[async_trait]
    impl Handler for Failing {
        async fn handle(&self, _event: Event) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    struct Counting(Arc<AtomicUsize>);
    #[async_trait]
    impl Handler for Counting {
        async fn handle(&self, _event: Event) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Recording(Arc<StdMutex<Vec<String>>>);
    #[async_trait]
    impl Handler for Recording {
        async fn handle(&self, _event: Event) -> anyhow::Result<()> {
            self.0.lock().unwrap().push("ok".to_string());
            Ok(())
        }
    }

    fn status_event() -> Event {
        Event::SystemStatus(SystemStatus {
            component: "test".into(),
            status: ComponentStatus::Running,
            message: "".into(),
            timestamp: chrono::Utc::now(),
        })
    }

    #[tokio::test]
    async fn isolates_failing_handlers_from_siblings() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::SystemStatus, "failing", Arc::new(Failing))
            .await;
        bus.subscribe(
            EventKind::SystemStatus,
            "counting",
            Arc::new(Counting(count.clone())),
        )
        .await;

        for _ in 0..5 {
            bus.publish(status_event()).await;
        }

        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn fan_out_isolation_exact_list() {
        let bus = EventBus::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe(EventKind::SystemStatus, "failing", Arc::new(Failing))
            .await;
        bus.subscribe(
            EventKind::SystemStatus,
            "recording",
            Arc::new(Recording(seen.clone())),
        )
        .await;

        bus.publish(status_event()).await;

        assert_eq!(*seen.lock().unwrap(), vec!["ok".to_string()]);
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_on_handler_id() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            EventKind::SystemStatus,
            "h",
            Arc::new(Counting(count.clone())),
        )
        .await;
        bus.subscribe(
            EventKind::SystemStatus,
            "h",
            Arc::new(Counting(count.clone())),
        )
        .await;

        bus.publish(status_event()).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_a_noop_when_absent() {
        let bus = EventBus::new();
        bus.unsubscribe(EventKind::SystemStatus, "nonexistent").await;
        bus.publish(status_event()).await;
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_fast_noop() {
        let bus = EventBus::new();
        bus.publish(status_event()).await;
    }
}
