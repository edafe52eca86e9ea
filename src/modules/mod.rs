//! Module abstraction: pluggable handlers invoked by the router.
//!
//! A module is built fresh for every invocation by a `ModuleLoader`, runs
//! `process` once, then reports through `should_stop` whether later candidates
//! may still see the interaction.

pub mod hello_world;
pub mod history;
pub mod loader;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ModuleError;
use crate::interaction::Interaction;
use crate::phrases::Phrases;
use crate::sink::MessageSink;
use crate::store::{EmotionStore, HistoryStore};

pub use loader::{ModuleFactory, ModuleLoader, StaticLoader};

/// A handler for interactions.
#[async_trait]
pub trait Module: Send {
    /// Handle one interaction. May read and write the stores and reply through the sink.
    async fn process(
        &mut self,
        interaction: &Interaction,
        ctx: &ModuleContext,
    ) -> Result<(), ModuleError>;

    /// Whether later modules must not run for this interaction. Defaults to continuing.
    fn should_stop(&self) -> bool {
        false
    }
}

/// Store and sink handles shared by every module invocation.
#[derive(Clone)]
pub struct ModuleContext {
    pub history: Arc<dyn HistoryStore>,
    pub emotions: Arc<dyn EmotionStore>,
    pub sink: Arc<dyn MessageSink>,
}

impl ModuleContext {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        emotions: Arc<dyn EmotionStore>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            history,
            emotions,
            sink,
        }
    }

    /// Queue a reply on a detached task and return immediately. Delivery never
    /// counts against the module's time budget, and a `SinkError` is only logged.
    /// Empty content is not sent.
    pub fn reply(&self, content_type: &str, target_author_id: &str, content: &str) {
        if content.is_empty() {
            tracing::debug!(to = target_author_id, "Empty reply skipped");
            return;
        }

        let sink = Arc::clone(&self.sink);
        let content_type = content_type.to_string();
        let target = target_author_id.to_string();
        let content = content.to_string();
        tokio::spawn(async move {
            if let Err(e) = sink.send(&content_type, &target, &content).await {
                tracing::warn!(sink = sink.name(), to = %target, error = %e, "Reply delivery failed");
            }
        });
    }
}

/// Everything a factory needs to build one module instance.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    /// Registry name of the module.
    pub name: String,
    pub location: String,
    /// Descriptor metadata.
    pub metadata: serde_json::Value,
    /// Contents of the module's `rsc.json`, `{}` when absent.
    pub rsc: serde_json::Value,
    pub lang: String,
}

impl ModuleConfig {
    pub fn phrases(&self) -> Phrases {
        Phrases::new(self.rsc.clone(), self.lang.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{FixedOffset, TimeZone};

    use super::*;
    use crate::error::SinkError;
    use crate::interaction::TEXT_DATATYPE;
    use crate::sink::MemorySink;
    use crate::store::LibSqlBackend;

    struct FailingSink;

    #[async_trait]
    impl MessageSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send(&self, _: &str, _: &str, _: &str) -> Result<(), SinkError> {
            Err(SinkError::SendFailed {
                sink: "failing".into(),
                reason: "offline".into(),
            })
        }
    }

    /// Never completes a send.
    struct StalledSink;

    #[async_trait]
    impl MessageSink for StalledSink {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn send(&self, _: &str, _: &str, _: &str) -> Result<(), SinkError> {
            std::future::pending().await
        }
    }

    async fn context(sink: Arc<dyn MessageSink>) -> ModuleContext {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        ModuleContext::new(db.clone(), db, sink)
    }

    #[tokio::test]
    async fn empty_reply_is_not_sent() {
        let sink = Arc::new(MemorySink::new());
        let ctx = context(sink.clone()).await;
        ctx.reply(TEXT_DATATYPE, "u1", "");
        ctx.reply(TEXT_DATATYPE, "u1", "hey");

        let deliveries = tokio::time::timeout(Duration::from_secs(2), sink.wait_for(1))
            .await
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].content, "hey");
    }

    #[tokio::test]
    async fn reply_does_not_wait_for_the_sink() {
        let ctx = context(Arc::new(StalledSink)).await;
        let started = std::time::Instant::now();
        ctx.reply(TEXT_DATATYPE, "u1", "hey");
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn failed_delivery_keeps_store_writes_and_stop() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let ctx = ModuleContext::new(db.clone(), db.clone(), Arc::new(FailingSink));
        let phrase = |s: &str| serde_json::json!({"en": s});
        let config = ModuleConfig {
            name: "hello_world".into(),
            location: hello_world::LOCATION.into(),
            metadata: serde_json::json!({}),
            rsc: serde_json::json!({
                "salut": phrase("Hi!"),
                "bonjour": phrase("Hello!"),
                "longtime": phrase("Long time no see!"),
                "o/": phrase("o/"),
                "already": phrase("Hi again."),
                "already2": phrase("You already said hi."),
            }),
            lang: "en".into(),
        };
        let at = |hour: u32| {
            let time = FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2024, 3, 1, hour, 0, 0)
                .unwrap();
            Interaction::new("u1", "hi", time)
        };

        for interaction in [at(8), at(9)] {
            db.append(interaction.author_id(), interaction.body(), interaction.recorded_at())
                .await
                .unwrap();
            let mut module = hello_world::HelloWorldModule::new(config.clone()).unwrap();
            module.process(&interaction, &ctx).await.unwrap();
            assert!(module.should_stop());
        }

        let mood = db.get("u1").await.unwrap();
        assert_eq!((mood.joy, mood.sadness), (52, 48));
        let since = at(0).recorded_at();
        assert_eq!(db.query_since("u1", since).await.unwrap().len(), 2);
    }

    #[test]
    fn config_phrases_use_language() {
        let config = ModuleConfig {
            name: "hello_world".into(),
            location: "talk/hello_world".into(),
            metadata: serde_json::json!({}),
            rsc: serde_json::json!({"salut": {"fr": "Salut"}}),
            lang: "fr".into(),
        };
        assert_eq!(config.phrases().get("salut"), "Salut");
    }
}
