//! Greeting module.
//!
//! Greets the author, or acknowledges a repeated greeting when the History Store
//! already holds more than one greeting from them today. A repeated greeting also
//! nudges the author's mood toward joy and away from sadness.

use async_trait::async_trait;
use chrono::NaiveTime;
use rand::SeedableRng;
use rand::rngs::StdRng;
use regex::{Regex, RegexBuilder};

use crate::emotion::EmotionTargets;
use crate::error::ModuleError;
use crate::interaction::{Interaction, TEXT_DATATYPE};
use crate::modules::{Module, ModuleConfig, ModuleContext};
use crate::phrases::Phrases;

/// Loader key.
pub const LOCATION: &str = "talk/hello_world";

/// Bodies treated as greetings (matched case-insensitively).
pub const GREETING_CONDITION: &str = r"^(salut|bonjour|bonsoir|hei|hi|hello|yo|o/)( rori| ?!?)$";

const FIRST_GREETINGS: &[&str] = &["salut", "bonjour", "longtime", "o/"];
const REPEAT_GREETINGS: &[&str] = &["already", "already2", ""];

const JOY_TARGET: u8 = 60;
const SADNESS_CAP: u8 = 20;
const MOOD_DELTA: u8 = 2;

pub struct HelloWorldModule {
    phrases: Phrases,
    greeting: Regex,
    rng: StdRng,
    stop: bool,
}

impl HelloWorldModule {
    pub fn new(config: ModuleConfig) -> Result<Self, ModuleError> {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Build with a caller-provided RNG, for reproducible phrase choice.
    pub fn with_rng(config: ModuleConfig, rng: StdRng) -> Result<Self, ModuleError> {
        let greeting = RegexBuilder::new(GREETING_CONDITION)
            .case_insensitive(true)
            .build()
            .map_err(|e| ModuleError::Resolution {
                location: config.location.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            phrases: config.phrases(),
            greeting,
            rng,
            stop: false,
        })
    }

    /// Number of greetings from the author since the start of the interaction's day (UTC).
    async fn greetings_today(
        &self,
        interaction: &Interaction,
        ctx: &ModuleContext,
    ) -> Result<usize, ModuleError> {
        let start_of_day = interaction
            .recorded_at()
            .date()
            .and_time(NaiveTime::default());
        let records = ctx
            .history
            .query_since(interaction.author_id(), start_of_day)
            .await?;
        Ok(records
            .iter()
            .filter(|r| self.greeting.is_match(&r.body))
            .count())
    }
}

#[async_trait]
impl Module for HelloWorldModule {
    async fn process(
        &mut self,
        interaction: &Interaction,
        ctx: &ModuleContext,
    ) -> Result<(), ModuleError> {
        let author = interaction.author_id();
        let seen = self.greetings_today(interaction, ctx).await?;

        if seen > 1 {
            let reply = self.phrases.pick(REPEAT_GREETINGS, &mut self.rng).to_string();
            ctx.reply(TEXT_DATATYPE, author, &reply);

            let current = ctx.emotions.get(author).await?;
            let targets = EmotionTargets::new()
                .joy(JOY_TARGET)
                .sadness(current.sadness.min(SADNESS_CAP));
            let mood = ctx.emotions.step_toward(author, &targets, MOOD_DELTA).await?;
            tracing::debug!(author, seen, joy = mood.joy, sadness = mood.sadness, "Greeted again");
        } else {
            let reply = self.phrases.pick(FIRST_GREETINGS, &mut self.rng).to_string();
            ctx.reply(TEXT_DATATYPE, author, &reply);
            tracing::debug!(author, "First greeting today");
        }

        self.stop = true;
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.stop
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{FixedOffset, TimeZone};
    use serde_json::json;

    use super::*;
    use crate::emotion::EmotionState;
    use crate::sink::MemorySink;
    use crate::store::{EmotionStore, LibSqlBackend};

    fn config() -> ModuleConfig {
        let phrase = |s: &str| json!({"en": s});
        ModuleConfig {
            name: "hello_world".into(),
            location: LOCATION.into(),
            metadata: json!({}),
            rsc: json!({
                "salut": phrase("Hi!"),
                "bonjour": phrase("Hello!"),
                "longtime": phrase("Long time no see!"),
                "o/": phrase("o/"),
                "already": phrase("Hi again."),
                "already2": phrase("You already said hi."),
            }),
            lang: "en".into(),
        }
    }

    fn at(hour: u32) -> Interaction {
        let time = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 1, hour, 0, 0)
            .unwrap();
        Interaction::new("u1", "hi", time)
    }

    struct Fixture {
        db: Arc<LibSqlBackend>,
        sink: Arc<MemorySink>,
        ctx: ModuleContext,
    }

    impl Fixture {
        async fn delivered(&self, count: usize) -> Vec<crate::sink::Delivery> {
            tokio::time::timeout(std::time::Duration::from_secs(2), self.sink.wait_for(count))
                .await
                .expect("reply never delivered")
        }
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sink = Arc::new(MemorySink::new());
        let ctx = ModuleContext::new(db.clone(), db.clone(), sink.clone());
        Fixture { db, sink, ctx }
    }

    async fn log(f: &Fixture, interaction: &Interaction) {
        f.ctx
            .history
            .append(interaction.author_id(), interaction.body(), interaction.recorded_at())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn first_greeting_of_the_day() {
        let f = fixture().await;
        let interaction = at(9);
        log(&f, &interaction).await;

        let mut module = HelloWorldModule::with_rng(config(), StdRng::seed_from_u64(1)).unwrap();
        module.process(&interaction, &f.ctx).await.unwrap();
        assert!(module.should_stop());

        let deliveries = f.delivered(1).await;
        assert_eq!(deliveries.len(), 1);
        assert!(["Hi!", "Hello!", "Long time no see!", "o/"].contains(&deliveries[0].content.as_str()));
        assert_eq!(deliveries[0].target, "u1");
        assert_eq!(f.db.get("u1").await.unwrap(), EmotionState::default());
    }

    #[tokio::test]
    async fn repeated_greeting_steps_mood() {
        let f = fixture().await;
        log(&f, &at(8)).await;
        let interaction = at(9);
        log(&f, &interaction).await;

        let mut module = HelloWorldModule::with_rng(config(), StdRng::seed_from_u64(1)).unwrap();
        module.process(&interaction, &f.ctx).await.unwrap();
        assert!(module.should_stop());

        for d in f.sink.deliveries().await {
            assert!(["Hi again.", "You already said hi."].contains(&d.content.as_str()));
        }
        let mood = f.db.get("u1").await.unwrap();
        assert_eq!(mood.joy, 52);
        assert_eq!(mood.sadness, 48);
        assert_eq!(mood.love, 50);
    }

    #[tokio::test]
    async fn yesterday_does_not_count() {
        let f = fixture().await;
        let yesterday = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 2, 29, 23, 0, 0)
            .unwrap();
        log(&f, &Interaction::new("u1", "hello", yesterday)).await;
        let interaction = at(9);
        log(&f, &interaction).await;

        let mut module = HelloWorldModule::with_rng(config(), StdRng::seed_from_u64(3)).unwrap();
        module.process(&interaction, &f.ctx).await.unwrap();

        assert_eq!(f.db.get("u1").await.unwrap(), EmotionState::default());
    }

    #[tokio::test]
    async fn other_messages_do_not_count() {
        let f = fixture().await;
        log(&f, &Interaction::new("u1", "what time is it", at(8).time())).await;
        let interaction = at(9);
        log(&f, &interaction).await;

        let mut module = HelloWorldModule::with_rng(config(), StdRng::seed_from_u64(3)).unwrap();
        module.process(&interaction, &f.ctx).await.unwrap();

        assert_eq!(f.delivered(1).await.len(), 1);
        assert_eq!(f.db.get("u1").await.unwrap().joy, 50);
    }

    #[tokio::test]
    async fn missing_phrases_send_nothing() {
        let f = fixture().await;
        let interaction = at(9);
        log(&f, &interaction).await;

        let mut bare = config();
        bare.rsc = json!({});
        let mut module = HelloWorldModule::with_rng(bare, StdRng::seed_from_u64(1)).unwrap();
        module.process(&interaction, &f.ctx).await.unwrap();

        assert!(f.sink.deliveries().await.is_empty());
        assert!(module.should_stop());
    }
}
