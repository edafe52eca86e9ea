//! Router: runs one dispatch cycle per interaction.
//!
//! Candidates come from the registry already ordered by `(priority, registration
//! order)` and run strictly one after another: a later module may read what an
//! earlier one wrote, and a stop signal must be seen before the next candidate
//! starts. Each invocation runs in its own task under a timeout, so a module that
//! fails, panics or hangs is recorded as failed and the cycle moves on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::ModuleError;
use crate::interaction::Interaction;
use crate::modules::{ModuleContext, ModuleLoader};
use crate::registry::{ModuleDescriptor, ModuleRegistry};

/// Bound on one `process` call when none is configured.
pub const DEFAULT_MODULE_TIMEOUT: Duration = Duration::from_secs(5);

/// What happened when one candidate was invoked.
#[derive(Debug)]
pub enum Outcome {
    /// Processed; later candidates may run.
    Continue,
    /// Processed and asked to end the cycle.
    Stop,
    /// Could not be resolved, returned an error, panicked or timed out.
    Failed(ModuleError),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

/// One invoked candidate.
#[derive(Debug)]
pub struct Invocation {
    /// Registry name.
    pub module: String,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// Outcome of one dispatch cycle, in invocation order.
#[derive(Debug)]
pub struct DispatchResult {
    pub cycle_id: Uuid,
    pub invocations: Vec<Invocation>,
}

impl DispatchResult {
    /// Names of the invoked modules, in order.
    pub fn invoked(&self) -> Vec<&str> {
        self.invocations.iter().map(|i| i.module.as_str()).collect()
    }

    /// The module that ended the cycle, if any.
    pub fn stopped_by(&self) -> Option<&str> {
        self.invocations
            .iter()
            .find(|i| matches!(i.outcome, Outcome::Stop))
            .map(|i| i.module.as_str())
    }

    pub fn failures(&self) -> impl Iterator<Item = &Invocation> {
        self.invocations.iter().filter(|i| i.outcome.is_failure())
    }

    /// True when no candidate matched.
    pub fn is_empty(&self) -> bool {
        self.invocations.is_empty()
    }
}

/// Dispatches interactions to the registry's modules.
pub struct Router {
    registry: Arc<ModuleRegistry>,
    loader: Arc<dyn ModuleLoader>,
    ctx: ModuleContext,
    module_timeout: Duration,
}

impl Router {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        loader: Arc<dyn ModuleLoader>,
        ctx: ModuleContext,
    ) -> Self {
        Self {
            registry,
            loader,
            ctx,
            module_timeout: DEFAULT_MODULE_TIMEOUT,
        }
    }

    pub fn with_module_timeout(mut self, timeout: Duration) -> Self {
        self.module_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Run one dispatch cycle. An empty result means no module matched.
    pub async fn route(&self, interaction: &Interaction) -> DispatchResult {
        let cycle_id = Uuid::new_v4();
        let candidates = self
            .registry
            .find_candidates(interaction.body(), interaction.datatype())
            .await;

        tracing::debug!(
            cycle = %cycle_id,
            author = interaction.author_id(),
            candidates = candidates.len(),
            "Dispatch cycle started"
        );

        let mut invocations = Vec::with_capacity(candidates.len());
        for descriptor in &candidates {
            let start = Instant::now();
            let outcome = self.run_module(descriptor, interaction).await;
            let elapsed = start.elapsed();

            match &outcome {
                Outcome::Failed(e) => {
                    tracing::warn!(
                        cycle = %cycle_id,
                        module = %descriptor.name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        error = %e,
                        "Module failed"
                    );
                }
                _ => {
                    tracing::debug!(
                        cycle = %cycle_id,
                        module = %descriptor.name,
                        elapsed_ms = elapsed.as_millis() as u64,
                        stop = matches!(outcome, Outcome::Stop),
                        "Module processed"
                    );
                }
            }

            let stop = matches!(outcome, Outcome::Stop);
            invocations.push(Invocation {
                module: descriptor.name.clone(),
                outcome,
                elapsed,
            });
            if stop {
                break;
            }
        }

        let result = DispatchResult {
            cycle_id,
            invocations,
        };
        tracing::info!(
            cycle = %cycle_id,
            author = interaction.author_id(),
            invoked = result.invocations.len(),
            failed = result.failures().count(),
            stopped_by = result.stopped_by().unwrap_or("-"),
            "Dispatch cycle complete"
        );
        result
    }

    /// Resolve and run one module in its own task, bounded by the module timeout.
    /// Used for each dispatch candidate and for scheduled runs.
    pub async fn run_module(
        &self,
        descriptor: &ModuleDescriptor,
        interaction: &Interaction,
    ) -> Outcome {
        let mut module = match self.loader.load(descriptor).await {
            Ok(module) => module,
            Err(e) => return Outcome::Failed(e),
        };

        let interaction = interaction.clone();
        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move {
            module
                .process(&interaction, &ctx)
                .await
                .map(|()| module.should_stop())
        });
        let abort = handle.abort_handle();

        match tokio::time::timeout(self.module_timeout, handle).await {
            Ok(Ok(Ok(true))) => Outcome::Stop,
            Ok(Ok(Ok(false))) => Outcome::Continue,
            Ok(Ok(Err(e))) => Outcome::Failed(e),
            Ok(Err(join_err)) if join_err.is_panic() => Outcome::Failed(ModuleError::Panicked {
                name: descriptor.name.clone(),
            }),
            Ok(Err(join_err)) => Outcome::Failed(ModuleError::Execution {
                name: descriptor.name.clone(),
                reason: join_err.to_string(),
            }),
            Err(_) => {
                abort.abort();
                Outcome::Failed(ModuleError::Timeout {
                    name: descriptor.name.clone(),
                    timeout: self.module_timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use chrono::{FixedOffset, TimeZone};

    use crate::error::SinkError;
    use crate::interaction::now;
    use crate::modules::hello_world::{self, HelloWorldModule};
    use crate::modules::{Module, ModuleConfig, StaticLoader};
    use crate::registry::default_descriptors;
    use crate::sink::{MemorySink, MessageSink};
    use crate::store::{EmotionStore, LibSqlBackend};

    #[derive(Clone, Copy)]
    enum Behavior {
        Continue,
        Stop,
        Fail,
        FailAfterStop,
        Panic,
        Hang,
    }

    type Trace = Arc<Mutex<Vec<String>>>;

    struct Scripted {
        name: String,
        behavior: Behavior,
        trace: Trace,
        stop: bool,
    }

    #[async_trait]
    impl Module for Scripted {
        async fn process(
            &mut self,
            _interaction: &Interaction,
            _ctx: &ModuleContext,
        ) -> Result<(), ModuleError> {
            self.trace.lock().unwrap().push(self.name.clone());
            match self.behavior {
                Behavior::Continue => Ok(()),
                Behavior::Stop => {
                    self.stop = true;
                    Ok(())
                }
                Behavior::Fail => Err(ModuleError::Execution {
                    name: self.name.clone(),
                    reason: "boom".into(),
                }),
                Behavior::FailAfterStop => {
                    self.stop = true;
                    Err(ModuleError::Execution {
                        name: self.name.clone(),
                        reason: "boom".into(),
                    })
                }
                Behavior::Panic => panic!("module exploded"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }

        fn should_stop(&self) -> bool {
            self.stop
        }
    }

    /// Router over modules `(name, priority, condition, behavior)`, each at location `name`.
    async fn router(modules: &[(&str, i64, &str, Behavior)]) -> (Router, Trace) {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(ModuleRegistry::new());
        let mut loader = StaticLoader::new("/nonexistent", "en");

        for &(name, priority, condition, behavior) in modules {
            registry
                .register(ModuleDescriptor::new(name, priority, condition, name))
                .await
                .unwrap();
            let trace = trace.clone();
            loader.register(name, move |config| {
                Ok(Box::new(Scripted {
                    name: config.name,
                    behavior,
                    trace: trace.clone(),
                    stop: false,
                }))
            });
        }

        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let ctx = ModuleContext::new(db.clone(), db, Arc::new(MemorySink::new()));
        let router = Router::new(registry, Arc::new(loader), ctx)
            .with_module_timeout(Duration::from_millis(200));
        (router, trace)
    }

    fn hi() -> Interaction {
        Interaction::new("u1", "hi", now())
    }

    #[tokio::test]
    async fn stop_ends_the_cycle() {
        let (router, trace) = router(&[
            ("logger", 0, ".*", Behavior::Continue),
            ("greeter", 1, "^hi$", Behavior::Stop),
            ("fallback", 2, ".*", Behavior::Continue),
        ])
        .await;

        let result = router.route(&hi()).await;
        assert_eq!(result.invoked(), vec!["logger", "greeter"]);
        assert_eq!(result.stopped_by(), Some("greeter"));
        assert_eq!(*trace.lock().unwrap(), vec!["logger", "greeter"]);
    }

    #[tokio::test]
    async fn no_candidates_is_empty_result() {
        let (router, _) = router(&[("greeter", 1, "^hi$", Behavior::Stop)]).await;
        let result = router.route(&Interaction::new("u1", "bye", now())).await;
        assert!(result.is_empty());
        assert_eq!(result.stopped_by(), None);
    }

    #[tokio::test]
    async fn failure_does_not_abort_cycle() {
        let (router, _) = router(&[
            ("broken", 0, ".*", Behavior::Fail),
            ("greeter", 1, ".*", Behavior::Continue),
        ])
        .await;

        let result = router.route(&hi()).await;
        assert_eq!(result.invoked(), vec!["broken", "greeter"]);
        let failed: Vec<&str> = result.failures().map(|i| i.module.as_str()).collect();
        assert_eq!(failed, vec!["broken"]);
        assert!(matches!(result.invocations[1].outcome, Outcome::Continue));
    }

    #[tokio::test]
    async fn failed_module_never_stops() {
        let (router, _) = router(&[
            ("half", 0, ".*", Behavior::FailAfterStop),
            ("next", 1, ".*", Behavior::Continue),
        ])
        .await;

        let result = router.route(&hi()).await;
        assert_eq!(result.invoked(), vec!["half", "next"]);
        assert_eq!(result.stopped_by(), None);
    }

    #[tokio::test]
    async fn panic_is_isolated() {
        let (router, _) = router(&[
            ("explodes", 0, ".*", Behavior::Panic),
            ("survivor", 1, ".*", Behavior::Stop),
        ])
        .await;

        let result = router.route(&hi()).await;
        assert!(matches!(
            result.invocations[0].outcome,
            Outcome::Failed(ModuleError::Panicked { .. })
        ));
        assert_eq!(result.stopped_by(), Some("survivor"));
    }

    #[tokio::test]
    async fn hanging_module_times_out() {
        let (router, _) = router(&[
            ("sleeper", 0, ".*", Behavior::Hang),
            ("after", 1, ".*", Behavior::Continue),
        ])
        .await;

        let result = router.route(&hi()).await;
        assert!(matches!(
            result.invocations[0].outcome,
            Outcome::Failed(ModuleError::Timeout { .. })
        ));
        assert!(result.invocations[0].elapsed < Duration::from_secs(5));
        assert!(matches!(result.invocations[1].outcome, Outcome::Continue));
    }

    #[tokio::test]
    async fn unresolvable_module_is_failed() {
        let (router, _) = router(&[("greeter", 1, ".*", Behavior::Stop)]).await;
        router
            .registry()
            .register(ModuleDescriptor::new("ghost", 0, ".*", "nowhere"))
            .await
            .unwrap();

        let result = router.route(&hi()).await;
        assert_eq!(result.invoked(), vec!["ghost", "greeter"]);
        assert!(matches!(
            result.invocations[0].outcome,
            Outcome::Failed(ModuleError::Resolution { .. })
        ));
    }

    #[tokio::test]
    async fn routing_is_deterministic() {
        let (router, _) = router(&[
            ("b", 1, ".*", Behavior::Continue),
            ("a", 1, ".*", Behavior::Continue),
            ("first", 0, "h", Behavior::Continue),
            ("stopper", 2, "^hi$", Behavior::Stop),
            ("late", 3, ".*", Behavior::Continue),
        ])
        .await;

        let one = router.route(&hi()).await;
        let two = router.route(&hi()).await;
        assert_eq!(one.invoked(), vec!["first", "b", "a", "stopper"]);
        assert_eq!(one.invoked(), two.invoked());
        assert_eq!(one.stopped_by(), two.stopped_by());
        assert_ne!(one.cycle_id, two.cycle_id);
    }

    #[tokio::test]
    async fn content_type_filters_candidates() {
        let (router, _) = router(&[("logger", 0, ".*", Behavior::Continue)]).await;
        router
            .registry()
            .upsert(ModuleDescriptor::new("logger", 0, ".*", "logger").with_content_type("text/plain"))
            .await
            .unwrap();

        assert_eq!(router.route(&hi()).await.invoked(), vec!["logger"]);
        assert!(router.route(&hi().with_datatype("image")).await.is_empty());
    }

    /// Accepts every reply, but only after `delay`.
    struct SlowSink {
        delay: Duration,
    }

    #[async_trait]
    impl MessageSink for SlowSink {
        fn name(&self) -> &str {
            "slow"
        }

        async fn send(&self, _: &str, _: &str, _: &str) -> Result<(), SinkError> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn greeting_rsc() -> serde_json::Value {
        let phrase = |s: &str| serde_json::json!({"en": s});
        serde_json::json!({
            "salut": phrase("Hi!"),
            "bonjour": phrase("Hello!"),
            "longtime": phrase("Long time no see!"),
            "o/": phrase("o/"),
            "already": phrase("Hi again."),
            "already2": phrase("You already said hi."),
        })
    }

    #[tokio::test]
    async fn slow_sink_does_not_time_out_replying_module() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(ModuleRegistry::new());
        for descriptor in default_descriptors() {
            registry.register(descriptor).await.unwrap();
        }
        registry
            .register(ModuleDescriptor::new("late", 5, ".*", "late"))
            .await
            .unwrap();

        let mut loader = StaticLoader::with_builtins("/nonexistent", "en");
        loader.register(hello_world::LOCATION, |mut config: ModuleConfig| {
            config.rsc = greeting_rsc();
            Ok(Box::new(HelloWorldModule::new(config)?))
        });
        let late_trace = trace.clone();
        loader.register("late", move |config| {
            Ok(Box::new(Scripted {
                name: config.name,
                behavior: Behavior::Continue,
                trace: late_trace.clone(),
                stop: false,
            }))
        });

        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sink = Arc::new(SlowSink {
            delay: Duration::from_millis(500),
        });
        let ctx = ModuleContext::new(db.clone(), db.clone(), sink);
        let router = Router::new(registry, Arc::new(loader), ctx)
            .with_module_timeout(Duration::from_millis(200));

        let at = |hour: u32| {
            let time = FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2024, 3, 1, hour, 0, 0)
                .unwrap();
            Interaction::new("u1", "hi", time)
        };

        for interaction in [at(8), at(9)] {
            let result = router.route(&interaction).await;
            assert_eq!(result.invoked(), vec!["history", "hello_world"]);
            assert_eq!(result.stopped_by(), Some("hello_world"));
            assert_eq!(result.failures().count(), 0);
        }
        assert!(trace.lock().unwrap().is_empty());

        let mood = db.get("u1").await.unwrap();
        assert_eq!((mood.joy, mood.sadness), (52, 48));
    }
}
