//! Interaction sources and the dispatcher that feeds them to the router.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_stream::wrappers::LinesStream;

use crate::error::SourceError;
use crate::interaction::Interaction;
use crate::router::Router;

/// Stream of raw JSON payloads.
pub type PayloadStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Producer of raw interaction payloads.
#[async_trait]
pub trait InteractionSource: Send + Sync {
    fn name(&self) -> &str;

    /// Start producing payloads. The stream ends when the source is exhausted.
    async fn start(&self) -> Result<PayloadStream, SourceError>;
}

/// Reads one JSON payload per line from stdin. Blank lines are skipped.
#[derive(Debug, Default)]
pub struct StdinSource;

impl StdinSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InteractionSource for StdinSource {
    fn name(&self) -> &str {
        "stdin"
    }

    async fn start(&self) -> Result<PayloadStream, SourceError> {
        Ok(json_lines(tokio::io::stdin(), self.name().to_string()))
    }
}

/// Replays a file of JSON lines, e.g. a recorded session.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl InteractionSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn start(&self) -> Result<PayloadStream, SourceError> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| SourceError::StartupFailed {
                name: self.name().to_string(),
                reason: format!("{}: {e}", self.path.display()),
            })?;
        Ok(json_lines(file, self.name().to_string()))
    }
}

/// One trimmed payload per non-blank line. Ends at EOF or the first read error.
fn json_lines<R>(reader: R, source: String) -> PayloadStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let lines = LinesStream::new(BufReader::new(reader).lines());
    let stream = lines
        .take_while(move |line| {
            let keep = match line {
                Ok(_) => true,
                Err(e) => {
                    tracing::error!(source = %source, error = %e, "Error reading input");
                    false
                }
            };
            futures::future::ready(keep)
        })
        .filter_map(|line| {
            let line = line.ok().map(|l| l.trim().to_string());
            futures::future::ready(line.filter(|l| !l.is_empty()))
        });
    Box::pin(stream)
}

/// Counters for one `Dispatcher::run`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: usize,
    /// Payloads dropped because they did not parse.
    pub rejected: usize,
    pub dispatched: usize,
}

/// Parses payloads and runs one dispatch cycle per interaction, concurrently up to
/// a fixed number of cycles in flight.
pub struct Dispatcher {
    router: Arc<Router>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(router: Arc<Router>, max_concurrent_cycles: usize) -> Self {
        Self {
            router,
            permits: Arc::new(Semaphore::new(max_concurrent_cycles.max(1))),
        }
    }

    /// Drain `source`, then wait for every in-flight cycle.
    pub async fn run(&self, source: &dyn InteractionSource) -> Result<DispatchStats, SourceError> {
        let mut payloads = source.start().await?;
        tracing::info!(source = source.name(), "Interaction source started");

        let mut stats = DispatchStats::default();
        let mut cycles = JoinSet::new();

        while let Some(raw) = payloads.next().await {
            stats.received += 1;
            let interaction = match Interaction::parse(&raw) {
                Ok(interaction) => interaction,
                Err(e) => {
                    stats.rejected += 1;
                    tracing::warn!(source = source.name(), error = %e, "Dropping malformed payload");
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };
            let router = Arc::clone(&self.router);
            stats.dispatched += 1;
            cycles.spawn(async move {
                router.route(&interaction).await;
                drop(permit);
            });

            // Reap finished cycles so the set does not grow with the stream.
            while let Some(joined) = cycles.try_join_next() {
                log_join(joined);
            }
        }

        while let Some(joined) = cycles.join_next().await {
            log_join(joined);
        }

        tracing::info!(
            source = source.name(),
            received = stats.received,
            rejected = stats.rejected,
            dispatched = stats.dispatched,
            "Interaction source exhausted"
        );
        Ok(stats)
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Dispatch cycle aborted");
    }
}
