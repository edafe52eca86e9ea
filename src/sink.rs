//! Reply delivery.
//!
//! Modules reply through `ModuleContext::reply`, which hands the send to a detached
//! task. Neither the module nor the router waits on delivery, and a `SinkError`
//! is logged and dropped.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};

use crate::error::SinkError;

/// Transport that delivers a reply to a device.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Sink name for logs.
    fn name(&self) -> &str;

    /// Deliver `content` of kind `content_type` to `target_author_id`.
    async fn send(
        &self,
        content_type: &str,
        target_author_id: &str,
        content: &str,
    ) -> Result<(), SinkError>;
}

/// Writes replies to stdout, one per line.
pub struct StdoutSink {
    stdout: Mutex<tokio::io::Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn send(
        &self,
        content_type: &str,
        target_author_id: &str,
        content: &str,
    ) -> Result<(), SinkError> {
        let line = format!("[{content_type} → {target_author_id}] {content}\n");
        let mut stdout = self.stdout.lock().await;
        stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SinkError::SendFailed {
                sink: self.name().to_string(),
                reason: e.to_string(),
            })?;
        stdout.flush().await.map_err(|e| SinkError::SendFailed {
            sink: self.name().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Records replies in the log only. Useful when no device transport is attached.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl MessageSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn send(
        &self,
        content_type: &str,
        target_author_id: &str,
        content: &str,
    ) -> Result<(), SinkError> {
        tracing::info!(
            content_type,
            to = target_author_id,
            content,
            "Reply"
        );
        Ok(())
    }
}

/// One reply captured by `MemorySink`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub content_type: String,
    pub target: String,
    pub content: String,
}

/// Keeps every reply in memory, in delivery order.
#[derive(Debug, Default)]
pub struct MemorySink {
    deliveries: Mutex<Vec<Delivery>>,
    delivered: Notify,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().await.clone()
    }

    /// Wait until at least `count` replies have arrived, then return all of them.
    pub async fn wait_for(&self, count: usize) -> Vec<Delivery> {
        loop {
            // Registered before the check so a send in between is not missed.
            let delivered = self.delivered.notified();
            {
                let deliveries = self.deliveries.lock().await;
                if deliveries.len() >= count {
                    return deliveries.clone();
                }
            }
            delivered.await;
        }
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(
        &self,
        content_type: &str,
        target_author_id: &str,
        content: &str,
    ) -> Result<(), SinkError> {
        self.deliveries.lock().await.push(Delivery {
            content_type: content_type.to_string(),
            target: target_author_id.to_string(),
            content: content.to_string(),
        });
        self.delivered.notify_waiters();
        Ok(())
    }
}
