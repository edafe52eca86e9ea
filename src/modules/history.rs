//! Catch-all logger: records every interaction in the History Store.

use async_trait::async_trait;

use crate::error::ModuleError;
use crate::interaction::Interaction;
use crate::modules::{Module, ModuleConfig, ModuleContext};

/// Loader key.
pub const LOCATION: &str = "history";

/// Appends the interaction and always lets later modules run.
#[derive(Debug, Default)]
pub struct HistoryModule;

impl HistoryModule {
    pub fn new(_config: ModuleConfig) -> Self {
        Self
    }
}

#[async_trait]
impl Module for HistoryModule {
    async fn process(
        &mut self,
        interaction: &Interaction,
        ctx: &ModuleContext,
    ) -> Result<(), ModuleError> {
        let id = ctx
            .history
            .append(
                interaction.author_id(),
                interaction.body(),
                interaction.recorded_at(),
            )
            .await?;
        tracing::debug!(id, author = interaction.author_id(), "Interaction logged");
        Ok(())
    }
}
