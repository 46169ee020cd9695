use std::sync::Arc;

use crate::completion::CompletionService;
use crate::config::AppConfig;
use crate::error::EngineError;
use crate::events::{start_event_sink, EventJournal, EventSink};
use crate::orchestrator::Orchestrator;
use crate::safety::SafetyValidator;
use crate::sandbox::SandboxRunner;
use crate::store::Store;

/// The four collaborators an [`Orchestrator`] is wired with.
#[derive(Clone)]
pub struct Services {
    pub completion: Arc<dyn CompletionService>,
    pub validator: Arc<dyn SafetyValidator>,
    pub store: Arc<dyn Store>,
    pub sandbox: Arc<dyn SandboxRunner>,
}

/// Builds [`Services`] from configuration. Lives outside core so concrete backends
/// (HTTP completion, file store, rule validator) stay in the plugins crate.
#[async_trait::async_trait]
pub trait ServicesFactory: Send + Sync {
    async fn build_services(&self, cfg: &AppConfig) -> Result<Services, EngineError>;
}

/// Process-wide wiring: configuration, the optional JSONL progress sink and the
/// factory that turns config into services.
#[derive(Clone)]
pub struct AppContext {
    cfg: AppConfig,
    sink: Option<EventSink>,
    factory: Arc<dyn ServicesFactory>,
}

impl AppContext {
    pub async fn new(
        cfg: AppConfig,
        factory: Arc<dyn ServicesFactory>,
    ) -> Result<Self, EngineError> {
        let sink = start_event_sink(&cfg.events_out)
            .await
            .map_err(EngineError::Config)?;
        Ok(Self { cfg, sink, factory })
    }

    pub fn cfg(&self) -> &AppConfig {
        &self.cfg
    }

    pub fn journal(&self) -> EventJournal {
        EventJournal::new(self.cfg.events_out.channel_capacity, self.sink.clone())
    }

    pub async fn orchestrator(&self) -> Result<Orchestrator, EngineError> {
        let services = self.factory.build_services(&self.cfg).await?;
        tracing::debug!(
            completion = services.completion.name(),
            store = services.store.name(),
            "services ready"
        );
        Ok(Orchestrator::new(self.cfg.clone(), services, self.journal()))
    }
}
