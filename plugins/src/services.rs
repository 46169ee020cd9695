//! Wires the concrete backends in this crate into the engine.
use async_trait::async_trait;
use autopilot_core::api::{AppConfig, EngineError, Services, ServicesFactory};

use crate::factory;

/// Config-driven [`ServicesFactory`] used by the `autopilot` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct PluginServicesFactory;

fn config_error(e: anyhow::Error) -> EngineError {
    EngineError::Config(format!("{e:#}"))
}

#[async_trait]
impl ServicesFactory for PluginServicesFactory {
    async fn build_services(&self, cfg: &AppConfig) -> Result<Services, EngineError> {
        let completion = factory::build_completion(cfg).await.map_err(config_error)?;
        let validator = factory::build_validator(cfg).map_err(config_error)?;
        let store = factory::build_store(cfg).map_err(config_error)?;
        Ok(Services {
            completion,
            validator,
            store,
            sandbox: factory::build_sandbox(cfg),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopilot_core::api::{CompletionProvider, StoreProvider};

    #[tokio::test]
    async fn missing_replay_file_is_a_config_error() {
        let mut cfg = AppConfig::default();
        cfg.completion.provider = CompletionProvider::Replay;
        cfg.completion.replay.path = "/nonexistent/autopilot/replay.jsonl".into();
        cfg.store.provider = StoreProvider::Memory;
        let err = PluginServicesFactory
            .build_services(&cfg)
            .await
            .err()
            .expect("replay file does not exist");
        assert!(matches!(err, EngineError::Config(_)));
    }
}
