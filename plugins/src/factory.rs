use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use autopilot_core::api::{
    get_autopilot_data_dir, AllowAll, AppConfig, CompletionProvider, CompletionService,
    MemoryStore, ProcessSandbox, SafetyValidator, SandboxRunner, Store, StoreProvider,
};

use crate::completion::{HttpCompletionService, ReplayCompletionService};
use crate::safety::RuleSafetyValidator;
use crate::store::FileStore;

pub async fn build_completion(cfg: &AppConfig) -> Result<Arc<dyn CompletionService>> {
    match cfg.completion.provider {
        CompletionProvider::Http => Ok(Arc::new(HttpCompletionService::new(
            cfg.completion.http.clone(),
        )?)),
        CompletionProvider::Replay => {
            let path = cfg.completion.replay.path.trim();
            if path.is_empty() {
                return Err(anyhow!("completion.replay.path is required for the replay provider"));
            }
            let path = shellexpand::tilde(path).to_string();
            Ok(Arc::new(ReplayCompletionService::from_file(path).await?))
        }
    }
}

pub fn build_validator(cfg: &AppConfig) -> Result<Arc<dyn SafetyValidator>> {
    if !cfg.safety.enabled {
        tracing::warn!("safety screening disabled; generated code runs unchecked");
        return Ok(Arc::new(AllowAll));
    }
    Ok(Arc::new(RuleSafetyValidator::new(&cfg.safety)?))
}

pub fn build_store(cfg: &AppConfig) -> Result<Arc<dyn Store>> {
    match cfg.store.provider {
        StoreProvider::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreProvider::File => {
            let root = match cfg.store.path.as_deref().map(str::trim) {
                Some(p) if !p.is_empty() => PathBuf::from(shellexpand::tilde(p).to_string()),
                _ => get_autopilot_data_dir()?.join("store"),
            };
            tracing::debug!(root = %root.display(), "file store");
            Ok(Arc::new(FileStore::new(root)))
        }
    }
}

pub fn build_sandbox(cfg: &AppConfig) -> Arc<dyn SandboxRunner> {
    Arc::new(ProcessSandbox::from_config(&cfg.sandbox))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replay_provider_needs_a_path() {
        let mut cfg = AppConfig::default();
        cfg.completion.provider = CompletionProvider::Replay;
        assert!(build_completion(&cfg).await.is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.jsonl");
        std::fs::write(&path, "{\"text\": \"hi\"}\n").unwrap();
        cfg.completion.replay.path = path.to_string_lossy().to_string();
        assert_eq!(build_completion(&cfg).await.unwrap().name(), "replay");
    }

    #[test]
    fn validator_and_store_follow_config() {
        let mut cfg = AppConfig::default();
        assert_eq!(build_validator(&cfg).unwrap().name(), "rules");
        cfg.safety.enabled = false;
        assert_eq!(build_validator(&cfg).unwrap().name(), "allow_all");

        cfg.store.provider = StoreProvider::Memory;
        assert_eq!(build_store(&cfg).unwrap().name(), "memory");

        let dir = tempfile::tempdir().unwrap();
        cfg.store.provider = StoreProvider::File;
        cfg.store.path = Some(dir.path().to_string_lossy().to_string());
        assert_eq!(build_store(&cfg).unwrap().name(), "file");
    }
}
