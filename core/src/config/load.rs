use std::path::{Path, PathBuf};

use super::types::AppConfig;

/// Get the default autopilot data directory: ~/.autopilot
pub fn get_autopilot_data_dir() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".autopilot"))
}

pub fn load_from_path(path: &Path) -> anyhow::Result<AppConfig> {
    let s = std::fs::read_to_string(path)?;
    let cfg = toml::from_str::<AppConfig>(&s)?;
    Ok(cfg)
}

pub fn load_default() -> anyhow::Result<AppConfig> {
    // Priority 1: ~/.autopilot/config.toml
    let data_dir = get_autopilot_data_dir()?;
    let user_config = data_dir.join("config.toml");

    // Priority 2: ./config.toml
    let local_config = Path::new("config.toml");

    let mut cfg = if user_config.exists() {
        load_from_path(&user_config)?
    } else if local_config.exists() {
        load_from_path(local_config)?
    } else {
        AppConfig::default()
    };

    if is_blank(cfg.logging.directory.as_deref()) {
        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)?;
        cfg.logging.directory = Some(logs_dir.to_string_lossy().to_string());
    }
    if is_blank(cfg.store.path.as_deref()) {
        cfg.store.path = Some(data_dir.join("store").to_string_lossy().to_string());
    }
    if is_blank(cfg.sandbox.workspace_root.as_deref()) {
        cfg.sandbox.workspace_root =
            Some(data_dir.join("workspaces").to_string_lossy().to_string());
    }

    apply_env_overrides(&mut cfg, |k| std::env::var(k).ok());
    Ok(cfg)
}

/// Environment overrides (highest priority). `lookup` is injectable for tests.
pub fn apply_env_overrides<F>(cfg: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("AUTOPILOT_TIMEOUT").and_then(|v| v.trim().parse().ok()) {
        cfg.sandbox.timeout_secs = v;
    }
    if let Some(v) = get("AUTOPILOT_MAX_RETRIES").and_then(|v| v.trim().parse().ok()) {
        cfg.healing.max_retries = v;
    }
    if let Some(v) = get("AUTOPILOT_MAX_CONTINUATIONS").and_then(|v| v.trim().parse().ok()) {
        cfg.continuation.max_attempts = v;
    }
    if let Some(v) = get("AUTOPILOT_WINDOW_SIZE").and_then(|v| v.trim().parse().ok()) {
        cfg.memory.window_size = v;
    }
    if let Some(v) = get("AUTOPILOT_COMPRESSION_RATIO").and_then(|v| v.trim().parse().ok()) {
        cfg.memory.compression_ratio = v;
    }
    if let Some(v) = get("AUTOPILOT_BASE_URL") {
        cfg.completion.http.base_url = v;
    }
    if let Some(v) = get("AUTOPILOT_API_KEY") {
        cfg.completion.http.api_key = v;
    }
    if let Some(v) = get("AUTOPILOT_MODEL") {
        cfg.completion.http.model = v;
    }
}

fn is_blank(v: Option<&str>) -> bool {
    v.map(|s| s.trim().is_empty()).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FailurePolicy, StoreProvider};
    use std::collections::HashMap;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [sandbox]
            timeout_secs = 5

            [task]
            failure_policy = "fail_fast"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.sandbox.timeout_secs, 5);
        assert_eq!(cfg.sandbox.capture_bytes, 10_000);
        assert_eq!(cfg.task.failure_policy, FailurePolicy::FailFast);
        assert_eq!(cfg.healing.max_retries, 3);
        assert_eq!(cfg.continuation.max_attempts, 5);
        assert_eq!(cfg.store.provider, StoreProvider::File);
    }

    #[test]
    fn env_overrides_win_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("AUTOPILOT_TIMEOUT", "12"),
            ("AUTOPILOT_MAX_RETRIES", "not-a-number"),
            ("AUTOPILOT_MODEL", "local-model"),
            ("AUTOPILOT_API_KEY", "   "),
        ]
        .into_iter()
        .collect();

        let mut cfg = AppConfig::default();
        apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.sandbox.timeout_secs, 12);
        assert_eq!(cfg.healing.max_retries, 3);
        assert_eq!(cfg.completion.http.model, "local-model");
        assert!(cfg.completion.http.api_key.is_empty());
    }

    #[test]
    fn target_budget_follows_ratio() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.memory.target_budget(), 1_200);
    }
}
