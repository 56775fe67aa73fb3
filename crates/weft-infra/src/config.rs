//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.weft/` by default) and
//! deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use weft_types::config::EngineConfig;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparseable file: logs a warning and returns the default.
/// - Zero `event_capacity` or `foreach_concurrency` is raised to 1.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => normalize(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

fn normalize(mut config: EngineConfig) -> EngineConfig {
    // broadcast::channel panics on zero capacity
    config.event_capacity = config.event_capacity.max(1);
    config.foreach_concurrency = config.foreach_concurrency.max(1);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use weft_types::config::PersistencePolicy;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
persistence = "best_effort"
foreach_concurrency = 8

[retry]
attempts = 3
delay_ms = 100
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.persistence, PersistencePolicy::BestEffort);
        assert_eq!(config.foreach_concurrency, 8);
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.retry.delay_ms, 100);
        assert_eq!(config.event_capacity, 1024);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_raises_zero_sizes() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            "event_capacity = 0\nforeach_concurrency = 0\n",
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.event_capacity, 1);
        assert_eq!(config.foreach_concurrency, 1);
    }
}
