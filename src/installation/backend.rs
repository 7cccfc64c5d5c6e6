//! Stage 6: backend database configuration and dependency install.

use anyhow::{Context, Result};
use log::{info, warn};
use serde_json::json;
use tokio::time::Duration;

use crate::config::InstallerConfig;
use crate::installation::run_cmd_with_timeout;

const PNPM_TIMEOUT: Duration = Duration::from_secs(1800);

pub async fn initialize(config: &InstallerConfig) -> Result<()> {
    info!("[PHASE: backend] Configuring backend");

    let default_config = config.app_dir.join("config/default.json");
    if default_config.exists() {
        tokio::fs::remove_file(&default_config)
            .await
            .with_context(|| format!("failed to remove {default_config:?}"))?;
    }

    write_production_config(config).await?;

    info!("[PHASE: backend] Installing backend dependencies");
    let app_str = config
        .app_dir
        .to_str()
        .context("app dir path is not valid UTF-8")?;
    let args = vec![
        "--dir".to_string(),
        app_str.to_string(),
        "install".to_string(),
    ];
    let out = run_cmd_with_timeout("pnpm", &args, PNPM_TIMEOUT, "pnpm_backend_install").await?;
    if !out.success() {
        anyhow::bail!(
            "pnpm install failed in {:?} (exit_code={:?}): {}",
            config.app_dir,
            out.exit_code,
            out.stderr.trim()
        );
    }

    Ok(())
}

/// Write the sqlite production config, but only when absent.
///
/// An existing file from a previous run is preserved verbatim — including any
/// settings a newer release would have changed. The skip is logged as a
/// warning so an operator can see that stale configuration survived.
pub async fn write_production_config(config: &InstallerConfig) -> Result<()> {
    let path = config.app_dir.join("config/production.json");
    if path.exists() {
        warn!(
            "[PHASE: backend] [STEP: config] {:?} already exists; keeping it (settings from a previous install carry over)",
            path
        );
        return Ok(());
    }

    let contents = json!({
        "database": {
            "engine": "knex-native",
            "knex": {
                "client": "sqlite3",
                "connection": {
                    "filename": config.database_file.to_string_lossy()
                },
                "useNullAsDefault": true
            }
        }
    });

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {parent:?}"))?;
    }
    tokio::fs::write(&path, serde_json::to_vec_pretty(&contents)?)
        .await
        .with_context(|| format!("failed to write {path:?}"))?;

    info!("[PHASE: backend] [STEP: config] Wrote {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn test_config(root: &Path) -> InstallerConfig {
        InstallerConfig {
            app_dir: root.join("app"),
            data_dir: root.join("data"),
            database_file: root.join("data/database.sqlite"),
            ..InstallerConfig::default()
        }
    }

    #[tokio::test]
    async fn production_config_written_when_absent() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        write_production_config(&config).await.unwrap();

        let path = config.app_dir.join("config/production.json");
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["database"]["knex"]["client"], "sqlite3");
        assert_eq!(
            parsed["database"]["knex"]["connection"]["filename"],
            config.database_file.to_string_lossy().as_ref()
        );
    }

    #[tokio::test]
    async fn existing_production_config_preserved_verbatim() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        let path = config.app_dir.join("config/production.json");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        let original = br#"{"database": {"engine": "mysql", "custom": true}}"#;
        tokio::fs::write(&path, original).await.unwrap();

        write_production_config(&config).await.unwrap();
        write_production_config(&config).await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), original);
    }
}
