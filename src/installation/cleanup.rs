//! Stage 3: remove a previous installation (database backed up first), and
//! stage 10: throw away extracted sources.

use anyhow::Result;
use log::{debug, info};

use crate::config::InstallerConfig;
use crate::utils::fsops::{backup_with_timestamp, remove_path_any, remove_path_best_effort};

/// Remove the artifacts of a previous install: the app directory, the
/// service unit, and the migrations path (symlink or stale real directory).
///
/// The data directory is deliberately preserved so proxy hosts, certificates
/// and the database survive reinstalls; the database is additionally backed
/// up with a timestamp suffix before anything is deleted.
pub async fn clean_previous_install(config: &InstallerConfig) -> Result<()> {
    let present = config.app_dir.exists() || config.data_dir.exists() || config.unit_file.exists();
    if !present {
        info!("[PHASE: cleanup] No previous installation found");
        return Ok(());
    }

    info!("[PHASE: cleanup] Previous installation detected; cleaning up");

    // Best-effort backup: a missing database (fresh data dir) is fine, but a
    // database we can see MUST be copied and verified before we touch anything.
    if config.database_file.exists() {
        let backup = backup_with_timestamp(&config.database_file).await?;
        info!(
            "[PHASE: cleanup] [STEP: backup] Database backed up to {:?}",
            backup
        );
    } else {
        debug!("[PHASE: cleanup] [STEP: backup] No database file; skipping backup");
    }

    remove_path_any(&config.app_dir).await?;
    remove_path_any(&config.unit_file).await?;
    // May be a symlink from a previous run of this installer, or a real
    // directory left by a different install method; both forms go.
    remove_path_any(&config.migrations_link).await?;

    info!("[PHASE: cleanup] Previous installation removed (data dir preserved)");
    Ok(())
}

/// Remove every extracted source tree and downloaded tarball under the temp
/// directory. Failures are ignored; leftover temp files are harmless.
pub async fn clean_temp(config: &InstallerConfig) -> Result<()> {
    info!("[PHASE: temp-clean] Removing extracted sources");

    let mut rd = match tokio::fs::read_dir(&config.temp_dir).await {
        Ok(rd) => rd,
        Err(e) => {
            debug!(
                "[PHASE: temp-clean] temp dir unreadable ({:?}): {}",
                config.temp_dir, e
            );
            return Ok(());
        }
    };

    while let Some(ent) = rd.next_entry().await? {
        let name = ent.file_name();
        if name.to_string_lossy().starts_with("nginx-proxy-manager-") {
            remove_path_best_effort(&ent.path()).await;
        }
    }
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
            migrations_dir: root.join("app/migrations"),
            migrations_link: root.join("migrations"),
            unit_file: root.join("etc/systemd/system/npm.service"),
            temp_dir: root.join("tmp"),
            ..InstallerConfig::default()
        }
    }

    #[tokio::test]
    async fn clean_is_idempotent_on_clean_tree() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        clean_previous_install(&config).await.unwrap();
        clean_previous_install(&config).await.unwrap();
        assert!(!config.app_dir.exists());
    }

    #[tokio::test]
    async fn clean_backs_up_database_before_deleting() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        tokio::fs::create_dir_all(&config.app_dir).await.unwrap();
        tokio::fs::create_dir_all(&config.data_dir).await.unwrap();
        tokio::fs::write(&config.database_file, b"precious rows")
            .await
            .unwrap();

        clean_previous_install(&config).await.unwrap();

        assert!(!config.app_dir.exists());
        // Data dir and database survive; a timestamped, byte-identical backup
        // sits next to the database.
        assert!(config.database_file.exists());
        let mut backups = Vec::new();
        let mut rd = tokio::fs::read_dir(&config.data_dir).await.unwrap();
        while let Some(ent) = rd.next_entry().await.unwrap() {
            let name = ent.file_name().to_string_lossy().to_string();
            if name.starts_with("database.sqlite.bak-") {
                backups.push(ent.path());
            }
        }
        assert_eq!(backups.len(), 1);
        assert_eq!(
            tokio::fs::read(&backups[0]).await.unwrap(),
            b"precious rows"
        );
    }

    #[tokio::test]
    async fn clean_removes_migrations_symlink_and_real_dir_forms() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        // Symlink form.
        tokio::fs::create_dir_all(&config.app_dir).await.unwrap();
        tokio::fs::create_dir_all(&config.migrations_dir).await.unwrap();
        tokio::fs::symlink(&config.migrations_dir, &config.migrations_link)
            .await
            .unwrap();
        clean_previous_install(&config).await.unwrap();
        assert!(!config.migrations_link.exists());

        // Real-directory form left by another install method.
        tokio::fs::create_dir_all(&config.app_dir).await.unwrap();
        tokio::fs::create_dir_all(&config.migrations_link).await.unwrap();
        tokio::fs::write(config.migrations_link.join("stale.js"), b"x")
            .await
            .unwrap();
        clean_previous_install(&config).await.unwrap();
        assert!(!config.migrations_link.exists());
    }

    #[tokio::test]
    async fn clean_temp_only_touches_release_trees() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        tokio::fs::create_dir_all(&config.temp_dir).await.unwrap();

        let release = config.temp_dir.join("nginx-proxy-manager-2.11.3");
        tokio::fs::create_dir_all(release.join("backend")).await.unwrap();
        let tarball = config.temp_dir.join("nginx-proxy-manager-2.11.3.tar.gz");
        tokio::fs::write(&tarball, b"gz").await.unwrap();
        let unrelated = config.temp_dir.join("unrelated.txt");
        tokio::fs::write(&unrelated, b"keep me").await.unwrap();

        clean_temp(&config).await.unwrap();

        assert!(!release.exists());
        assert!(!tarball.exists());
        assert!(unrelated.exists());
    }
}
