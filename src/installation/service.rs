//! Stages 7 and 9: the backend's systemd unit, and service startup.

use anyhow::{Context, Result};
use log::info;
use std::path::Path;
use tokio::time::{sleep, Duration};

use crate::config::InstallerConfig;
use crate::installation::conflicts::is_active;
use crate::installation::run_checked;

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the backend service unit text.
///
/// Pure function so the rendered unit is testable. Paths are quoted when they
/// contain spaces (systemd supports quoted arguments).
pub fn build_unit_text(working_dir: &Path, node_bin: &str) -> String {
    let work_quoted = quote_unit_path(&working_dir.to_string_lossy());

    format!(
        r#"[Unit]
Description=Nginx Proxy Manager
After=network.target

[Service]
Type=simple
Environment=NODE_ENV=production
WorkingDirectory={work_quoted}
ExecStart={node_bin} index.js
Restart=always
RestartSec=10

[Install]
WantedBy=multi-user.target
"#
    )
}

fn quote_unit_path(path: &str) -> String {
    if path.contains(' ') || path.contains('\t') || path.contains('"') {
        format!("\"{}\"", path.replace('"', "\\\""))
    } else {
        path.to_string()
    }
}

/// Stage 7: write the unit file and make systemd pick it up.
pub async fn write_unit(config: &InstallerConfig) -> Result<()> {
    let unit = build_unit_text(&config.app_dir, "/usr/bin/node");

    if let Some(parent) = config.unit_file.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {parent:?}"))?;
    }
    tokio::fs::write(&config.unit_file, unit)
        .await
        .with_context(|| format!("failed to write {:?}", config.unit_file))?;
    info!(
        "[PHASE: service-unit] Wrote systemd unit {:?}",
        config.unit_file
    );

    run_checked(
        "systemctl",
        &["daemon-reload", "--no-pager"],
        SYSTEMCTL_TIMEOUT,
        "daemon_reload",
    )
    .await?;
    Ok(())
}

/// Stage 9: enable and start both services, then re-check after fixed sleeps.
///
/// Single fixed-delay poll per service, no backoff: services that come up
/// slower than the sleeps are reported as failures.
pub async fn enable_and_start(config: &InstallerConfig) -> Result<()> {
    info!(
        "[PHASE: start-services] Enabling and starting {}",
        config.webserver_service
    );
    run_checked(
        "systemctl",
        &["enable", "--now", &config.webserver_service, "--no-pager"],
        SYSTEMCTL_TIMEOUT,
        "enable_webserver",
    )
    .await
    .with_context(|| {
        format!(
            "failed to start {}; check: journalctl -u {}",
            config.webserver_service, config.webserver_service
        )
    })?;

    sleep(Duration::from_secs(2)).await;

    info!(
        "[PHASE: start-services] Enabling and starting {}",
        config.backend_service
    );
    run_checked(
        "systemctl",
        &["enable", "--now", &config.backend_service, "--no-pager"],
        SYSTEMCTL_TIMEOUT,
        "enable_backend",
    )
    .await
    .with_context(|| {
        format!(
            "failed to start {}; check: journalctl -u {}",
            config.backend_service, config.backend_service
        )
    })?;

    sleep(Duration::from_secs(5)).await;

    for svc in [&config.webserver_service, &config.backend_service] {
        if !is_active(svc).await? {
            anyhow::bail!("service '{svc}' is not active after start; check: journalctl -u {svc}");
        }
        info!("[PHASE: start-services] {} is active", svc);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn unit_text_basic() {
        let unit = build_unit_text(&PathBuf::from("/app"), "/usr/bin/node");

        assert!(unit.contains("[Unit]"));
        assert!(unit.contains("Description=Nginx Proxy Manager"));
        assert!(unit.contains("After=network.target"));
        assert!(unit.contains("WorkingDirectory=/app"));
        assert!(unit.contains("ExecStart=/usr/bin/node index.js"));
        assert!(unit.contains("Environment=NODE_ENV=production"));
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("RestartSec=10"));
        assert!(unit.contains("WantedBy=multi-user.target"));
    }

    #[test]
    fn unit_text_quotes_paths_with_spaces() {
        let unit = build_unit_text(&PathBuf::from("/opt/proxy manager"), "/usr/bin/node");
        assert!(unit.contains("WorkingDirectory=\"/opt/proxy manager\""));
    }

    #[test]
    fn unit_text_has_required_sections_in_order() {
        let unit = build_unit_text(&PathBuf::from("/app"), "/usr/bin/node");
        let sections: Vec<&str> = unit
            .lines()
            .filter(|l| l.starts_with('[') && l.ends_with(']'))
            .collect();
        assert_eq!(sections, vec!["[Unit]", "[Service]", "[Install]"]);
    }
}
