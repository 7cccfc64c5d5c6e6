//! Stage 11: post-install health checks.

use anyhow::Result;
use log::{info, warn};
use tokio::time::Duration;

use crate::config::InstallerConfig;
use crate::installation::conflicts::is_active;
use crate::installation::run_cmd_with_timeout;
use crate::utils::parsers::{listener_on_port, parse_ss_listeners, scan_journal_for_errors};

const CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const JOURNAL_LINES: &str = "50";
const REPORTED_ERROR_LINES: usize = 10;

pub async fn post_install(config: &InstallerConfig) -> Result<()> {
    info!("[PHASE: verify] Running post-install checks");

    let web_active = is_active(&config.webserver_service).await?;
    let backend_active = is_active(&config.backend_service).await?;

    scan_backend_journal(config).await;

    let out = run_cmd_with_timeout(
        "ss",
        &["-tlnp".to_string()],
        CHECK_TIMEOUT,
        "ss_admin_port",
    )
    .await?;
    let admin_bound = listener_on_port(&parse_ss_listeners(&out.stdout), config.admin_port).is_some();

    health_gate(
        web_active,
        backend_active,
        admin_bound,
        &config.webserver_service,
        &config.backend_service,
        config.admin_port,
    )?;

    info!(
        "[PHASE: verify] All checks passed ({} active, {} active, port {} bound)",
        config.webserver_service, config.backend_service, config.admin_port
    );
    Ok(())
}

/// The health gate: every condition must hold or the run is a failure.
fn health_gate(
    web_active: bool,
    backend_active: bool,
    admin_bound: bool,
    webserver: &str,
    backend: &str,
    admin_port: u16,
) -> Result<()> {
    if !web_active {
        anyhow::bail!("service '{webserver}' is not active; check: journalctl -u {webserver}");
    }
    if !backend_active {
        anyhow::bail!("service '{backend}' is not active; check: journalctl -u {backend}");
    }
    if !admin_bound {
        anyhow::bail!(
            "no listening socket on admin port {admin_port}; the backend likely failed during startup (check: journalctl -u {backend} -n 50)"
        );
    }
    Ok(())
}

/// Scan the recent backend journal for lines containing `error`. Matches are
/// warnings only: the substring match cannot tell real failures from
/// incidental log text.
async fn scan_backend_journal(config: &InstallerConfig) {
    let args = vec![
        "-u".to_string(),
        config.backend_service.clone(),
        "-n".to_string(),
        JOURNAL_LINES.to_string(),
        "--no-pager".to_string(),
    ];
    let out = match run_cmd_with_timeout("journalctl", &args, CHECK_TIMEOUT, "journal_scan").await {
        Ok(out) => out,
        Err(e) => {
            warn!("[PHASE: verify] [STEP: journal] journalctl failed: {}", e);
            return;
        }
    };

    let matches = scan_journal_for_errors(&out.stdout, REPORTED_ERROR_LINES);
    if matches.is_empty() {
        return;
    }
    warn!(
        "[PHASE: verify] [STEP: journal] recent {} log lines contain 'error' (may be harmless):",
        config.backend_service
    );
    for line in matches {
        warn!("[PHASE: verify] [STEP: journal]   {}", line);
    }
}
