//! Stage 2: detect and stop services that would fight over our ports.

use anyhow::Result;
use log::{info, warn};
use tokio::time::Duration;

use crate::config::InstallerConfig;
use crate::installation::{run_best_effort, run_cmd_with_timeout};
use crate::utils::parsers::{listener_on_port, parse_ss_listeners};

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn check_and_stop(config: &InstallerConfig) -> Result<()> {
    info!("[PHASE: conflicts] Checking for conflicting services");

    // Stock nginx conflicts with OpenResty permanently: stop AND disable so it
    // does not come back on reboot.
    if is_active("nginx").await? {
        warn!("[PHASE: conflicts] nginx is active; stopping and disabling it");
        run_best_effort(
            "systemctl",
            &["stop", "nginx", "--no-pager"],
            SYSTEMCTL_TIMEOUT,
            "stop_nginx",
        )
        .await?;
        run_best_effort(
            "systemctl",
            &["disable", "nginx", "--no-pager"],
            SYSTEMCTL_TIMEOUT,
            "disable_nginx",
        )
        .await?;
    }

    // Other web servers only get stopped for this run.
    for svc in ["apache2", "caddy"] {
        if is_active(svc).await? {
            warn!("[PHASE: conflicts] {} is active; stopping it", svc);
            run_best_effort(
                "systemctl",
                &["stop", svc, "--no-pager"],
                SYSTEMCTL_TIMEOUT,
                "stop_conflicting_service",
            )
            .await?;
        }
    }

    // Anything else squatting on our ports is only worth a warning; the
    // service starter will fail loudly if the bind actually collides.
    let out = run_cmd_with_timeout(
        "ss",
        &["-tlnp".to_string()],
        SYSTEMCTL_TIMEOUT,
        "ss_listeners",
    )
    .await?;
    let listeners = parse_ss_listeners(&out.stdout);
    for port in [config.http_port, config.admin_port, config.https_port] {
        if let Some(l) = listener_on_port(&listeners, port) {
            warn!(
                "[PHASE: conflicts] Port {} is already in use (process={})",
                port,
                l.process.as_deref().unwrap_or("unknown")
            );
        }
    }

    Ok(())
}

/// `systemctl is-active` truth test. A failed invocation counts as inactive.
pub async fn is_active(service: &str) -> Result<bool> {
    let args = vec![
        "is-active".to_string(),
        "--no-pager".to_string(),
        service.to_string(),
    ];
    match run_cmd_with_timeout("systemctl", &args, SYSTEMCTL_TIMEOUT, "systemctl_is_active").await {
        Ok(out) => Ok(out.stdout.trim().eq_ignore_ascii_case("active")),
        Err(_) => Ok(false),
    }
}
