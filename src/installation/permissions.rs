//! Stage 8: ownership directives and permission bits.
//!
//! Everything proxy-related runs as root here. That trades per-service
//! least-privilege for never hitting permission mismatches between the
//! proxy workers, the backend, and certbot renewal hooks.

use anyhow::Result;
use log::{info, warn};
use regex::Regex;

use crate::config::InstallerConfig;
use crate::utils::fsops::{replace_first_in_file, replace_in_file, set_permissions_recursive};

pub async fn adjust(config: &InstallerConfig) -> Result<()> {
    info!("[PHASE: permissions] Adjusting ownership directives and permission bits");

    // OpenResty's stock config runs workers as `nobody`; the generated host
    // configs read certificates under /data which `nobody` cannot. An active
    // directive is rewritten in place; only when none exists is the stock
    // commented-out one uncommented. Never both, or nginx sees a duplicate
    // `user` directive and refuses to start.
    if config.nginx_conf.exists() {
        let active_re = Regex::new(r"(?m)^\s*user\s+[^;]+;")?;
        let mut changed =
            replace_first_in_file(&config.nginx_conf, &active_re, "user root;").await?;
        if !changed {
            let commented_re = Regex::new(r"(?m)^\s*#\s*user\s+[^;]+;")?;
            changed =
                replace_first_in_file(&config.nginx_conf, &commented_re, "user root;").await?;
        }
        if changed {
            info!(
                "[PHASE: permissions] [STEP: nginx] user directive set to root in {:?}",
                config.nginx_conf
            );
        }
    } else {
        warn!(
            "[PHASE: permissions] [STEP: nginx] {:?} not found; skipping user directive",
            config.nginx_conf
        );
    }

    if config.logrotate_conf.exists() {
        let su_re = Regex::new(r"(?m)^\s*su\s+\S+\s+\S+")?;
        replace_first_in_file(&config.logrotate_conf, &su_re, "su root root").await?;
    }

    // Certbot venv created on a different python minor breaks after distro
    // upgrades; re-point its activation at whatever python3 resolves to now.
    let activate = config.certbot_dir.join("bin/activate");
    if activate.exists() {
        let venv_re = Regex::new(r#"(?m)^VIRTUAL_ENV=.*$"#)?;
        let replacement = format!(
            "VIRTUAL_ENV=\"{}\"",
            config.certbot_dir.to_string_lossy()
        );
        replace_in_file(&activate, &venv_re, &replacement).await?;
    }

    #[cfg(unix)]
    {
        for dir in [&config.app_dir, &config.data_dir] {
            if dir.exists() {
                set_permissions_recursive(dir, 0o755).await?;
            }
        }
        if config.cache_dir.exists() {
            set_permissions_recursive(&config.cache_dir, 0o777).await?;
        }
    }

    Ok(())
}
