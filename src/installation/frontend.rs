//! Stage 5: build the frontend bundle and install it under the app dir.

use anyhow::{Context, Result};
use log::info;
use tokio::time::Duration;

use crate::config::InstallerConfig;
use crate::installation::fetch::Release;
use crate::installation::{run_best_effort, run_cmd_with_timeout};
use crate::utils::fsops::copy_dir_recursive;

const PNPM_TIMEOUT: Duration = Duration::from_secs(1800);

pub async fn build(config: &InstallerConfig, release: &Release) -> Result<()> {
    let frontend_dir = release.extract_dir.join("frontend");
    if !frontend_dir.is_dir() {
        anyhow::bail!("release has no frontend directory at {frontend_dir:?}");
    }

    info!("[PHASE: frontend] Building frontend bundle (this takes a while)");

    pnpm(&frontend_dir, "install", true).await?;
    // Upgrade failures are survivable; the lockfile versions still build.
    pnpm(&frontend_dir, "upgrade", false).await?;
    pnpm(&frontend_dir, "build", true).await?;

    let dest = config.app_dir.join("frontend");
    tokio::fs::create_dir_all(&dest)
        .await
        .with_context(|| format!("failed to create {dest:?}"))?;
    copy_dir_recursive(&frontend_dir.join("dist"), &dest).await?;

    let images = frontend_dir.join("app-images");
    if images.is_dir() {
        copy_dir_recursive(&images, &dest.join("images")).await?;
    }

    info!("[PHASE: frontend] Frontend installed to {:?}", dest);
    Ok(())
}

async fn pnpm(dir: &std::path::Path, subcommand: &str, fatal: bool) -> Result<()> {
    let dir_str = dir
        .to_str()
        .context("frontend directory path is not valid UTF-8")?;
    let args = vec![
        "--dir".to_string(),
        dir_str.to_string(),
        subcommand.to_string(),
    ];

    if fatal {
        let out = run_cmd_with_timeout("pnpm", &args, PNPM_TIMEOUT, "pnpm").await?;
        if !out.success() {
            anyhow::bail!(
                "pnpm {} failed in {:?} (exit_code={:?}): {}",
                subcommand,
                dir,
                out.exit_code,
                out.stderr.trim()
            );
        }
    } else {
        let str_args: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        run_best_effort("pnpm", &str_args, PNPM_TIMEOUT, "pnpm").await?;
    }
    Ok(())
}
