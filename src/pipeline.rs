//! The linear provisioning pipeline.
//!
//! Eleven ordered stages; any stage error aborts the whole run with the stage
//! name and a remediation hint. There is no rollback: a failed run leaves
//! whatever it got to, and the next run's cleaner stage purges it.

use anyhow::Result;
use log::info;
use std::time::Instant;
use thiserror::Error;

use crate::config::InstallerConfig;
use crate::installation::{
    backend, cleanup, conflicts, dependencies, fetch, frontend, permissions, service, verify,
};

/// A fatal stage failure. Warnings never surface here; stages log them and
/// keep going.
#[derive(Debug, Error)]
#[error("stage '{stage}' failed")]
pub struct StageError {
    pub stage: &'static str,
    pub hint: Option<String>,
    #[source]
    pub source: anyhow::Error,
}

trait StageResultExt<T> {
    fn stage(self, stage: &'static str, hint: Option<&str>) -> Result<T, StageError>;
}

impl<T> StageResultExt<T> for Result<T> {
    fn stage(self, stage: &'static str, hint: Option<&str>) -> Result<T, StageError> {
        self.map_err(|source| StageError {
            stage,
            hint: hint.map(|h| h.to_string()),
            source,
        })
    }
}

pub async fn run(config: &InstallerConfig) -> Result<(), StageError> {
    let started = Instant::now();

    info!("[PHASE: pipeline] Starting installation pipeline (11 stages)");

    dependencies::install(config)
        .await
        .stage("dependencies", Some("check network access and apt sources"))?;

    conflicts::check_and_stop(config)
        .await
        .stage("conflicts", None)?;

    cleanup::clean_previous_install(config)
        .await
        .stage("cleanup", None)?;

    let release = fetch::fetch_and_prepare(config)
        .await
        .stage("fetch", Some("check connectivity to api.github.com and github.com"))?;
    info!(
        "[PHASE: pipeline] Release v{} fetched and prepared",
        release.version
    );

    frontend::build(config, &release)
        .await
        .stage("frontend", Some("inspect pnpm output above for the failing package"))?;

    backend::initialize(config)
        .await
        .stage("backend", Some("inspect pnpm output above for the failing package"))?;

    service::write_unit(config)
        .await
        .stage("service-unit", None)?;

    permissions::adjust(config)
        .await
        .stage("permissions", None)?;

    service::enable_and_start(config).await.stage(
        "start-services",
        Some("check logs: journalctl -u openresty / journalctl -u npm"),
    )?;

    cleanup::clean_temp(config).await.stage("temp-clean", None)?;

    verify::post_install(config).await.stage(
        "verify",
        Some("check logs: journalctl -u npm -n 50"),
    )?;

    info!(
        "[PHASE: pipeline] Pipeline complete (duration_ms={})",
        started.elapsed().as_millis()
    );
    Ok(())
}
