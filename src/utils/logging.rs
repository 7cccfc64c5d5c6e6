//! Logging setup: human-readable stdout plus a timestamped file per run.

use anyhow::{Context, Result};
use std::path::Path;

/// Initialize the global logger.
///
/// Console output is what the operator watches during a run; the file copy
/// (debug level) is what `journalctl`-style post-mortems pull from. If the log
/// directory cannot be created (e.g. unit tests, non-root dry runs) we fall
/// back to console-only rather than failing the run.
pub fn initialize(log_dir: &Path) -> Result<()> {
    let stdout_dispatch = fern::Dispatch::new()
        .level(log::LevelFilter::Info)
        .format(|out, message, record| {
            let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            out.finish(format_args!("[{}] [{}] {}", ts, record.level(), message))
        })
        .chain(std::io::stdout());

    let mut dispatch = fern::Dispatch::new().chain(stdout_dispatch);

    if std::fs::create_dir_all(log_dir).is_ok() {
        let ts = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let log_file = log_dir.join(format!("install-{ts}.log"));
        let file_dispatch = fern::Dispatch::new()
            .level(log::LevelFilter::Debug)
            .format(|out, message, record| {
                let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                out.finish(format_args!(
                    "[{}] [{}] [{}] {}",
                    ts,
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .chain(fern::log_file(&log_file).context("failed to open log file")?);
        dispatch = dispatch.chain(file_dispatch);
    }

    dispatch.apply().context("logger already initialized")?;
    Ok(())
}
