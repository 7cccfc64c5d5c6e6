use log::{error, info};
use std::process::ExitCode;

mod config;
mod installation;
mod pipeline;
mod utils;

use config::InstallerConfig;
use utils::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let config = InstallerConfig::default();

    if let Err(e) = logging::initialize(&config.log_dir) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        "[PHASE: initialization] npm-native-installer v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    if !is_running_as_root() {
        error!("[PHASE: initialization] This installer must be run as root (try: sudo npm-native-installer)");
        return ExitCode::FAILURE;
    }

    match pipeline::run(&config).await {
        Ok(()) => {
            info!(
                "[PHASE: complete] Installation finished. Admin UI: http://<server-ip>:{} (default login: admin@example.com / changeme)",
                config.admin_port
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("[PHASE: failed] [STAGE: {}] {:#}", e.stage, e.source);
            if let Some(hint) = &e.hint {
                error!("[PHASE: failed] Hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "linux")]
fn is_running_as_root() -> bool {
    // geteuid cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(target_os = "linux"))]
fn is_running_as_root() -> bool {
    false
}
