//! Installation stages and the shared external-command runner.
//!
//! Every external tool (`apt-get`, `systemctl`, `ss`, `openssl`, `pnpm`,
//! `journalctl`) runs through [`run_cmd_with_timeout`]: timeout + kill,
//! stdout/stderr capture, and a short retry for transient failures.

pub mod backend;
pub mod cleanup;
pub mod conflicts;
pub mod dependencies;
pub mod fetch;
pub mod frontend;
pub mod permissions;
pub mod service;
pub mod verify;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

fn is_transient_exec_error(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("temporarily")
        || msg.contains("temporary")
        || msg.contains("busy")
        || msg.contains("in use")
        || msg.contains("resource")
        || msg.contains("i/o")
        || msg.contains("io error")
        || msg.contains("connection")
        || msg.contains("network")
}

async fn run_cmd_with_timeout_once(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();

    debug!(
        "[PHASE: install] [STEP: cmd] spawn (operation={}, program={}, args=[{}], timeout_ms={})",
        operation,
        program,
        args.join(" "),
        timeout_dur.as_millis()
    );

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().with_context(|| {
        format!("Failed to spawn command '{program}' (operation={operation})")
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout (operation={operation})"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr (operation={operation})"))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout(timeout_dur, child.wait()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(anyhow::Error::new(e)).with_context(|| {
                format!("Command wait failed (operation={operation}, program={program})")
            });
        }
        Err(_) => {
            warn!(
                "[PHASE: install] [STEP: cmd] Timeout reached (operation={}, program={}, timeout_ms={}); killing process",
                operation,
                program,
                timeout_dur.as_millis()
            );

            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: install] [STEP: cmd] Failed to kill timed-out process (operation={}, program={}): {}",
                    operation, program, e
                );
            }

            // Best-effort reap to avoid zombies.
            let _ = timeout(Duration::from_secs(5), child.wait()).await;

            return Err(anyhow::anyhow!(
                "Command timed out after {}ms (operation={}, program={})",
                timeout_dur.as_millis(),
                operation,
                program
            ));
        }
    };

    let stdout_str = stdout_task
        .await
        .context("stdout join failed")?
        .context("stdout read failed")?;
    let stderr_str = stderr_task
        .await
        .context("stderr join failed")?
        .context("stderr read failed")?;

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    };

    debug!(
        "[PHASE: install] [STEP: cmd] done (operation={}, program={}, exit_code={:?}, duration_ms={})",
        operation, program, out.exit_code, out.duration_ms
    );

    Ok(out)
}

/// Run an external command with a timeout and up to 3 retries for transient
/// failures. Returns captured stdout/stderr even on non-zero exit; the caller
/// decides what counts as success.
pub async fn run_cmd_with_timeout(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();

    let program_owned = program.to_string();
    let args_owned = args.to_vec();
    let operation_owned = operation.to_string();

    let attempt = move || {
        let program = program_owned.clone();
        let args = args_owned.clone();
        let op = operation_owned.clone();
        async move { run_cmd_with_timeout_once(&program, &args, timeout_dur, &op).await }
    };

    let retry_strategy = ExponentialBackoff::from_millis(200)
        .factor(2)
        .max_delay(Duration::from_secs(2))
        .take(3)
        .map(jitter);

    let result = RetryIf::spawn(retry_strategy, attempt, |e: &anyhow::Error| {
        let transient = is_transient_exec_error(e);
        if transient {
            warn!(
                "[PHASE: install] [STEP: cmd] Transient command failure; will retry (operation={}, program={}, err={})",
                operation, program, e
            );
        }
        transient
    })
    .await;

    match &result {
        Ok(out) => {
            info!(
                "[PHASE: install] [STEP: cmd] {} (operation={}, exit_code={:?}, duration_ms={})",
                program,
                operation,
                out.exit_code,
                started.elapsed().as_millis()
            );
        }
        Err(e) => {
            error!(
                "[PHASE: install] [STEP: cmd] {} failed (operation={}, duration_ms={}, err={:?})",
                program,
                operation,
                started.elapsed().as_millis(),
                e
            );
        }
    }

    result
}

/// Convenience for stages where a non-zero exit is fatal.
pub async fn run_checked(
    program: &str,
    args: &[&str],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let out = run_cmd_with_timeout(program, &args, timeout_dur, operation).await?;
    if !out.success() {
        anyhow::bail!(
            "{} {} failed (operation={}, exit_code={:?}): {}",
            program,
            args.join(" "),
            operation,
            out.exit_code,
            out.stderr.trim()
        );
    }
    Ok(out)
}

/// Like [`run_checked`] but a non-zero exit only warns. Spawn failures still
/// propagate.
pub async fn run_best_effort(
    program: &str,
    args: &[&str],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let out = run_cmd_with_timeout(program, &args, timeout_dur, operation).await?;
    if !out.success() {
        warn!(
            "[PHASE: install] [STEP: cmd] {} {} exited non-zero (operation={}, exit_code={:?}): {}",
            program,
            args.join(" "),
            operation,
            out.exit_code,
            out.stderr.trim()
        );
    }
    Ok(out)
}
