//! Stage 1: OS packages, Node.js, pnpm, certbot, and OpenResty.

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::time::Duration;

use crate::config::InstallerConfig;
use crate::installation::{run_checked, run_cmd_with_timeout};
use crate::utils::parsers::{parse_node_major, parse_os_release_codename, parse_os_release_field};

const APT_TIMEOUT: Duration = Duration::from_secs(600);
const QUICK_TIMEOUT: Duration = Duration::from_secs(30);

/// Base packages checked one by one, paired with the binary that proves the
/// package is present (`None` for library-style packages that ship no tool,
/// which fall back to `dpkg -s`). A failed install of an individual package
/// is a warning, not fatal; the guarded steps below (Node, pnpm, certbot,
/// OpenResty) fail the run.
const BASE_PACKAGES: &[(&str, Option<&str>)] = &[
    ("ca-certificates", None),
    ("curl", Some("curl")),
    ("gnupg2", Some("gpg")),
    ("openssl", Some("openssl")),
    ("sqlite3", Some("sqlite3")),
    ("logrotate", Some("logrotate")),
    ("apache2-utils", Some("htpasswd")),
    ("python3", Some("python3")),
    ("python3-venv", None),
    ("python3-pip", Some("pip3")),
    ("git", Some("git")),
];

pub async fn install(config: &InstallerConfig) -> Result<()> {
    info!("[PHASE: dependencies] Installing system dependencies");

    run_checked("apt-get", &["update", "-qq"], APT_TIMEOUT, "apt_update").await?;

    for (pkg, bin) in BASE_PACKAGES {
        if package_installed(pkg, *bin).await {
            info!("[PHASE: dependencies] [STEP: apt] {} already installed", pkg);
            continue;
        }
        let args = vec![
            "install".to_string(),
            "-y".to_string(),
            "-qq".to_string(),
            pkg.to_string(),
        ];
        let out = run_cmd_with_timeout("apt-get", &args, APT_TIMEOUT, "apt_install").await?;
        if !out.success() {
            // Mirrors the original recipe: a failed package install mid-list
            // is reported but does not abort the run.
            warn!(
                "[PHASE: dependencies] [STEP: apt] install of '{}' failed (exit_code={:?}); continuing",
                pkg, out.exit_code
            );
        }
    }

    ensure_node(config).await?;
    ensure_pnpm(config).await?;
    ensure_certbot(config).await?;
    ensure_openresty().await?;

    info!("[PHASE: dependencies] All dependencies present");
    Ok(())
}

async fn package_installed(pkg: &str, bin: Option<&str>) -> bool {
    // Tool packages are probed by their binary on PATH; library packages
    // have nothing to look up, so ask dpkg. `dpkg -s` exits non-zero for
    // packages that are not installed.
    if let Some(bin) = bin {
        return which::which(bin).is_ok();
    }
    match run_cmd_with_timeout(
        "dpkg",
        &["-s".to_string(), pkg.to_string()],
        QUICK_TIMEOUT,
        "dpkg_status",
    )
    .await
    {
        Ok(out) => out.success(),
        Err(_) => false,
    }
}

/// Node.js at the required major version, installed via NodeSource if absent
/// or the wrong major.
async fn ensure_node(config: &InstallerConfig) -> Result<()> {
    if which::which("node").is_ok() {
        let out = run_checked("node", &["--version"], QUICK_TIMEOUT, "node_version").await?;
        if parse_node_major(&out.stdout) == Some(config.node_major) {
            info!(
                "[PHASE: dependencies] [STEP: node] Node.js {} present ({})",
                config.node_major,
                out.stdout.trim()
            );
            return Ok(());
        }
        warn!(
            "[PHASE: dependencies] [STEP: node] Node.js present but wrong major ({}); installing {}",
            out.stdout.trim(),
            config.node_major
        );
    }

    info!(
        "[PHASE: dependencies] [STEP: node] Installing Node.js {} from NodeSource",
        config.node_major
    );
    let setup = format!(
        "curl -fsSL https://deb.nodesource.com/setup_{}.x | bash -",
        config.node_major
    );
    run_checked("bash", &["-c", &setup], APT_TIMEOUT, "nodesource_setup").await?;
    run_checked(
        "apt-get",
        &["install", "-y", "-qq", "nodejs"],
        APT_TIMEOUT,
        "apt_install_nodejs",
    )
    .await?;
    Ok(())
}

async fn ensure_pnpm(config: &InstallerConfig) -> Result<()> {
    if which::which("pnpm").is_ok() {
        info!("[PHASE: dependencies] [STEP: pnpm] pnpm already installed");
        return Ok(());
    }
    info!(
        "[PHASE: dependencies] [STEP: pnpm] Installing pnpm@{}",
        config.pnpm_version
    );
    let package = format!("pnpm@{}", config.pnpm_version);
    run_checked(
        "npm",
        &["install", "-g", &package],
        APT_TIMEOUT,
        "npm_install_pnpm",
    )
    .await?;
    Ok(())
}

/// Certbot in its own virtualenv so pip packages never collide with distro
/// python.
async fn ensure_certbot(config: &InstallerConfig) -> Result<()> {
    let certbot_bin = config.certbot_dir.join("bin/certbot");
    if certbot_bin.exists() {
        info!("[PHASE: dependencies] [STEP: certbot] certbot venv already present");
        return Ok(());
    }

    info!(
        "[PHASE: dependencies] [STEP: certbot] Creating certbot venv at {:?}",
        config.certbot_dir
    );
    let venv_path = config
        .certbot_dir
        .to_str()
        .context("certbot dir is not valid UTF-8")?
        .to_string();
    run_checked(
        "python3",
        &["-m", "venv", &venv_path],
        APT_TIMEOUT,
        "certbot_venv",
    )
    .await?;

    let pip = config.certbot_dir.join("bin/pip");
    let pip_str = pip.to_str().context("pip path is not valid UTF-8")?;
    run_checked(
        pip_str,
        &["install", "--no-cache-dir", "--upgrade", "pip", "certbot"],
        APT_TIMEOUT,
        "certbot_pip_install",
    )
    .await?;
    Ok(())
}

/// OpenResty from its vendor apt repository: signing key into the keyring
/// directory, a sources.list entry for the running distro codename, then the
/// package itself.
async fn ensure_openresty() -> Result<()> {
    if which::which("openresty").is_ok() {
        info!("[PHASE: dependencies] [STEP: openresty] openresty already installed");
        return Ok(());
    }

    info!("[PHASE: dependencies] [STEP: openresty] Adding OpenResty apt repository");

    let key_cmd = "curl -fsSL https://openresty.org/package/pubkey.gpg \
                   | gpg --dearmor -o /usr/share/keyrings/openresty.gpg --yes";
    run_checked("bash", &["-c", key_cmd], APT_TIMEOUT, "openresty_key").await?;

    let os_release = tokio::fs::read_to_string("/etc/os-release")
        .await
        .context("failed to read /etc/os-release")?;
    let source_line = openresty_source_line(&os_release)?;
    tokio::fs::write("/etc/apt/sources.list.d/openresty.list", source_line)
        .await
        .context("failed to write openresty apt source")?;

    run_checked("apt-get", &["update", "-qq"], APT_TIMEOUT, "apt_update_openresty").await?;
    run_checked(
        "apt-get",
        &["install", "-y", "-qq", "openresty"],
        APT_TIMEOUT,
        "apt_install_openresty",
    )
    .await?;
    Ok(())
}

/// Build the OpenResty sources.list entry for the running distro.
///
/// The vendor publishes separate `ubuntu` and `debian` channels; pointing a
/// Debian codename at the ubuntu channel makes `apt-get update` fail with a
/// missing Release file. Derivatives are routed via ID_LIKE.
fn openresty_source_line(os_release: &str) -> Result<String> {
    let codename = parse_os_release_codename(os_release)
        .context("could not determine distribution codename from /etc/os-release")?;

    let id = parse_os_release_field(os_release, "ID").unwrap_or_default();
    let id_like = parse_os_release_field(os_release, "ID_LIKE").unwrap_or_default();
    let matches_distro =
        |distro: &str| id == distro || id_like.split_whitespace().any(|l| l == distro);

    let channel = if matches_distro("ubuntu") {
        "ubuntu"
    } else if matches_distro("debian") {
        "debian"
    } else {
        anyhow::bail!(
            "unsupported distribution '{id}' (ID_LIKE='{id_like}'); \
             OpenResty ships apt packages for Ubuntu and Debian only"
        );
    };

    Ok(format!(
        "deb [signed-by=/usr/share/keyrings/openresty.gpg] http://openresty.org/package/{channel} {codename} main\n"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openresty_source_line_ubuntu() {
        let os_release = "NAME=\"Ubuntu\"\nID=ubuntu\nVERSION_CODENAME=jammy\n";
        let line = openresty_source_line(os_release).unwrap();
        assert!(line.contains("openresty.org/package/ubuntu jammy main"));
    }

    #[test]
    fn openresty_source_line_debian() {
        let os_release =
            "PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nID=debian\nVERSION_CODENAME=bookworm\n";
        let line = openresty_source_line(os_release).unwrap();
        assert!(line.contains("openresty.org/package/debian bookworm main"));
        assert!(!line.contains("/package/ubuntu"));
    }

    #[test]
    fn openresty_source_line_derivative_uses_id_like() {
        let os_release = "ID=linuxmint\nID_LIKE=\"ubuntu debian\"\nVERSION_CODENAME=virginia\n";
        let line = openresty_source_line(os_release).unwrap();
        assert!(line.contains("openresty.org/package/ubuntu virginia main"));
    }

    #[test]
    fn openresty_source_line_rejects_unknown_distro() {
        let os_release = "ID=fedora\nVERSION_CODENAME=rawhide\n";
        assert!(openresty_source_line(os_release).is_err());
        // Missing codename is also fatal before any apt source is written.
        assert!(openresty_source_line("ID=debian\n").is_err());
    }

    #[tokio::test]
    async fn package_installed_prefers_binary_probe() {
        // `sh` is on PATH everywhere; no dpkg database needed.
        assert!(package_installed("anything", Some("sh")).await);
        assert!(!package_installed("anything", Some("no-such-binary-here")).await);
    }
}
