//! Stage 4: resolve the latest release, download and extract it, and lay out
//! the runtime tree.
//!
//! This stage carries the one behavior that separates this installer from a
//! naive recipe: after copying the release's migrations into the app
//! directory it re-creates the fixed migrations symlink. If that link does
//! not resolve when the backend starts, the backend cannot find its schema
//! migrations, never binds the admin port, and the proxy serves Bad Gateway.

use anyhow::{Context, Result};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::time::Duration;

use crate::config::InstallerConfig;
use crate::installation::{run_best_effort, run_checked};
use crate::utils::fsops::{
    collect_files_recursive, copy_dir_recursive, force_symlink, replace_in_file,
    set_permissions_recursive,
};
use crate::utils::parsers::{parse_release_tag, parse_resolv_conf_nameservers};

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);
const OPENSSL_TIMEOUT: Duration = Duration::from_secs(60);
const PIP_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct Release {
    pub version: String,
    pub extract_dir: PathBuf,
}

pub async fn fetch_and_prepare(config: &InstallerConfig) -> Result<Release> {
    info!("[PHASE: fetch] Resolving latest release");

    // No whole-request timeout on the client: the tarball download is
    // arbitrarily long. The metadata request gets its own deadline below.
    let client = reqwest::Client::builder()
        .user_agent(concat!("npm-native-installer/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    let version = resolve_latest_version(&client, &config.github_repo).await?;
    info!("[PHASE: fetch] Latest release: v{}", version);

    let tarball = download_release(&client, config, &version).await?;
    let extract_dir = extract_tarball(config, &tarball, &version).await?;

    stamp_versions(&extract_dir, &version).await?;
    rewrite_conf_includes(&extract_dir, openresty_prefix(config)?).await?;

    create_runtime_tree(config).await?;
    write_resolvers_conf(config).await?;
    generate_dummy_certs(config).await?;

    deploy_app(config, &extract_dir).await?;
    deploy_migrations(config, &extract_dir).await?;

    install_certbot_plugin(config).await?;

    Ok(Release {
        version,
        extract_dir,
    })
}

async fn resolve_latest_version(client: &reqwest::Client, repo: &str) -> Result<String> {
    let url = format!("https://api.github.com/repos/{repo}/releases/latest");
    let body = client
        .get(&url)
        .timeout(HTTP_TIMEOUT)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("release metadata request failed: {url}"))?
        .text()
        .await
        .context("failed to read release metadata body")?;
    version_from_metadata(&body)
}

/// Fatal if the metadata yields no usable tag: nothing may be downloaded on
/// an unresolved version.
fn version_from_metadata(body: &str) -> Result<String> {
    parse_release_tag(body)
        .ok_or_else(|| anyhow::anyhow!("release metadata contained no usable tag_name"))
}

async fn download_release(
    client: &reqwest::Client,
    config: &InstallerConfig,
    version: &str,
) -> Result<PathBuf> {
    let url = format!(
        "https://github.com/{}/archive/refs/tags/v{}.tar.gz",
        config.github_repo, version
    );
    let dest = config.tarball_path(version);
    info!("[PHASE: fetch] [STEP: download] {} -> {:?}", url, dest);

    let resp = client
        .get(&url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("tarball download failed: {url}"))?;

    let bar = match resp.content_length() {
        Some(len) => {
            let bar = ProgressBar::new(len);
            bar.set_style(
                ProgressStyle::with_template(
                    "{bytes}/{total_bytes} [{bar:40}] {bytes_per_sec} eta {eta}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar
        }
        None => ProgressBar::new_spinner(),
    };

    let mut file = tokio::fs::File::create(&dest)
        .await
        .with_context(|| format!("failed to create {dest:?}"))?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("download stream failed")?;
        file.write_all(&chunk).await?;
        bar.inc(chunk.len() as u64);
    }
    file.flush().await?;
    bar.finish_and_clear();

    Ok(dest)
}

async fn extract_tarball(
    config: &InstallerConfig,
    tarball: &Path,
    version: &str,
) -> Result<PathBuf> {
    let dest = config.temp_dir.clone();
    info!(
        "[PHASE: fetch] [STEP: extract] {:?} -> {:?}",
        tarball, dest
    );

    let tarball = tarball.to_path_buf();
    let unpack_dest = dest.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&tarball)
            .with_context(|| format!("failed to open {tarball:?}"))?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        archive
            .unpack(&unpack_dest)
            .with_context(|| format!("failed to extract {tarball:?}"))?;
        Ok(())
    })
    .await
    .context("extract task panicked")??;

    let extract_dir = config.extract_dir(version);
    if !extract_dir.is_dir() {
        anyhow::bail!("extraction did not produce expected directory {extract_dir:?}");
    }
    Ok(extract_dir)
}

/// Stamp the placeholder version in both package manifests.
async fn stamp_versions(extract_dir: &Path, version: &str) -> Result<()> {
    let pattern = Regex::new(r#""version":\s*"0\.0\.0""#).context("bad version pattern")?;
    let replacement = format!(r#""version": "{version}""#);

    for manifest in ["backend/package.json", "frontend/package.json"] {
        let path = extract_dir.join(manifest);
        if path.exists() {
            replace_in_file(&path, &pattern, &replacement).await?;
        }
    }
    Ok(())
}

fn openresty_prefix(config: &InstallerConfig) -> Result<&Path> {
    // /usr/local/openresty/nginx/conf/nginx.conf -> /usr/local/openresty/nginx
    config
        .nginx_conf
        .parent()
        .and_then(|p| p.parent())
        .ok_or_else(|| anyhow::anyhow!("nginx_conf path too shallow: {:?}", config.nginx_conf))
}

/// The release's nginx snippets reference the stock `/etc/nginx` prefix;
/// rewrite every `.conf` under the extracted tree to the OpenResty prefix.
async fn rewrite_conf_includes(extract_dir: &Path, prefix: &Path) -> Result<()> {
    let pattern = Regex::new(r"/etc/nginx").context("bad include pattern")?;
    let replacement = prefix
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("openresty prefix is not valid UTF-8"))?;

    let mut rewritten = 0usize;
    for file in collect_files_recursive(extract_dir).await? {
        if file.extension().map(|e| e == "conf").unwrap_or(false)
            && replace_in_file(&file, &pattern, replacement).await?
        {
            rewritten += 1;
        }
    }
    info!(
        "[PHASE: fetch] [STEP: conf-rewrite] {} .conf files rewritten to {:?}",
        rewritten, prefix
    );
    Ok(())
}

async fn create_runtime_tree(config: &InstallerConfig) -> Result<()> {
    info!("[PHASE: fetch] [STEP: layout] Creating runtime directory tree");

    for sub in [
        "nginx/proxy_host",
        "nginx/redirection_host",
        "nginx/stream",
        "nginx/dead_host",
        "nginx/temp",
        "nginx/default_host",
        "nginx/default_www",
        "custom_ssl",
        "logs",
        "access",
    ] {
        let dir = config.data_dir.join(sub);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {dir:?}"))?;
    }

    let proxy_temp = config.cache_dir.join("proxy_temp");
    tokio::fs::create_dir_all(&proxy_temp)
        .await
        .with_context(|| format!("failed to create {proxy_temp:?}"))?;
    tokio::fs::create_dir_all(&config.run_dir)
        .await
        .with_context(|| format!("failed to create {:?}", config.run_dir))?;

    // World-writable on purpose: the proxy workers and the backend both write
    // here and run as different users on some setups.
    #[cfg(unix)]
    set_permissions_recursive(&config.cache_dir, 0o777).await?;

    Ok(())
}

/// `resolver` directive text for the web-server config.
///
/// Falls back to a public resolver when resolv.conf yields nothing, since an
/// nginx `resolver` directive with no addresses is a config error.
pub fn build_resolver_directive(nameservers: &[String]) -> String {
    if nameservers.is_empty() {
        return "resolver 8.8.8.8 valid=10s;\n".to_string();
    }
    format!("resolver {} valid=10s;\n", nameservers.join(" "))
}

async fn write_resolvers_conf(config: &InstallerConfig) -> Result<()> {
    let nameservers = match tokio::fs::read_to_string(&config.resolv_conf).await {
        Ok(contents) => parse_resolv_conf_nameservers(&contents),
        Err(e) => {
            warn!(
                "[PHASE: fetch] [STEP: resolvers] cannot read {:?} ({}); using fallback resolver",
                config.resolv_conf, e
            );
            Vec::new()
        }
    };

    let directive = build_resolver_directive(&nameservers);
    let dest = config.data_dir.join("nginx/resolvers.conf");
    tokio::fs::write(&dest, directive)
        .await
        .with_context(|| format!("failed to write {dest:?}"))?;
    info!("[PHASE: fetch] [STEP: resolvers] Wrote {:?}", dest);
    Ok(())
}

/// 10-year self-signed pair for hosts without a real certificate yet.
/// Existing certificates are never regenerated.
async fn generate_dummy_certs(config: &InstallerConfig) -> Result<()> {
    let cert = config.data_dir.join("nginx/dummycert.pem");
    let key = config.data_dir.join("nginx/dummykey.pem");
    if cert.exists() && key.exists() {
        info!("[PHASE: fetch] [STEP: certs] Dummy certificate pair already present");
        return Ok(());
    }

    info!("[PHASE: fetch] [STEP: certs] Generating self-signed certificate pair");
    let cert_str = cert.to_str().context("cert path is not valid UTF-8")?;
    let key_str = key.to_str().context("key path is not valid UTF-8")?;
    run_checked(
        "openssl",
        &[
            "req", "-new", "-newkey", "rsa:2048", "-days", "3650", "-nodes", "-x509",
            "-subj", "/O=Nginx Proxy Manager/OU=Dummy Certificate/CN=localhost",
            "-keyout", key_str, "-out", cert_str,
        ],
        OPENSSL_TIMEOUT,
        "openssl_dummy_cert",
    )
    .await?;
    Ok(())
}

async fn deploy_app(config: &InstallerConfig, extract_dir: &Path) -> Result<()> {
    info!(
        "[PHASE: fetch] [STEP: deploy] Copying backend into {:?}",
        config.app_dir
    );
    tokio::fs::create_dir_all(&config.app_dir)
        .await
        .with_context(|| format!("failed to create {:?}", config.app_dir))?;

    copy_dir_recursive(&extract_dir.join("backend"), &config.app_dir).await?;

    let global_src = extract_dir.join("global");
    if global_src.is_dir() {
        copy_dir_recursive(&global_src, &config.app_dir.join("global")).await?;
    }
    Ok(())
}

/// Copy the release's migrations into the app directory and point the fixed
/// migrations path at the copy.
///
/// Postcondition: `config.migrations_link` resolves to a directory holding a
/// non-empty set of files taken verbatim from `backend/migrations`.
pub async fn deploy_migrations(config: &InstallerConfig, extract_dir: &Path) -> Result<()> {
    let src = extract_dir.join("backend/migrations");
    if !src.is_dir() {
        anyhow::bail!("release has no backend/migrations directory at {src:?}");
    }

    let copied = copy_dir_recursive(&src, &config.migrations_dir).await?;
    if copied == 0 {
        anyhow::bail!("release migrations directory {src:?} is empty");
    }

    force_symlink(&config.migrations_dir, &config.migrations_link).await?;

    // The backend consults this exact path at startup; verify it resolves
    // now instead of letting the verifier discover a dead backend later.
    let resolved = tokio::fs::canonicalize(&config.migrations_link)
        .await
        .with_context(|| format!("migrations link {:?} does not resolve", config.migrations_link))?;
    if !resolved.is_dir() {
        anyhow::bail!("migrations link resolves to a non-directory: {resolved:?}");
    }

    info!(
        "[PHASE: fetch] [STEP: migrations] {} migration files deployed; {:?} -> {:?}",
        copied, config.migrations_link, config.migrations_dir
    );
    Ok(())
}

async fn install_certbot_plugin(config: &InstallerConfig) -> Result<()> {
    let pip = config.certbot_dir.join("bin/pip");
    if !pip.exists() {
        warn!("[PHASE: fetch] [STEP: certbot-plugin] certbot venv missing; skipping DNS plugin");
        return Ok(());
    }
    let pip_str = pip.to_str().context("pip path is not valid UTF-8")?;
    run_best_effort(
        pip_str,
        &["install", "--no-cache-dir", "certbot-dns-cloudflare"],
        PIP_TIMEOUT,
        "certbot_plugin_install",
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(root: &Path) -> InstallerConfig {
        InstallerConfig {
            app_dir: root.join("app"),
            data_dir: root.join("data"),
            migrations_dir: root.join("app/migrations"),
            migrations_link: root.join("migrations"),
            temp_dir: root.join("tmp"),
            cache_dir: root.join("cache"),
            run_dir: root.join("run"),
            resolv_conf: root.join("resolv.conf"),
            ..InstallerConfig::default()
        }
    }

    async fn fake_release(root: &Path) -> PathBuf {
        let extract = root.join("tmp/nginx-proxy-manager-2.11.3");
        let migrations = extract.join("backend/migrations");
        tokio::fs::create_dir_all(&migrations).await.unwrap();
        tokio::fs::write(migrations.join("001_initial.js"), b"exports.up = ...")
            .await
            .unwrap();
        tokio::fs::write(migrations.join("002_hosts.js"), b"exports.up = ...")
            .await
            .unwrap();
        extract
    }

    #[tokio::test]
    async fn empty_release_tag_is_fatal() {
        // Property: an unresolvable tag halts the stage before any download.
        assert!(version_from_metadata(r#"{"tag_name": ""}"#).is_err());
        assert!(version_from_metadata(r#"{}"#).is_err());
        assert_eq!(
            version_from_metadata(r#"{"tag_name": "v2.11.3"}"#).unwrap(),
            "2.11.3"
        );
    }

    #[tokio::test]
    async fn deploy_migrations_creates_resolving_symlink() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        let extract = fake_release(tmp.path()).await;
        tokio::fs::create_dir_all(&config.app_dir).await.unwrap();

        deploy_migrations(&config, &extract).await.unwrap();

        let meta = tokio::fs::symlink_metadata(&config.migrations_link)
            .await
            .unwrap();
        assert!(meta.file_type().is_symlink());
        let resolved = tokio::fs::canonicalize(&config.migrations_link)
            .await
            .unwrap();
        assert!(resolved.is_dir());
        assert!(config.migrations_link.join("001_initial.js").exists());
        assert!(config.migrations_link.join("002_hosts.js").exists());
        assert_eq!(
            tokio::fs::read(config.migrations_link.join("001_initial.js"))
                .await
                .unwrap(),
            tokio::fs::read(extract.join("backend/migrations/001_initial.js"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn deploy_migrations_replaces_stale_real_directory() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        let extract = fake_release(tmp.path()).await;

        // A previous non-symlink install left a real directory at the fixed
        // path; it must be replaced by the link.
        tokio::fs::create_dir_all(&config.migrations_link).await.unwrap();
        tokio::fs::write(config.migrations_link.join("stale.js"), b"old")
            .await
            .unwrap();

        deploy_migrations(&config, &extract).await.unwrap();

        let meta = tokio::fs::symlink_metadata(&config.migrations_link)
            .await
            .unwrap();
        assert!(meta.file_type().is_symlink());
        assert!(!config.migrations_link.join("stale.js").exists());
        assert!(config.migrations_link.join("001_initial.js").exists());
    }

    #[tokio::test]
    async fn deploy_migrations_rejects_empty_release() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());
        let extract = tmp.path().join("tmp/nginx-proxy-manager-9.9.9");
        tokio::fs::create_dir_all(extract.join("backend/migrations"))
            .await
            .unwrap();

        let err = deploy_migrations(&config, &extract).await.unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[tokio::test]
    async fn stamp_versions_rewrites_placeholder() {
        let tmp = TempDir::new().unwrap();
        let extract = tmp.path().join("release");
        tokio::fs::create_dir_all(extract.join("backend")).await.unwrap();
        tokio::fs::write(
            extract.join("backend/package.json"),
            br#"{"name": "npm-backend", "version": "0.0.0"}"#,
        )
        .await
        .unwrap();

        stamp_versions(&extract, "2.11.3").await.unwrap();

        let contents = tokio::fs::read_to_string(extract.join("backend/package.json"))
            .await
            .unwrap();
        assert!(contents.contains(r#""version": "2.11.3""#));
    }

    #[tokio::test]
    async fn rewrite_conf_includes_touches_only_conf_files() {
        let tmp = TempDir::new().unwrap();
        let extract = tmp.path().join("release");
        tokio::fs::create_dir_all(extract.join("docker/rootfs")).await.unwrap();
        tokio::fs::write(
            extract.join("docker/rootfs/ip_ranges.conf"),
            b"include /etc/nginx/conf.d/*.conf;\n",
        )
        .await
        .unwrap();
        tokio::fs::write(extract.join("docker/rootfs/readme.md"), b"/etc/nginx stays\n")
            .await
            .unwrap();

        rewrite_conf_includes(&extract, Path::new("/usr/local/openresty/nginx"))
            .await
            .unwrap();

        let conf = tokio::fs::read_to_string(extract.join("docker/rootfs/ip_ranges.conf"))
            .await
            .unwrap();
        assert_eq!(
            conf,
            "include /usr/local/openresty/nginx/conf.d/*.conf;\n"
        );
        let md = tokio::fs::read_to_string(extract.join("docker/rootfs/readme.md"))
            .await
            .unwrap();
        assert!(md.contains("/etc/nginx"));
    }

    #[test]
    fn build_resolver_directive_joins_nameservers() {
        let ns = vec!["192.168.1.1".to_string(), "8.8.8.8".to_string()];
        assert_eq!(
            build_resolver_directive(&ns),
            "resolver 192.168.1.1 8.8.8.8 valid=10s;\n"
        );
        assert_eq!(
            build_resolver_directive(&[]),
            "resolver 8.8.8.8 valid=10s;\n"
        );
    }

    #[tokio::test]
    async fn runtime_tree_is_created_with_writable_cache() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(tmp.path());

        create_runtime_tree(&config).await.unwrap();

        assert!(config.data_dir.join("nginx/proxy_host").is_dir());
        assert!(config.data_dir.join("custom_ssl").is_dir());
        assert!(config.cache_dir.join("proxy_temp").is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = tokio::fs::metadata(&config.cache_dir)
                .await
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o777);
        }
    }
}
