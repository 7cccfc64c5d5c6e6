//! Installer configuration.
//!
//! Every absolute path and port the pipeline touches lives here so that stages
//! can be pointed at a scratch tree in tests. Production runs use `Default`.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct InstallerConfig {
    /// Application directory the backend runs from (`/app`).
    pub app_dir: PathBuf,
    /// Persistent data directory; survives reinstalls (`/data`).
    pub data_dir: PathBuf,
    /// SQLite database the backend creates on first run.
    pub database_file: PathBuf,
    /// Real migrations directory inside the app dir.
    pub migrations_dir: PathBuf,
    /// Fixed absolute path the backend resolves migrations from; must be a
    /// symlink to `migrations_dir` or the backend fails at startup.
    pub migrations_link: PathBuf,
    /// systemd unit file for the backend service.
    pub unit_file: PathBuf,
    /// Backend service name.
    pub backend_service: String,
    /// Web-server service name.
    pub webserver_service: String,
    /// OpenResty main config.
    pub nginx_conf: PathBuf,
    /// Logrotate config for proxy logs.
    pub logrotate_conf: PathBuf,
    /// Certbot virtualenv root (adjusted only if present).
    pub certbot_dir: PathBuf,
    /// Source for synthesizing the nginx `resolver` directive.
    pub resolv_conf: PathBuf,
    /// Nginx cache/temp directories (world-writable on purpose).
    pub cache_dir: PathBuf,
    pub run_dir: PathBuf,
    /// Where tarballs are downloaded and extracted.
    pub temp_dir: PathBuf,
    /// Installer log directory.
    pub log_dir: PathBuf,

    pub http_port: u16,
    pub https_port: u16,
    pub admin_port: u16,

    /// GitHub `owner/repo` the release is fetched from.
    pub github_repo: String,
    /// Required Node.js major version.
    pub node_major: u32,
    /// Pinned pnpm version.
    pub pnpm_version: String,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            app_dir: PathBuf::from("/app"),
            data_dir: PathBuf::from("/data"),
            database_file: PathBuf::from("/data/database.sqlite"),
            migrations_dir: PathBuf::from("/app/migrations"),
            migrations_link: PathBuf::from("/migrations"),
            unit_file: PathBuf::from("/etc/systemd/system/npm.service"),
            backend_service: "npm".to_string(),
            webserver_service: "openresty".to_string(),
            nginx_conf: PathBuf::from("/usr/local/openresty/nginx/conf/nginx.conf"),
            logrotate_conf: PathBuf::from("/etc/logrotate.d/nginx-proxy-manager"),
            certbot_dir: PathBuf::from("/opt/certbot"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            cache_dir: PathBuf::from("/var/cache/nginx"),
            run_dir: PathBuf::from("/run/nginx"),
            temp_dir: PathBuf::from("/tmp"),
            log_dir: PathBuf::from("/var/log/npm-native-installer"),
            http_port: 80,
            https_port: 443,
            admin_port: 81,
            github_repo: "NginxProxyManager/nginx-proxy-manager".to_string(),
            node_major: 18,
            pnpm_version: "8".to_string(),
        }
    }
}

impl InstallerConfig {
    /// Directory the release tarball extracts to for a given version.
    pub fn extract_dir(&self, version: &str) -> PathBuf {
        self.temp_dir.join(format!("nginx-proxy-manager-{version}"))
    }

    /// Downloaded tarball path for a given version.
    pub fn tarball_path(&self, version: &str) -> PathBuf {
        self.temp_dir.join(format!("nginx-proxy-manager-{version}.tar.gz"))
    }
}
