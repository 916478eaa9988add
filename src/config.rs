//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

/// Subdirectory created under a volume when it becomes the active root.
pub const ROOT_DIR_NAME: &str = "hazivault";
/// Reserved directory under the active root that holds in-flight uploads.
pub const STAGING_DIR_NAME: &str = ".hazi-staging";
pub const AUTH_COOKIE_NAME: &str = "HAZI_SESSION";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_FILES: u64 = 256;
pub const DEFAULT_STAGING_TTL_SECS: u64 = 24 * 60 * 60;
pub const SESSION_PRUNE_INTERVAL_SECS: u64 = 300;
pub const STAGING_CLEAN_INTERVAL_SECS: u64 = 900;
/// Mount points offered as storage candidates, matched as prefixes.
pub const VOLUME_MOUNT_PREFIXES: &[&str] = &["/mnt", "/media"];

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "hazivault", version = VERSION_INFO, about = "HaziVault NAS server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "HAZI_STORAGE_DIR",
        default_value = ".hazi/storage",
        help = "Default storage root used until another volume is selected"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "HAZI_CONFIG_FILE",
        default_value = ".hazi/config.json",
        help = "File recording the active storage root"
    )]
    pub config_file: String,
    #[arg(
        long,
        env = "HAZI_CREDENTIALS_FILE",
        default_value = ".hazi/credentials.json",
        help = "File holding the registered account"
    )]
    pub credentials_file: String,
    #[arg(
        short = 'b',
        long,
        env = "HAZI_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "HAZI_HTTP_PORT",
        default_value_t = 3000,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "HAZI_HTTPS_PORT",
        default_value_t = 3443,
        help = "HTTPS port (only used when a certificate is configured)"
    )]
    pub https_port: u16,
    #[arg(short = 'c', long, env = "HAZI_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "HAZI_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "HAZI_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "HAZI_TRUST_PROXY",
        help = "Take the client IP from X-Forwarded-For (only behind a trusted reverse proxy)"
    )]
    pub trust_proxy: bool,
    #[arg(
        long,
        env = "HAZI_LOG",
        default_value = "info",
        help = "Default log filter when RUST_LOG is unset"
    )]
    pub log_level: String,
    #[arg(
        long,
        env = "HAZI_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Session expiration in seconds"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "HAZI_LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Max login attempts before lockout (0 to disable)"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "HAZI_LOGIN_WINDOW_SECS",
        default_value_t = DEFAULT_LOGIN_WINDOW_SECS,
        help = "Login attempt window in seconds"
    )]
    pub login_window_secs: u64,
    #[arg(
        long,
        env = "HAZI_LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        help = "Login lockout time after max attempts"
    )]
    pub login_lockout_secs: u64,
    #[arg(
        long,
        env = "HAZI_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max bytes per upload request (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "HAZI_UPLOAD_MAX_FILES",
        default_value_t = DEFAULT_UPLOAD_MAX_FILES,
        help = "Max files per upload request (0 to disable)"
    )]
    pub upload_max_files: u64,
    #[arg(
        long,
        env = "HAZI_STAGING_TTL_SECS",
        default_value_t = DEFAULT_STAGING_TTL_SECS,
        help = "Age after which abandoned staged uploads are removed (0 to disable)"
    )]
    pub staging_ttl_secs: u64,
}
