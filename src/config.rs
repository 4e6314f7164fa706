//! CLI arguments and server configuration defaults.

use clap::{Parser, ValueEnum};
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

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_ASSET_DIR: &str = "IMG";
pub const DEFAULT_CREDENTIAL_FILE: &str = "totp.key";
pub const DEFAULT_NOT_FOUND_PAGE: &str = "404.html";
pub const DEFAULT_TOTP_ISSUER: &str = "picbin";
pub const DEFAULT_TOTP_ACCOUNT: &str = "user";
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 0;
pub const UPLOAD_MEMORY_THRESHOLD: usize = 10 * 1024 * 1024;
pub const SETUP_PATH: &str = "/setup-totp";
pub const FILE_FIELD_NAMES: [&str; 2] = ["imageFile", "file"];
pub const CODE_FIELD_NAME: &str = "totp";
/// Upper bound for the TOTP form field; longer values are rejected unread.
pub const MAX_CODE_FIELD_LEN: usize = 64;
pub const ASSET_CACHE_CONTROL: &str = "public, max-age=31536000";

/// Extensions accepted for upload and served back, lower-cased with the leading dot.
pub const DEFAULT_ALLOWED_EXTENSIONS: [&str; 22] = [
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".tiff", ".tif", ".bmp", ".ico", ".svg", ".heic",
    ".heif", ".jfif", ".pjpeg", ".pjpg", ".avif", ".svgz", ".cur", ".xbm", ".psd", ".ai", ".eps",
];

/// How an uploaded file is named on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum NamingScheme {
    /// Hex MD5 digest of the content plus the original extension.
    ContentHash,
    /// Milliseconds since the Unix epoch plus the original extension.
    Timestamp,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "picbin", version = VERSION_INFO, about = "Minimal image hosting server")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "PICBIN_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "PICBIN_PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        short = 'd',
        long,
        env = "PICBIN_ASSET_DIR",
        default_value = DEFAULT_ASSET_DIR,
        help = "Directory holding uploaded images"
    )]
    pub asset_dir: String,
    #[arg(
        long,
        env = "PICBIN_CREDENTIAL_FILE",
        default_value = DEFAULT_CREDENTIAL_FILE,
        help = "File storing the shared TOTP secret"
    )]
    pub credential_file: String,
    #[arg(
        long,
        env = "PICBIN_NOT_FOUND_PAGE",
        default_value = DEFAULT_NOT_FOUND_PAGE,
        help = "Document served with 404 responses, if present"
    )]
    pub not_found_page: String,
    #[arg(
        short = 'n',
        long,
        env = "PICBIN_NAMING",
        value_enum,
        default_value_t = NamingScheme::ContentHash,
        help = "Naming scheme for stored uploads"
    )]
    pub naming: NamingScheme,
    #[arg(
        long,
        env = "PICBIN_DISABLE_TOTP",
        help = "Accept uploads without a one-time code"
    )]
    pub disable_totp: bool,
    #[arg(
        long,
        env = "PICBIN_DISABLE_UPLOAD_PAGE",
        help = "Serve the not-found document instead of the upload form on GET /"
    )]
    pub disable_upload_page: bool,
    #[arg(
        long,
        env = "PICBIN_ALLOWED_EXTENSIONS",
        help = "Comma separated extension allow-list (replaces the default list)"
    )]
    pub allowed_extensions: Option<String>,
    #[arg(
        long,
        env = "PICBIN_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max request body size in bytes for uploads (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "PICBIN_UPLOAD_MEMORY_THRESHOLD",
        default_value_t = UPLOAD_MEMORY_THRESHOLD,
        help = "Bytes buffered in memory before an upload spills to a temp file"
    )]
    pub upload_memory_threshold: usize,
    #[arg(
        long,
        env = "PICBIN_TOTP_ISSUER",
        default_value = DEFAULT_TOTP_ISSUER,
        help = "Issuer shown by authenticator apps"
    )]
    pub totp_issuer: String,
    #[arg(
        long,
        env = "PICBIN_TOTP_ACCOUNT",
        default_value = DEFAULT_TOTP_ACCOUNT,
        help = "Account name shown by authenticator apps"
    )]
    pub totp_account: String,
    #[arg(long, env = "PICBIN_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
}
