use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{info, warn};

/// Overrides the per-user data directory (tests, portable installs).
pub const DATA_DIR_ENV: &str = "ICOCHAT_DATA_DIR";
pub const APP_DIR_NAME: &str = "IcoChat";
pub const SERVER_CONFIG_FILE: &str = "server_config.json";

/// `server_config.json` is expected to be tiny.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;

pub const DEFAULT_SERVER_IP: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 12345;

/// How an upload is framed after the `ARCHIVO:` announcement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadFraming {
    /// 10-digit size header, then exactly that many bytes.
    #[default]
    SizeHeader,
    /// Raw bytes; the server decides where the file ends.
    Unsized,
}

/// How a download reply (or an inbound file) is delimited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadFraming {
    /// Use the 10-digit header when the first bytes parse as one, else read to end of stream.
    #[default]
    Auto,
    LengthPrefixed,
    UntilEof,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub server_ip: String,
    pub server_port: u16,
    #[serde(default)]
    pub upload_framing: UploadFraming,
    #[serde(default)]
    pub download_framing: DownloadFraming,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_ip: DEFAULT_SERVER_IP.to_owned(),
            server_port: DEFAULT_SERVER_PORT,
            upload_framing: UploadFraming::default(),
            download_framing: DownloadFraming::default(),
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        if self.server_ip.contains(':') && !self.server_ip.starts_with('[') {
            format!("[{}]:{}", self.server_ip, self.server_port)
        } else {
            format!("{}:{}", self.server_ip, self.server_port)
        }
    }
}

#[derive(Debug, Error)]
pub enum JsonLoadError {
    #[error("metadata read failed: {0}")]
    Metadata(#[source] io::Error),
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("parse failed: {0}")]
    Parse(#[source] serde_json::Error),
}

impl JsonLoadError {
    pub fn is_missing(&self) -> bool {
        matches!(self, JsonLoadError::Metadata(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

#[derive(Debug, Error)]
pub enum JsonSaveError {
    #[error("serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("tmp write failed: {0}")]
    WriteTmp(#[source] io::Error),
    #[error("rename failed: {0}")]
    Rename(#[source] io::Error),
}

/// Resolves (and creates) the directory holding every persisted file.
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os(DATA_DIR_ENV) {
        let dir = PathBuf::from(override_dir);
        let _ = fs::create_dir_all(&dir);
        return dir;
    }

    let base = std::env::var_os("LOCALAPPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let dir = base.join(APP_DIR_NAME);
    let _ = fs::create_dir_all(&dir);
    dir
}

pub fn load_json_from_path<T: DeserializeOwned>(
    path: &Path,
    max_bytes: u64,
) -> Result<T, JsonLoadError> {
    let meta = fs::metadata(path).map_err(JsonLoadError::Metadata)?;
    if meta.len() > max_bytes {
        return Err(JsonLoadError::TooLarge {
            size: meta.len(),
            max: max_bytes,
        });
    }

    let data = fs::read_to_string(path).map_err(JsonLoadError::Read)?;
    serde_json::from_str(&data).map_err(JsonLoadError::Parse)
}

/// Writes through a sibling tmp file so a crash never leaves a half-written document.
pub fn save_json_to_path<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), JsonSaveError> {
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(value).map_err(JsonSaveError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(JsonSaveError::WriteTmp)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp, path).map_err(JsonSaveError::Rename)?;
    Ok(())
}

pub fn save_json_with_retry<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), JsonSaveError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt = 1;
    loop {
        match save_json_to_path(path, value) {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    attempt,
                    error = %err,
                    "save failed, retrying"
                );
                let delay = BACKOFF_BASE_MS.saturating_mul(2_u64.saturating_pow(attempt - 1));
                std::thread::sleep(Duration::from_millis(delay));
                attempt += 1;
            }
        }
    }
}

pub fn server_config_path(dir: &Path) -> PathBuf {
    dir.join(SERVER_CONFIG_FILE)
}

/// Loads `server_config.json`, writing the defaults when the file does not exist yet.
pub fn load_server_config(dir: &Path) -> ServerConfig {
    let path = server_config_path(dir);
    match load_json_from_path::<ServerConfig>(&path, MAX_CONFIG_BYTES) {
        Ok(config) => config,
        Err(err) if err.is_missing() => {
            let config = ServerConfig::default();
            match save_json_with_retry(&path, &config) {
                Ok(()) => info!(path = %path.display(), "wrote default server config"),
                Err(err) => warn!(path = %path.display(), error = %err, "default server config not saved"),
            }
            config
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "server config unreadable, using defaults");
            ServerConfig::default()
        }
    }
}

pub fn save_server_config(dir: &Path, config: &ServerConfig) -> Result<(), JsonSaveError> {
    save_json_with_retry(&server_config_path(dir), config)
}
