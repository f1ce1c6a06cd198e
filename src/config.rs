//! Configuration file and watermark store.
//!
//! The config file is TOML and holds the recipient, SMTP credentials, and
//! one `[[feeds]]` table per source. The per-feed `last_pub_date` is the
//! watermark and the only value this program ever writes back.
//!
//! ```toml
//! email = "me@example.com"
//!
//! [smtp]
//! login = "robot@example.com"
//! password = "secret"
//! server = "smtp.example.com:465"
//!
//! [[feeds]]
//! name = "Blog"
//! url = "https://example.com/rss.xml"
//! last_pub_date = "2024-01-01 00:00:00 +0000 UTC"
//! ```
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::feed::date;

/// Implicit-TLS submission port, used when `server` has no port.
pub const DEFAULT_SMTP_PORT: u16 = 465;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config file: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("No feed named {0:?} in config file")]
    UnknownSource(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// One subscribed feed and the instant below which its items were already
/// delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSource {
    pub name: String,
    pub url: String,
    pub watermark: DateTime<Utc>,
}

/// SMTP account used for every digest in a run.
///
/// Custom Debug impl masks `password` to prevent secret leakage in logs.
pub struct MailCredentials {
    pub login: String,
    pub password: SecretString,
    pub host: String,
    pub port: u16,
}

impl Clone for MailCredentials {
    fn clone(&self) -> Self {
        Self {
            login: self.login.clone(),
            password: SecretString::from(self.password.expose_secret().to_owned()),
            host: self.host.clone(),
            port: self.port,
        }
    }
}

impl std::fmt::Debug for MailCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailCredentials")
            .field("login", &self.login)
            .field("password", &"[REDACTED]")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

/// How feed-supplied description HTML is placed into a digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionMode {
    /// Insert the fragment as markup.
    #[default]
    Raw,
    /// Escape the fragment so it shows as text.
    Escape,
}

/// Everything a run needs, loaded once and never mutated.
#[derive(Debug, Clone)]
pub struct Config {
    /// Digest recipient.
    pub email: String,
    pub smtp: MailCredentials,
    /// Header `From` mailbox. Defaults to the SMTP login.
    pub from: Option<String>,
    pub descriptions: DescriptionMode,
    /// Sources in file order. Delivery follows this order.
    pub sources: Vec<FeedSource>,
}

// ============================================================================
// File Schema
// ============================================================================

#[derive(Deserialize)]
struct ConfigFile {
    email: Option<String>,
    smtp: Option<SmtpSection>,
    #[serde(default)]
    digest: DigestSection,
    #[serde(default)]
    feeds: Vec<FeedEntry>,
}

#[derive(Deserialize)]
struct SmtpSection {
    login: String,
    password: String,
    server: String,
    from: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DigestSection {
    descriptions: DescriptionMode,
}

#[derive(Deserialize)]
struct FeedEntry {
    name: String,
    url: String,
    last_pub_date: Option<String>,
}

const KNOWN_KEYS: [&str; 4] = ["email", "smtp", "digest", "feeds"];

impl Config {
    /// Parses and validates config file content.
    ///
    /// - Unknown top-level keys → accepted, logged as warning
    /// - Missing `email` or `[smtp]` → `Err(ConfigError::Invalid)`
    /// - Duplicate or empty feed names → `Err(ConfigError::Invalid)`
    /// - Non-HTTP(S) feed URL → `Err(ConfigError::Invalid)`
    /// - Unparseable `last_pub_date` → `Err(ConfigError::Invalid)`
    /// - Absent `last_pub_date` → watermark at the Unix epoch
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let file: ConfigFile = toml::from_str(content)?;

        let email = file
            .email
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| ConfigError::Invalid("missing `email`".to_string()))?;
        let smtp = file
            .smtp
            .ok_or_else(|| ConfigError::Invalid("missing [smtp] section".to_string()))?;
        let (host, port) = split_server(&smtp.server)?;

        let mut seen = HashSet::new();
        let mut sources = Vec::with_capacity(file.feeds.len());
        for entry in file.feeds {
            sources.push(validate_feed(entry, &mut seen)?);
        }

        if sources.is_empty() {
            tracing::warn!("Config file lists no feeds");
        }

        Ok(Self {
            email,
            smtp: MailCredentials {
                login: smtp.login,
                password: SecretString::from(smtp.password),
                host,
                port,
            },
            from: smtp.from,
            descriptions: file.digest.descriptions,
            sources,
        })
    }
}

fn split_server(server: &str) -> Result<(String, u16), ConfigError> {
    let server = server.trim();
    let (host, port) = match server.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid(format!("bad port in smtp server {server:?}")))?;
            (host, port)
        }
        None => (server, DEFAULT_SMTP_PORT),
    };

    if host.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "missing host in smtp server {server:?}"
        )));
    }
    Ok((host.to_string(), port))
}

fn validate_feed(entry: FeedEntry, seen: &mut HashSet<String>) -> Result<FeedSource, ConfigError> {
    let name = entry.name.trim().to_string();
    if name.is_empty() {
        return Err(ConfigError::Invalid("feed with empty name".to_string()));
    }
    if !seen.insert(name.clone()) {
        return Err(ConfigError::Invalid(format!("duplicate feed name {name:?}")));
    }

    let url = url::Url::parse(entry.url.trim())
        .map_err(|e| ConfigError::Invalid(format!("feed {name:?}: invalid url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid(format!(
            "feed {name:?}: unsupported scheme {} (only http/https allowed)",
            url.scheme()
        )));
    }

    let watermark = match entry.last_pub_date.as_deref().map(str::trim) {
        None | Some("") => DateTime::UNIX_EPOCH,
        Some(raw) => date::normalize(raw)
            .map_err(|e| ConfigError::Invalid(format!("feed {name:?}: {e}")))?,
    };

    Ok(FeedSource {
        name,
        url: url.into(),
        watermark,
    })
}

// ============================================================================
// Stores
// ============================================================================

/// Source of configuration and sink for advanced watermarks.
pub trait ConfigStore: Send + Sync {
    /// Loads credentials, recipient, and sources.
    fn load(&self) -> Result<Config, ConfigError>;

    /// Persists `at` as the watermark of the source named `source`.
    ///
    /// Implementations rewrite only that source's watermark and must not
    /// clobber other state.
    fn commit_watermark(&self, source: &str, at: DateTime<Utc>) -> Result<(), ConfigError>;
}

/// Config store backed by a TOML file on disk.
///
/// Commits are serialized and re-read the file each time, so edits made to
/// other keys while a run is in progress survive.
pub struct TomlConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TomlConfigStore {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<String, ConfigError> {
        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        match std::fs::read_to_string(&self.path) {
            Ok(c) => Ok(c),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ConfigError::NotFound(self.path.clone()))
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }
}

impl ConfigStore for TomlConfigStore {
    fn load(&self) -> Result<Config, ConfigError> {
        let content = self.read()?;
        let config = Config::from_toml_str(&content)?;
        tracing::info!(
            path = %self.path.display(),
            feeds = config.sources.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    fn commit_watermark(&self, source: &str, at: DateTime<Utc>) -> Result<(), ConfigError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut table: toml::Table = self.read()?.parse()?;
        let entry = table
            .get_mut("feeds")
            .and_then(toml::Value::as_array_mut)
            .and_then(|feeds| {
                feeds.iter_mut().filter_map(toml::Value::as_table_mut).find(|feed| {
                    feed.get("name")
                        .and_then(toml::Value::as_str)
                        .is_some_and(|name| name.trim() == source)
                })
            })
            .ok_or_else(|| ConfigError::UnknownSource(source.to_string()))?;

        let stamp = date::format_watermark(at);
        entry.insert("last_pub_date".to_string(), toml::Value::String(stamp.clone()));

        let content = toml::to_string(&table)?;
        write_atomically(&self.path, content.as_bytes())?;

        tracing::debug!(source = %source, watermark = %stamp, "Watermark written");
        Ok(())
    }
}

/// Replaces `dst` using write-to-temp-then-rename, so a crash leaves either
/// the old or the new file and never a partial one.
fn write_atomically(dst: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = dst.with_extension(format!("tmp.{:016x}", random_suffix));

    let result = (|| {
        let mut temp_file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        // Keep the original mode: the file holds a password.
        if let Ok(meta) = std::fs::metadata(dst) {
            temp_file.set_permissions(meta.permissions())?;
        }
        temp_file.write_all(content)?;
        temp_file.sync_all()?;
        drop(temp_file);

        #[cfg(windows)]
        if dst.exists() {
            std::fs::remove_file(dst)?;
        }
        std::fs::rename(&temp_path, dst)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

/// Config store held in memory. Commits update the held config, so a later
/// `load` sees them, as it would after a file round-trip.
pub struct MemoryConfigStore {
    config: Mutex<Config>,
    commits: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl MemoryConfigStore {
    pub fn new(config: Config) -> Self {
        Self {
            config: Mutex::new(config),
            commits: Mutex::new(Vec::new()),
        }
    }

    /// Every successful commit, in the order it happened.
    pub fn commits(&self) -> Vec<(String, DateTime<Utc>)> {
        self.commits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn watermark(&self, source: &str) -> Option<DateTime<Utc>> {
        self.config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sources
            .iter()
            .find(|s| s.name == source)
            .map(|s| s.watermark)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<Config, ConfigError> {
        Ok(self.config.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn commit_watermark(&self, source: &str, at: DateTime<Utc>) -> Result<(), ConfigError> {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        let entry = config
            .sources
            .iter_mut()
            .find(|s| s.name == source)
            .ok_or_else(|| ConfigError::UnknownSource(source.to_string()))?;
        entry.watermark = at;
        self.commits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((source.to_string(), at));
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
