//! TOML configuration parsing.
//!
//! One immutable [`Config`] is loaded at startup and handed by reference to
//! every component. Secrets may be left out of the file and supplied through
//! the environment instead (see [`CatalogConfig::credentials`]).
//!
//! ```toml
//! [catalog]
//! playlist = "https://open.spotify.com/playlist/0mrqaVOe6KYEEcaSYhVK4a"
//!
//! [storage]
//! bucket = "spotify-etl-project"
//! region = "us-east-1"
//! pending_prefix = "raw_data/to_processed/"
//! processed_prefix = "raw_data/processed/"
//!
//! [storage.transformed]
//! albums = "transformed_data/albums/"
//!
//! [schedule]
//! interval_secs = 86400
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::error::EtlError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub catalog: CatalogConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Playlist id or `open.spotify.com` link.
    pub playlist: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_accounts_url")]
    pub accounts_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_base_url() -> String {
    "https://api.spotify.com/v1".to_string()
}
fn default_accounts_url() -> String {
    "https://accounts.spotify.com".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_pending_prefix")]
    pub pending_prefix: String,
    #[serde(default = "default_processed_prefix")]
    pub processed_prefix: String,
    #[serde(default)]
    pub transformed: TransformedPrefixes,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_pending_prefix() -> String {
    "raw_data/to_processed/".to_string()
}
fn default_processed_prefix() -> String {
    "raw_data/processed/".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransformedPrefixes {
    #[serde(default = "default_albums_prefix")]
    pub albums: String,
    #[serde(default = "default_artists_prefix")]
    pub artists: String,
    #[serde(default = "default_songs_prefix")]
    pub songs: String,
}

impl Default for TransformedPrefixes {
    fn default() -> Self {
        Self {
            albums: default_albums_prefix(),
            artists: default_artists_prefix(),
            songs: default_songs_prefix(),
        }
    }
}

fn default_albums_prefix() -> String {
    "transformed_data/albums/".to_string()
}
fn default_artists_prefix() -> String {
    "transformed_data/artists/".to_string()
}
fn default_songs_prefix() -> String {
    "transformed_data/songs/".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    86_400
}

/// Resolved client credentials for the catalog API.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl CatalogConfig {
    /// Client credentials, preferring `SPOTIFY_CLIENT_ID` /
    /// `SPOTIFY_CLIENT_SECRET` over the values in the file. Empty values are
    /// treated as unset.
    pub fn credentials(&self) -> crate::error::Result<Credentials> {
        self.credentials_with(|name| std::env::var(name).ok())
    }

    fn credentials_with(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> crate::error::Result<Credentials> {
        let non_empty = |v: &String| !v.trim().is_empty();
        let client_id = env("SPOTIFY_CLIENT_ID")
            .filter(non_empty)
            .or_else(|| self.client_id.clone().filter(non_empty))
            .ok_or_else(|| {
                EtlError::Config("catalog.client_id or SPOTIFY_CLIENT_ID not set".to_string())
            })?;
        let client_secret = env("SPOTIFY_CLIENT_SECRET")
            .filter(non_empty)
            .or_else(|| self.client_secret.clone().filter(non_empty))
            .ok_or_else(|| {
                EtlError::Config(
                    "catalog.client_secret or SPOTIFY_CLIENT_SECRET not set".to_string(),
                )
            })?;
        Ok(Credentials {
            client_id,
            client_secret,
        })
    }

    /// The bare playlist id, whether configured as an id or a share link.
    pub fn playlist_id(&self) -> &str {
        playlist_id_from(&self.playlist)
    }
}

/// Extract the playlist id from `https://open.spotify.com/playlist/<id>?si=..`,
/// `spotify:playlist:<id>` or a bare id.
pub fn playlist_id_from(value: &str) -> &str {
    let value = value.trim().trim_end_matches('/');
    let value = value.split('?').next().unwrap_or(value);
    value.rsplit(['/', ':']).next().unwrap_or(value)
}

/// Make a key prefix end in exactly one `/`, unless it is empty.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

impl Config {
    /// Normalize prefixes and check the invariants the pipeline relies on.
    pub fn validate(mut self) -> Result<Self> {
        let storage = &mut self.storage;
        storage.pending_prefix = normalize_prefix(&storage.pending_prefix);
        storage.processed_prefix = normalize_prefix(&storage.processed_prefix);
        storage.transformed.albums = normalize_prefix(&storage.transformed.albums);
        storage.transformed.artists = normalize_prefix(&storage.transformed.artists);
        storage.transformed.songs = normalize_prefix(&storage.transformed.songs);

        if storage.bucket.trim().is_empty() {
            anyhow::bail!("storage.bucket must not be empty");
        }
        if storage.pending_prefix.is_empty() {
            anyhow::bail!("storage.pending_prefix must not be empty");
        }
        if storage.pending_prefix == storage.processed_prefix {
            anyhow::bail!("storage.pending_prefix and storage.processed_prefix must differ");
        }
        if storage.processed_prefix.starts_with(&storage.pending_prefix) {
            anyhow::bail!(
                "storage.processed_prefix '{}' must not live under storage.pending_prefix '{}'",
                storage.processed_prefix,
                storage.pending_prefix
            );
        }
        let playlist_id = self.catalog.playlist_id();
        if playlist_id.is_empty() {
            anyhow::bail!("catalog.playlist must not be empty");
        }
        if playlist_id == "playlist" || playlist_id.contains('.') {
            anyhow::bail!(
                "catalog.playlist '{}' does not name a playlist",
                self.catalog.playlist
            );
        }
        if self.catalog.timeout_secs == 0 {
            anyhow::bail!("catalog.timeout_secs must be > 0");
        }
        if self.schedule.interval_secs == 0 {
            anyhow::bail!("schedule.interval_secs must be > 0");
        }

        Ok(self)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[catalog]
playlist = "https://open.spotify.com/playlist/0mrqaVOe6KYEEcaSYhVK4a?si=abc"

[storage]
bucket = "etl-bucket"
"#;

    #[test]
    fn test_defaults_applied() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.storage.region, "us-east-1");
        assert_eq!(cfg.storage.pending_prefix, "raw_data/to_processed/");
        assert_eq!(cfg.storage.processed_prefix, "raw_data/processed/");
        assert_eq!(cfg.storage.transformed.songs, "transformed_data/songs/");
        assert_eq!(cfg.schedule.interval_secs, 86_400);
        assert_eq!(cfg.catalog.timeout_secs, 30);
    }

    #[test]
    fn test_playlist_id_from_link() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.catalog.playlist_id(), "0mrqaVOe6KYEEcaSYhVK4a");
    }

    #[test]
    fn test_playlist_id_forms() {
        assert_eq!(
            playlist_id_from("37i9dQZF1DXcBWIGoYBM5M"),
            "37i9dQZF1DXcBWIGoYBM5M"
        );
        assert_eq!(
            playlist_id_from("spotify:playlist:37i9dQZF1DXcBWIGoYBM5M"),
            "37i9dQZF1DXcBWIGoYBM5M"
        );
        assert_eq!(
            playlist_id_from("https://open.spotify.com/playlist/37i9dQZF1DXcBWIGoYBM5M/"),
            "37i9dQZF1DXcBWIGoYBM5M"
        );
    }

    #[test]
    fn test_prefixes_normalized() {
        let cfg = parse_config(
            r#"
[catalog]
playlist = "abc"

[storage]
bucket = "b"
pending_prefix = "/raw/pending"
processed_prefix = "raw/done//"
"#,
        )
        .unwrap();
        assert_eq!(cfg.storage.pending_prefix, "raw/pending/");
        assert_eq!(cfg.storage.processed_prefix, "raw/done/");
    }

    #[test]
    fn test_same_prefixes_rejected() {
        let err = parse_config(
            r#"
[catalog]
playlist = "abc"

[storage]
bucket = "b"
pending_prefix = "raw/"
processed_prefix = "raw"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn test_processed_under_pending_rejected() {
        let err = parse_config(
            r#"
[catalog]
playlist = "abc"

[storage]
bucket = "b"
pending_prefix = "raw/"
processed_prefix = "raw/done/"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must not live under"));
    }

    #[test]
    fn test_empty_bucket_rejected() {
        let err = parse_config(
            r#"
[catalog]
playlist = "abc"

[storage]
bucket = "  "
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("storage.bucket"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let content = format!("{}\n[schedule]\ninterval_secs = 0\n", MINIMAL);
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn test_missing_playlist_rejected() {
        assert!(parse_config("[catalog]\n\n[storage]\nbucket = \"b\"\n").is_err());
    }

    #[test]
    fn test_playlist_link_without_id_rejected() {
        for playlist in [
            "https://open.spotify.com/playlist/",
            "https://open.spotify.com",
        ] {
            let content = format!(
                "[catalog]\nplaylist = \"{}\"\n\n[storage]\nbucket = \"b\"\n",
                playlist
            );
            let err = parse_config(&content).unwrap_err();
            assert!(
                err.to_string().contains("does not name a playlist"),
                "{}: {}",
                playlist,
                err
            );
        }
    }

    fn catalog(client_id: Option<&str>, client_secret: Option<&str>) -> CatalogConfig {
        CatalogConfig {
            client_id: client_id.map(str::to_string),
            client_secret: client_secret.map(str::to_string),
            playlist: "abc".to_string(),
            api_base_url: default_api_base_url(),
            accounts_url: default_accounts_url(),
            timeout_secs: 30,
        }
    }

    #[test]
    fn test_env_credentials_take_precedence() {
        let creds = catalog(Some("file-id"), Some("file-secret"))
            .credentials_with(|name| match name {
                "SPOTIFY_CLIENT_ID" => Some("env-id".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(creds.client_id, "env-id");
        assert_eq!(creds.client_secret, "file-secret");
    }

    #[test]
    fn test_empty_env_credentials_ignored() {
        let creds = catalog(Some("file-id"), Some("file-secret"))
            .credentials_with(|_| Some(String::new()))
            .unwrap();
        assert_eq!(creds.client_id, "file-id");
        assert_eq!(creds.client_secret, "file-secret");
    }

    #[test]
    fn test_blank_credentials_are_missing() {
        let err = catalog(Some("id"), Some("  "))
            .credentials_with(|_| None)
            .unwrap_err();
        assert!(err.to_string().contains("client_secret"));
    }
}
