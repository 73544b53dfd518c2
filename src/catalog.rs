//! Spotify Web API client (the raw fetcher).
//!
//! Authenticates with the OAuth2 client-credentials flow and reads one page
//! of a playlist's items. The response body is handed on verbatim; nothing
//! here interprets it beyond checking that it is JSON.
//!
//! No retries happen here. Whatever runs the job owns the retry policy, so
//! every failure is surfaced as an [`EtlError::Catalog`] or
//! [`EtlError::RateLimited`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{CatalogConfig, Credentials};
use crate::error::{EtlError, Result};
use crate::models::FetchedPlaylist;

/// Page size requested from the playlist items endpoint (the API maximum).
const PAGE_LIMIT: &str = "100";

/// Something that can produce the raw playlist document for a run.
#[async_trait]
pub trait PlaylistSource: Send + Sync {
    async fn fetch_playlist(&self) -> Result<FetchedPlaylist>;
}

/// Catalog API client for one configured playlist.
pub struct SpotifyClient {
    client: Client,
    credentials: Credentials,
    playlist_id: String,
    api_base_url: String,
    accounts_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl SpotifyClient {
    /// Build a client from config. Fails if no client credentials are
    /// available from the file or the environment.
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EtlError::Config(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            client,
            credentials: config.credentials()?,
            playlist_id: config.playlist_id().to_string(),
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            accounts_url: config.accounts_url.trim_end_matches('/').to_string(),
        })
    }

    /// Exchange client credentials for a bearer token.
    async fn access_token(&self) -> Result<String> {
        let url = format!("{}/api/token", self.accounts_url);
        debug!("POST {}", url);

        let resp = self
            .client
            .post(&url)
            .basic_auth(
                &self.credentials.client_id,
                Some(&self.credentials.client_secret),
            )
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| EtlError::Catalog(format!("token request failed: {}", e)))?;

        let resp = check_response(resp).await?;
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| EtlError::Catalog(format!("invalid token response: {}", e)))?;
        Ok(token.access_token)
    }

    /// Fetch the first page of the playlist's items, returning the body
    /// verbatim.
    pub async fn playlist_tracks(&self) -> Result<String> {
        let token = self.access_token().await?;
        let url = format!("{}/playlists/{}/tracks", self.api_base_url, self.playlist_id);
        debug!("GET {}", url);

        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[
                ("limit", PAGE_LIMIT),
                ("offset", "0"),
                ("additional_types", "track"),
            ])
            .send()
            .await
            .map_err(|e| EtlError::Catalog(format!("playlist request failed: {}", e)))?;

        let body = check_response(resp)
            .await?
            .text()
            .await
            .map_err(|e| EtlError::Catalog(format!("reading playlist response: {}", e)))?;

        serde_json::from_str::<serde_json::Value>(&body)
            .map_err(|e| EtlError::Catalog(format!("playlist response is not JSON: {}", e)))?;
        Ok(body)
    }
}

#[async_trait]
impl PlaylistSource for SpotifyClient {
    async fn fetch_playlist(&self) -> Result<FetchedPlaylist> {
        let body = self.playlist_tracks().await?;
        let filename = raw_filename(Utc::now());
        info!(
            playlist = %self.playlist_id,
            bytes = body.len(),
            filename = %filename,
            "fetched playlist"
        );
        Ok(FetchedPlaylist { filename, body })
    }
}

/// `spotify_raw_<YYYYMMDDHHMMSS>.json` for the given fetch time.
pub fn raw_filename(at: DateTime<Utc>) -> String {
    format!("spotify_raw_{}.json", at.format("%Y%m%d%H%M%S"))
}

async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = resp.text().await.unwrap_or_default();
    Err(classify_failure(status, retry_after, &body))
}

/// Map a non-2xx catalog response onto the error taxonomy.
fn classify_failure(status: StatusCode, retry_after: Option<u64>, body: &str) -> EtlError {
    let excerpt: String = body.chars().take(300).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => EtlError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EtlError::Catalog(format!(
            "authentication failed (HTTP {}): {}",
            status, excerpt
        )),
        StatusCode::NOT_FOUND => EtlError::Catalog(format!("playlist not found: {}", excerpt)),
        _ => EtlError::Catalog(format!("HTTP {}: {}", status, excerpt)),
    }
}
