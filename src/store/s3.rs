//! Amazon S3 object store.
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication.
//! Listing follows `ListObjectsV2` continuation tokens; reads, writes,
//! copies and deletes are single signed requests. Custom endpoints switch
//! to path-style addressing for S3-compatible services (MinIO, LocalStack).
//!
//! Uses only pure-Rust dependencies (`hmac`, `sha2`) for signing.
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (temporary credentials / IAM roles)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use reqwest::Method;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::{EtlError, Result};

use super::{content_type_for, ObjectStore};

type HmacSha256 = Hmac<Sha256>;

/// An S3 bucket.
pub struct S3Store {
    bucket: String,
    region: String,
    /// `(scheme, host)` of a custom endpoint; `None` means AWS virtual-hosted.
    endpoint: Option<(String, String)>,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3Store {
    /// Build a store for the configured bucket with credentials from the
    /// environment.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        Ok(Self::with_credentials(config, AwsCredentials::from_env()?))
    }

    pub fn with_credentials(config: &StorageConfig, creds: AwsCredentials) -> Self {
        Self {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint: config.endpoint_url.as_deref().map(split_endpoint),
            creds,
            client: reqwest::Client::new(),
        }
    }

    fn host(&self) -> String {
        match &self.endpoint {
            Some((_, host)) => host.clone(),
            None => format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }

    fn scheme(&self) -> &str {
        match &self.endpoint {
            Some((scheme, _)) => scheme,
            None => "https",
        }
    }

    /// Canonical URI for a key, or for the bucket itself when `key` is `None`.
    fn canonical_uri(&self, key: Option<&str>) -> String {
        let encoded_key = key.map(encode_key).unwrap_or_default();
        match (&self.endpoint, key) {
            (Some(_), Some(_)) => format!("/{}/{}", self.bucket, encoded_key),
            (Some(_), None) => format!("/{}", self.bucket),
            (None, _) => format!("/{}", encoded_key),
        }
    }

    /// Sign and send one request.
    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        query: &[(String, String)],
        body: Vec<u8>,
        extra_headers: Vec<(String, String)>,
    ) -> Result<reqwest::Response> {
        let host = self.host();
        let uri = self.canonical_uri(key);
        let canonical_query = canonical_query_string(query);
        let payload_hash = hex_sha256(&body);
        let now = Utc::now();

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), now.format("%Y%m%dT%H%M%SZ").to_string()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.extend(extra_headers);

        let request = CanonicalRequest {
            method: method.as_str(),
            uri: &uri,
            query: &canonical_query,
            headers,
            payload_hash: &payload_hash,
        };
        let authorization = request.authorization(&self.creds, &self.region, now);

        let mut url = format!("{}://{}{}", self.scheme(), host, uri);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        debug!(method = %method, url = %url, "s3 request");

        let mut req_builder = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", authorization);
        for (name, value) in request.headers.iter().filter(|(n, _)| n != "host") {
            req_builder = req_builder.header(name.as_str(), value.as_str());
        }
        if let Some(key) = key {
            if method == Method::PUT && !body.is_empty() {
                req_builder = req_builder.header("Content-Type", content_type_for(key));
            }
        }

        req_builder.body(body).send().await.map_err(|e| {
            EtlError::Store(format!(
                "{} s3://{}/{} failed: {}",
                method,
                self.bucket,
                key.unwrap_or(""),
                e
            ))
        })
    }
}

/// Turn a non-2xx response into a store error carrying a body excerpt.
async fn check_status(resp: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(EtlError::Store(format!(
        "S3 {} failed (HTTP {}): {}",
        action,
        status,
        body.chars().take(500).collect::<String>()
    )))
}

#[async_trait]
impl ObjectStore for S3Store {
    fn location(&self) -> String {
        format!("s3://{}", self.bucket)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self
                .send(Method::GET, None, &query, Vec::new(), Vec::new())
                .await?;
            let resp = check_status(resp, "ListObjectsV2").await?;
            let xml = resp
                .text()
                .await
                .map_err(|e| EtlError::Store(format!("reading ListObjectsV2 body: {}", e)))?;

            let page = parse_list_objects_response(&xml)?;
            keys.extend(page.keys);

            match (page.is_truncated, page.next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .send(Method::GET, Some(key), &[], Vec::new(), Vec::new())
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EtlError::Store(format!(
                "object not found: s3://{}/{}",
                self.bucket, key
            )));
        }
        let resp = check_status(resp, &format!("GetObject {}", key)).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| EtlError::Store(format!("reading s3://{}/{}: {}", self.bucket, key, e)))?;
        Ok(bytes.to_vec())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let resp = self.send(Method::PUT, Some(key), &[], body, Vec::new()).await?;
        check_status(resp, &format!("PutObject {}", key)).await?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let source = format!("/{}/{}", self.bucket, encode_key(from));
        let resp = self
            .send(
                Method::PUT,
                Some(to),
                &[],
                Vec::new(),
                vec![("x-amz-copy-source".to_string(), source)],
            )
            .await?;
        let resp = check_status(resp, &format!("CopyObject {} -> {}", from, to)).await?;

        // CopyObject can answer 200 with an <Error> body.
        let body = resp.text().await.unwrap_or_default();
        if body.contains("<Error>") {
            return Err(EtlError::Store(format!(
                "S3 CopyObject {} -> {} failed: {}",
                from,
                to,
                body.chars().take(500).collect::<String>()
            )));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self
            .send(Method::DELETE, Some(key), &[], Vec::new(), Vec::new())
            .await?;
        check_status(resp, &format!("DeleteObject {}", key)).await?;
        Ok(())
    }
}

// ============ AWS Credentials ============

/// AWS credentials used for request signing.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Load credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and optionally `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            EtlError::Config("AWS_ACCESS_KEY_ID environment variable not set".into())
        })?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            EtlError::Config("AWS_SECRET_ACCESS_KEY environment variable not set".into())
        })?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ AWS SigV4 ============

/// The parts of a request that SigV4 signs.
struct CanonicalRequest<'a> {
    method: &'a str,
    uri: &'a str,
    query: &'a str,
    /// Lowercase header names. Must include `host` and `x-amz-date`.
    headers: Vec<(String, String)>,
    payload_hash: &'a str,
}

impl CanonicalRequest<'_> {
    fn sorted_headers(&self) -> Vec<(&str, &str)> {
        let mut headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.trim()))
            .collect();
        headers.sort_by(|a, b| a.0.cmp(b.0));
        headers
    }

    fn signed_headers(&self) -> String {
        self.sorted_headers()
            .iter()
            .map(|(k, _)| *k)
            .collect::<Vec<_>>()
            .join(";")
    }

    fn canonical_string(&self) -> String {
        let canonical_headers: String = self
            .sorted_headers()
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.method,
            self.uri,
            self.query,
            canonical_headers,
            self.signed_headers(),
            self.payload_hash
        )
    }

    /// Value of the `Authorization` header for this request at `now`.
    fn authorization(&self, creds: &AwsCredentials, region: &str, now: DateTime<Utc>) -> String {
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(self.canonical_string().as_bytes())
        );

        let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id,
            credential_scope,
            self.signed_headers(),
            signature
        )
    }
}

/// Split `http://localhost:9000/` into `("http", "localhost:9000")`.
fn split_endpoint(endpoint: &str) -> (String, String) {
    let (scheme, rest) = match endpoint.split_once("://") {
        Some((scheme, rest)) => (scheme.to_string(), rest),
        None => ("https".to_string(), endpoint),
    };
    (scheme, rest.trim_end_matches('/').to_string())
}

/// Sorted, URI-encoded query string.
fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// URI-encode each path segment of a key, keeping the slashes.
fn encode_key(key: &str) -> String {
    key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986: everything except `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ ListObjectsV2 XML ============

#[derive(Debug, Default, PartialEq)]
struct ListPage {
    keys: Vec<String>,
    is_truncated: bool,
    next_token: Option<String>,
}

/// Parse one `ListObjectsV2` response page. Directory placeholder keys
/// (ending in `/`) are skipped.
fn parse_list_objects_response(xml: &str) -> Result<ListPage> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = ListPage::default();
    let mut current: Option<Vec<u8>> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => current = Some(e.local_name().as_ref().to_vec()),
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| EtlError::Store(format!("invalid ListObjectsV2 XML: {}", e)))?;
                match current.as_deref() {
                    Some(b"Key") if !text.ends_with('/') => page.keys.push(text.into_owned()),
                    Some(b"IsTruncated") => page.is_truncated = text == "true",
                    Some(b"NextContinuationToken") => page.next_token = Some(text.into_owned()),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(EtlError::Store(format!(
                    "invalid ListObjectsV2 XML at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    Ok(page)
}
