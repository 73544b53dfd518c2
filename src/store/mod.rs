//! Object storage abstraction.
//!
//! The [`ObjectStore`] trait is the narrow slice of an object store the
//! pipeline needs: list by prefix, read, overwrite, server-side copy and
//! delete. Keys are plain strings within a single bucket.
//!
//! Two backends:
//! - [`s3::S3Store`]: Amazon S3 or any S3-compatible service.
//! - [`memory::MemoryStore`]: in-process map, for tests and dry runs.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod s3;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryStore;
pub use s3::S3Store;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location, e.g. `s3://bucket` or `memory://`.
    fn location(&self) -> String;

    /// All keys under `prefix`, in the order the store returns them.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Read an object. A missing key is an error.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Write an object, replacing any existing object at `key`.
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()>;

    /// Server-side copy within the bucket.
    async fn copy(&self, from: &str, to: &str) -> Result<()>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// MIME type sent with uploads, from the key's extension.
pub fn content_type_for(key: &str) -> &'static str {
    match key.rsplit('.').next() {
        Some("json") => "application/json",
        Some("csv") => "text/csv; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("raw/spotify_raw_1.json"), "application/json");
        assert_eq!(
            content_type_for("transformed_data/songs/song_transformed_x.csv"),
            "text/csv; charset=utf-8"
        );
        assert_eq!(content_type_for("README"), "application/octet-stream");
    }
}
