//! In-memory [`ObjectStore`] implementation for tests and dry runs.
//!
//! Objects live in a `BTreeMap` behind `std::sync::RwLock`, so listings come
//! back in lexical key order like S3's.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{EtlError, Result};

use super::ObjectStore;

/// In-memory object store.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, bypassing the async trait.
    pub fn insert(&self, key: impl Into<String>, body: impl Into<Vec<u8>>) -> Result<()> {
        self.write()?.insert(key.into(), body.into());
        Ok(())
    }

    /// Snapshot of an object's bytes.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().ok()?.get(key).cloned()
    }

    /// Every key currently stored, in lexical order.
    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seed every `*.json` file directly inside `dir` under `prefix`.
    /// Returns the number of files loaded.
    pub fn load_dir(&self, dir: &Path, prefix: &str) -> std::io::Result<usize> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in &paths {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                self.insert(format!("{}{}", prefix, name), std::fs::read(path)?)
                    .map_err(std::io::Error::other)?;
            }
        }
        Ok(paths.len())
    }

    /// Write every object to `dir`, using its key as the relative path.
    pub fn dump_dir(&self, dir: &Path) -> std::io::Result<usize> {
        let objects = self
            .objects
            .read()
            .map_err(|_| std::io::Error::other("memory store lock poisoned"))?;
        for (key, body) in objects.iter() {
            let path = dir.join(key);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, body)?;
        }
        Ok(objects.len())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.objects
            .read()
            .map_err(|_| EtlError::Store("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.objects
            .write()
            .map_err(|_| EtlError::Store("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn location(&self) -> String {
        "memory://".to_string()
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .read()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.read()?
            .get(key)
            .cloned()
            .ok_or_else(|| EtlError::Store(format!("object not found: {}", key)))
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.write()?.insert(key.to_string(), body);
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let mut objects = self.write()?;
        let body = objects
            .get(from)
            .cloned()
            .ok_or_else(|| EtlError::Store(format!("copy source not found: {}", from)))?;
        objects.insert(to.to_string(), body);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.write()?.remove(key);
        Ok(())
    }
}
