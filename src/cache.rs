use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Persisted enrichment result for one article URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub sentiment: Option<String>,
}

/// Hex SHA-256 of the raw URL string. Stable across runs.
pub fn fingerprint(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Flat JSON map from URL fingerprint to `CacheEntry`, loaded fully at
/// process start and rewritten fully on persist. Advisory only: a
/// missing or corrupt store is treated as empty, never fatal.
pub struct ResultCache {
    path: PathBuf,
    entries: HashMap<String, CacheEntry>,
}

impl ResultCache {
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, CacheEntry>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!("Cache file {} is corrupt, starting empty: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => {
                debug!("No cache file at {}, starting empty", path.display());
                HashMap::new()
            }
        };
        ResultCache { path, entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, url: &str) -> Option<&CacheEntry> {
        self.entries.get(&fingerprint(url))
    }

    pub fn set(&mut self, url: &str, entry: CacheEntry) {
        self.entries.insert(fingerprint(url), entry);
    }

    /// Rewrite the whole store. Write goes to a temp file first, then a
    /// rename, so a crash mid-write never leaves a truncated store.
    pub fn persist(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Persisted {} cache entries to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fingerprint_stable_and_distinct() {
        let a = fingerprint("https://a.com/1");
        let b = fingerprint("https://a.com/1");
        let c = fingerprint("https://a.com/2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::load(dir.path().join("nope.json"));
        assert!(cache.is_empty());
        assert!(cache.get("https://a.com/1").is_none());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "{not valid json").unwrap();
        let cache = ResultCache::load(&path);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");

        let mut cache = ResultCache::load(&path);
        cache.set(
            "https://a.com/1",
            CacheEntry {
                sector: Some("Energy".to_string()),
                sentiment: Some("Positive".to_string()),
            },
        );
        cache.persist().unwrap();

        let reloaded = ResultCache::load(&path);
        assert_eq!(reloaded.len(), 1);
        let entry = reloaded.get("https://a.com/1").unwrap();
        assert_eq!(entry.sector.as_deref(), Some("Energy"));
        assert_eq!(entry.sentiment.as_deref(), Some("Positive"));
    }

    #[test]
    fn test_set_overwrites() {
        let dir = TempDir::new().unwrap();
        let mut cache = ResultCache::load(dir.path().join("cache.json"));
        cache.set(
            "https://a.com/1",
            CacheEntry {
                sector: Some("Energy".to_string()),
                sentiment: None,
            },
        );
        cache.set(
            "https://a.com/1",
            CacheEntry {
                sector: Some("Financials".to_string()),
                sentiment: Some("Neutral".to_string()),
            },
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get("https://a.com/1").unwrap().sector.as_deref(),
            Some("Financials")
        );
    }

    #[test]
    fn test_persist_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/cache.json");
        let mut cache = ResultCache::load(&path);
        cache.set(
            "https://b.id/2",
            CacheEntry {
                sector: Some("Unknown".to_string()),
                sentiment: Some("Neutral".to_string()),
            },
        );
        cache.persist().unwrap();
        assert!(path.exists());
    }
}
