//! Durable read-through cache with per-write freshness windows
//!
//! Entries live as one JSON document per key under
//! `{root}/{namespace}/{entity}/{fingerprint}.json`. Writes go to a unique
//! temporary file that is renamed over the target, so a reader sees either
//! the previous payload or the new one, never a mix.

use crate::error::CacheError;
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Cache address: `namespace / entity-id / parameter-fingerprint`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: String,
    entity: String,
    fingerprint: String,
}

impl CacheKey {
    /// Creates a key, rejecting segments that could escape the cache root
    pub fn new(
        namespace: impl Into<String>,
        entity: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> Result<Self, CacheError> {
        let key = Self {
            namespace: namespace.into(),
            entity: entity.into(),
            fingerprint: fingerprint.into(),
        };
        for segment in [&key.namespace, &key.entity, &key.fingerprint] {
            validate_segment(segment)?;
        }
        Ok(key)
    }

    /// Parses the `namespace/entity/fingerprint` form
    pub fn parse(raw: &str) -> Result<Self, CacheError> {
        let mut parts = raw.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(namespace), Some(entity), Some(fingerprint), None) => {
                Self::new(namespace, entity, fingerprint)
            }
            _ => Err(CacheError::InvalidKey(format!(
                "expected namespace/entity/fingerprint, got {raw:?}"
            ))),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn relative_path(&self) -> PathBuf {
        Path::new(&self.namespace)
            .join(&self.entity)
            .join(format!("{}.json", self.fingerprint))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.entity, self.fingerprint)
    }
}

fn validate_segment(segment: &str) -> Result<(), CacheError> {
    let bad = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0']);
    if bad {
        return Err(CacheError::InvalidKey(format!(
            "invalid key segment {segment:?}"
        )));
    }
    Ok(())
}

/// A cached payload together with its write time
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub key: CacheKey,
    pub payload: T,
    pub written_at: DateTime<Utc>,
    /// Window the writer declared for this entry
    pub freshness_window: Duration,
}

impl<T> CacheEntry<T> {
    /// Age of the entry at `now`
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.written_at)
    }

    /// Whether the entry is within `window` at `now`
    ///
    /// Stale once `now - written_at > window`.
    pub fn is_fresh_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.age_at(now) <= window
    }

    /// Whether the entry is within its own declared window at `now`
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.is_fresh_within(self.freshness_window, now)
    }

    /// Whether the entry is within its own declared window right now
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }
}

/// On-disk envelope
#[derive(Serialize, Deserialize)]
struct StoredEntry<T> {
    written_at: DateTime<Utc>,
    freshness_window_secs: i64,
    payload: T,
}

/// File-backed freshness cache
///
/// `lookup` is a pure read and never touches the network; callers decide
/// whether an absent or stale entry warrants a refresh. `store` is the only
/// mutator. Concurrent stores to distinct keys are independent; concurrent
/// stores to the same key are last-writer-wins.
#[derive(Debug, Clone)]
pub struct FreshnessCache {
    root: PathBuf,
}

impl FreshnessCache {
    /// Creates a cache rooted at `root`; directories are created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Whether `entry` is within `window` right now, independent of payload
    pub fn is_fresh<T>(entry: &CacheEntry<T>, window: Duration) -> bool {
        entry.is_fresh_within(window, Utc::now())
    }

    /// Reads the entry for `key`
    ///
    /// Missing, unreadable and corrupt entries all come back as `None` so the
    /// caller refetches and the next `store` heals the slot.
    pub async fn lookup<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Unreadable cache entry, treating as absent");
                return None;
            }
        };

        match serde_json::from_slice::<StoredEntry<T>>(&bytes) {
            Ok(stored) => Some(CacheEntry {
                key: key.clone(),
                payload: stored.payload,
                written_at: stored.written_at,
                freshness_window: Duration::seconds(stored.freshness_window_secs),
            }),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Corrupt cache entry, treating as absent");
                None
            }
        }
    }

    /// Writes `payload` under `key`, replacing any previous entry whole
    pub async fn store<T: Serialize>(
        &self,
        key: &CacheKey,
        payload: &T,
        freshness_window: Duration,
    ) -> Result<DateTime<Utc>, CacheError> {
        self.store_at(key, payload, freshness_window, Utc::now()).await
    }

    /// Writes `payload` as if it had been fetched at `written_at`
    pub(crate) async fn store_at<T: Serialize>(
        &self,
        key: &CacheKey,
        payload: &T,
        freshness_window: Duration,
        written_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CacheError> {
        let bytes = serde_json::to_vec(&StoredEntry {
            written_at,
            freshness_window_secs: freshness_window.num_seconds(),
            payload,
        })?;

        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tracing::debug!(key = %key, bytes = bytes.len(), "Stored cache entry");
        Ok(written_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> (tempfile::TempDir, FreshnessCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = FreshnessCache::new(dir.path());
        (dir, cache)
    }

    #[test]
    fn test_key_round_trips_through_display() {
        let key = CacheKey::parse("prices/0005/20240101-20240110").unwrap();
        assert_eq!(key.namespace(), "prices");
        assert_eq!(key.entity(), "0005");
        assert_eq!(key.fingerprint(), "20240101-20240110");
        assert_eq!(key.to_string(), "prices/0005/20240101-20240110");
    }

    #[test]
    fn test_key_rejects_escaping_segments() {
        assert!(CacheKey::parse("prices/../secret").is_err());
        assert!(CacheKey::parse("prices/0005").is_err());
        assert!(CacheKey::parse("a/b/c/d").is_err());
        assert!(CacheKey::new("prices", "", "x").is_err());
        assert!(CacheKey::new("prices", "a\\b", "x").is_err());
    }

    #[tokio::test]
    async fn test_lookup_missing_is_absent() {
        let (_dir, cache) = cache();
        let key = CacheKey::parse("prices/0005/none").unwrap();
        assert!(cache.lookup::<serde_json::Value>(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_store_then_lookup_is_fresh() {
        let (_dir, cache) = cache();
        let key = CacheKey::parse("prices/0005/20240101-20240110").unwrap();
        let payload = json!([{"date": "2024-01-02", "close": 100.0}]);

        let written_at = cache.store(&key, &payload, Duration::days(1)).await.unwrap();
        let entry = cache.lookup::<serde_json::Value>(&key).await.unwrap();

        assert_eq!(entry.payload, payload);
        assert_eq!(entry.written_at, written_at);
        assert!(entry.is_fresh());
        assert!(FreshnessCache::is_fresh(&entry, Duration::days(1)));
    }

    #[tokio::test]
    async fn test_freshness_window_by_wall_clock_age() {
        let (_dir, cache) = cache();
        let key = CacheKey::parse("prices/0005/20240101-20240110").unwrap();
        let payload = json!([{"date": "2024-01-02", "close": 100.0}]);
        cache.store(&key, &payload, Duration::days(1)).await.unwrap();

        let entry = cache.lookup::<serde_json::Value>(&key).await.unwrap();
        let two_hours_later = entry.written_at + Duration::hours(2);
        let next_day = entry.written_at + Duration::hours(25);

        assert!(entry.is_fresh_at(two_hours_later));
        assert!(!entry.is_fresh_at(next_day));
        // Stale entries are still returned intact
        assert_eq!(entry.payload, payload);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_absent_and_heals() {
        let (dir, cache) = cache();
        let key = CacheKey::parse("ratios/0005/kis").unwrap();
        let path = dir.path().join("ratios/0005/kis.json");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"{not json").await.unwrap();

        assert!(cache.lookup::<serde_json::Value>(&key).await.is_none());

        cache.store(&key, &json!({"roe": 1.5}), Duration::days(7)).await.unwrap();
        let entry = cache.lookup::<serde_json::Value>(&key).await.unwrap();
        assert_eq!(entry.payload, json!({"roe": 1.5}));
    }

    #[tokio::test]
    async fn test_payload_shape_mismatch_is_absent() {
        let (_dir, cache) = cache();
        let key = CacheKey::parse("companies/0005/kis").unwrap();
        cache.store(&key, &json!("just a string"), Duration::days(7)).await.unwrap();

        assert!(cache.lookup::<Vec<f64>>(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_same_key_last_writer_wins() {
        let (_dir, cache) = cache();
        let key = CacheKey::parse("prices/0005/x").unwrap();
        cache.store(&key, &json!(1), Duration::days(1)).await.unwrap();
        cache.store(&key, &json!(2), Duration::hours(1)).await.unwrap();

        let entry = cache.lookup::<serde_json::Value>(&key).await.unwrap();
        assert_eq!(entry.payload, json!(2));
        assert_eq!(entry.freshness_window, Duration::hours(1));
    }

    #[tokio::test]
    async fn test_concurrent_stores_to_distinct_keys() {
        let (_dir, cache) = cache();
        let writes = (0..16).map(|i| {
            let cache = cache.clone();
            async move {
                let key = CacheKey::new("prices", format!("{i:04}"), "x").unwrap();
                cache.store(&key, &json!({ "i": i }), Duration::days(1)).await
            }
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }

        for i in 0..16 {
            let key = CacheKey::new("prices", format!("{i:04}"), "x").unwrap();
            let entry = cache.lookup::<serde_json::Value>(&key).await.unwrap();
            assert_eq!(entry.payload, json!({ "i": i }));
        }
    }
}
