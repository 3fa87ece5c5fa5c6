//! Router-state persistence.
//!
//! The bandit's sufficient statistics are serialized as a self-describing
//! JSON blob and written through one or more backends: a local file
//! (atomic temp-and-rename) and, optionally, a remote Redis key. Reads
//! prefer the remote copy and fall back to local. A blob whose schema
//! version or dimension does not match the running configuration is
//! treated as absent, producing a cold start rather than a malformed
//! router.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Current router-state schema version.
pub const ROUTER_STATE_VERSION: u32 = 1;

fn default_active() -> bool {
    true
}

/// Serialized form of one arm's sufficient statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmStateBlob {
    /// Inverse covariance, row-major, `d * d` entries.
    pub a_inv: Vec<f64>,
    /// Response accumulator, `d` entries.
    pub b: Vec<f64>,
    pub trials: u64,
    pub wins: u64,
    #[serde(default = "default_active")]
    pub active: bool,
}

/// Self-describing persisted router state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterStateBlob {
    pub version: u32,
    pub d: usize,
    pub arms: BTreeMap<String, ArmStateBlob>,
    pub updated_at: DateTime<Utc>,
}

impl RouterStateBlob {
    pub fn encode(&self) -> Result<String, StateStoreError> {
        serde_json::to_string(self).map_err(|e| StateStoreError::Encode(e.to_string()))
    }

    /// Decode and gate on schema version and dimension. Any mismatch or
    /// parse failure yields `None` — the caller starts cold.
    pub fn decode_checked(raw: &str, d: usize) -> Option<Self> {
        let blob: RouterStateBlob = match serde_json::from_str(raw) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "router state blob unreadable, starting cold");
                return None;
            }
        };
        if blob.version != ROUTER_STATE_VERSION {
            warn!(
                found = blob.version,
                expected = ROUTER_STATE_VERSION,
                "router state version mismatch, starting cold"
            );
            return None;
        }
        if blob.d != d {
            warn!(
                found = blob.d,
                expected = d,
                "router state dimension mismatch, starting cold"
            );
            return None;
        }
        // Arms with inconsistent matrix shapes are dropped individually.
        let mut blob = blob;
        blob.arms
            .retain(|_, arm| arm.a_inv.len() == d * d && arm.b.len() == d);
        Some(blob)
    }
}

#[derive(Error, Debug)]
pub enum StateStoreError {
    #[error("state io error: {0}")]
    Io(String),

    #[error("state encode error: {0}")]
    Encode(String),

    #[error("remote state error: {0}")]
    Remote(String),
}

/// Persistence backend for [`RouterStateBlob`]s.
#[async_trait]
pub trait RouterStateStore: Send + Sync {
    async fn save(&self, blob: &RouterStateBlob) -> Result<(), StateStoreError>;

    /// `Ok(None)` covers both "never saved" and "saved under a different
    /// schema version or dimension".
    async fn load(&self, d: usize) -> Result<Option<RouterStateBlob>, StateStoreError>;
}

// ── No-op store ─────────────────────────────────────────────────────────

/// Store that persists nothing. Used when no state path is configured.
#[derive(Debug, Default)]
pub struct NullStateStore;

#[async_trait]
impl RouterStateStore for NullStateStore {
    async fn save(&self, _blob: &RouterStateBlob) -> Result<(), StateStoreError> {
        Ok(())
    }

    async fn load(&self, _d: usize) -> Result<Option<RouterStateBlob>, StateStoreError> {
        Ok(None)
    }
}

// ── Local file store ────────────────────────────────────────────────────

/// Local-file backend with atomic writes (temp file in the same
/// directory, then rename).
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    path: PathBuf,
}

impl LocalFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[async_trait]
impl RouterStateStore for LocalFileStore {
    async fn save(&self, blob: &RouterStateBlob) -> Result<(), StateStoreError> {
        let raw = blob.encode()?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, raw.as_bytes())
            .await
            .map_err(|e| StateStoreError::Io(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StateStoreError::Io(format!("rename to {}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), "router state saved");
        Ok(())
    }

    async fn load(&self, d: usize) -> Result<Option<RouterStateBlob>, StateStoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateStoreError::Io(format!(
                    "read {}: {e}",
                    self.path.display()
                )))
            }
        };
        Ok(RouterStateBlob::decode_checked(&raw, d))
    }
}

// ── Redis store ─────────────────────────────────────────────────────────

/// Single-key Redis backend; the key is suffixed with the dimension so
/// differently-configured routers never read each other's state.
#[cfg(feature = "redis-backend")]
pub struct RedisStateStore {
    client: redis::Client,
    base_key: String,
}

#[cfg(feature = "redis-backend")]
impl RedisStateStore {
    pub fn new(redis_url: &str, base_key: impl Into<String>) -> Result<Self, StateStoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StateStoreError::Remote(e.to_string()))?;
        Ok(Self {
            client,
            base_key: base_key.into(),
        })
    }

    fn key(&self, d: usize) -> String {
        format!("{}:d{}", self.base_key, d)
    }
}

#[cfg(feature = "redis-backend")]
#[async_trait]
impl RouterStateStore for RedisStateStore {
    async fn save(&self, blob: &RouterStateBlob) -> Result<(), StateStoreError> {
        let raw = blob.encode()?;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StateStoreError::Remote(e.to_string()))?;
        redis::cmd("SET")
            .arg(self.key(blob.d))
            .arg(raw)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StateStoreError::Remote(e.to_string()))
    }

    async fn load(&self, d: usize) -> Result<Option<RouterStateBlob>, StateStoreError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StateStoreError::Remote(e.to_string()))?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(d))
            .query_async(&mut conn)
            .await
            .map_err(|e| StateStoreError::Remote(e.to_string()))?;
        Ok(raw.and_then(|r| RouterStateBlob::decode_checked(&r, d)))
    }
}

// ── Tiered store ────────────────────────────────────────────────────────

/// Fan-out over several backends: writes go to every backend, reads take
/// the first hit in order (construct with the remote store first to give
/// it read preference).
pub struct TieredStateStore {
    stores: Vec<Arc<dyn RouterStateStore>>,
}

impl TieredStateStore {
    pub fn new(stores: Vec<Arc<dyn RouterStateStore>>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl RouterStateStore for TieredStateStore {
    async fn save(&self, blob: &RouterStateBlob) -> Result<(), StateStoreError> {
        let mut last_err = None;
        let mut any_ok = false;
        for store in &self.stores {
            match store.save(blob).await {
                Ok(()) => any_ok = true,
                Err(e) => {
                    warn!(error = %e, "state backend save failed");
                    last_err = Some(e);
                }
            }
        }
        match (any_ok, last_err) {
            (true, _) | (false, None) => Ok(()),
            (false, Some(e)) => Err(e),
        }
    }

    async fn load(&self, d: usize) -> Result<Option<RouterStateBlob>, StateStoreError> {
        for store in &self.stores {
            match store.load(d).await {
                Ok(Some(blob)) => return Ok(Some(blob)),
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "state backend load failed, trying next");
                    continue;
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(version: u32, d: usize) -> RouterStateBlob {
        let mut arms = BTreeMap::new();
        arms.insert(
            "gpt-a".to_string(),
            ArmStateBlob {
                a_inv: vec![0.0; d * d],
                b: vec![0.0; d],
                trials: 3,
                wins: 1,
                active: true,
            },
        );
        RouterStateBlob {
            version,
            d,
            arms,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_decode_checked_roundtrip() {
        let original = blob(ROUTER_STATE_VERSION, 3);
        let raw = original.encode().expect("encode");
        let decoded = RouterStateBlob::decode_checked(&raw, 3).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_checked_rejects_version_mismatch() {
        let raw = blob(0, 3).encode().expect("encode");
        assert!(RouterStateBlob::decode_checked(&raw, 3).is_none());
    }

    #[test]
    fn test_decode_checked_rejects_dimension_mismatch() {
        let raw = blob(ROUTER_STATE_VERSION, 7).encode().expect("encode");
        assert!(RouterStateBlob::decode_checked(&raw, 5).is_none());
    }

    #[test]
    fn test_decode_checked_rejects_garbage() {
        assert!(RouterStateBlob::decode_checked("not json at all", 3).is_none());
    }

    #[test]
    fn test_decode_checked_drops_misshapen_arms() {
        let mut b = blob(ROUTER_STATE_VERSION, 3);
        b.arms.insert(
            "broken".to_string(),
            ArmStateBlob {
                a_inv: vec![0.0; 4], // wrong shape for d=3
                b: vec![0.0; 3],
                trials: 0,
                wins: 0,
                active: true,
            },
        );
        let raw = b.encode().expect("encode");
        let decoded = RouterStateBlob::decode_checked(&raw, 3).expect("decode");
        assert!(decoded.arms.contains_key("gpt-a"));
        assert!(!decoded.arms.contains_key("broken"));
    }

    #[tokio::test]
    async fn test_null_store_loads_nothing() {
        let store = NullStateStore;
        assert!(store.load(3).await.expect("load").is_none());
        assert!(store.save(&blob(ROUTER_STATE_VERSION, 3)).await.is_ok());
    }

    #[tokio::test]
    async fn test_local_file_store_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalFileStore::new(dir.path().join("router_state.json"));
        let b = blob(ROUTER_STATE_VERSION, 3);
        store.save(&b).await.expect("save");
        let loaded = store.load(3).await.expect("load").expect("present");
        assert_eq!(loaded, b);
    }

    #[tokio::test]
    async fn test_local_file_store_missing_file_is_cold_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalFileStore::new(dir.path().join("absent.json"));
        assert!(store.load(3).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn test_local_file_store_save_load_save_is_byte_stable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("router_state.json");
        let store = LocalFileStore::new(&path);
        store.save(&blob(ROUTER_STATE_VERSION, 3)).await.expect("save");
        let bytes1 = tokio::fs::read(&path).await.expect("read");
        let loaded = store.load(3).await.expect("load").expect("present");
        store.save(&loaded).await.expect("save again");
        let bytes2 = tokio::fs::read(&path).await.expect("read");
        assert_eq!(bytes1, bytes2);
    }

    #[tokio::test]
    async fn test_tiered_store_prefers_first_hit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = Arc::new(LocalFileStore::new(dir.path().join("first.json")));
        let second = Arc::new(LocalFileStore::new(dir.path().join("second.json")));

        let mut newer = blob(ROUTER_STATE_VERSION, 3);
        newer
            .arms
            .get_mut("gpt-a")
            .expect("arm present")
            .trials = 99;
        first.save(&newer).await.expect("save first");
        second
            .save(&blob(ROUTER_STATE_VERSION, 3))
            .await
            .expect("save second");

        let tiered = TieredStateStore::new(vec![first, second]);
        let loaded = tiered.load(3).await.expect("load").expect("present");
        assert_eq!(loaded.arms["gpt-a"].trials, 99);
    }

    #[tokio::test]
    async fn test_tiered_store_falls_back_when_first_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let empty = Arc::new(LocalFileStore::new(dir.path().join("empty.json")));
        let filled = Arc::new(LocalFileStore::new(dir.path().join("filled.json")));
        filled
            .save(&blob(ROUTER_STATE_VERSION, 3))
            .await
            .expect("save");

        let tiered = TieredStateStore::new(vec![empty, filled]);
        assert!(tiered.load(3).await.expect("load").is_some());
    }
}
