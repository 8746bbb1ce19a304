//! Component I: named KV stores with async lookup/insert/delete/list
//! (§3 "KV types", §4.I).
//!
//! The on-disk format of KV data is explicitly out of scope (§1);
//! `MemoryKvStore` is the in-process reference implementation used by
//! tests and the CLI demo, analogous to `DefaultBackend` and
//! `NullGeoLookup` standing in for other injected capabilities.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::XqdError;
use crate::memory::MemoryView;

#[derive(Debug, Clone)]
pub struct KvLookupResult {
    pub body: Vec<u8>,
    pub metadata: Vec<u8>,
    pub generation: u64,
}

#[derive(Debug, Clone, Default)]
pub struct KvInsertConfig {
    pub mode: u32,
    pub metadata: Option<Vec<u8>>,
    pub ttl_secs: Option<u32>,
    pub if_generation_match: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct KvListConfig {
    pub limit: Option<u32>,
    pub prefix: Option<String>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KvListResult {
    pub keys: Vec<String>,
    pub cursor: Option<String>,
}

/// A single named store. `async-trait` makes this object-safe so the
/// registry can hold a `HashMap<String, Arc<dyn KvStore>>`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<Option<KvLookupResult>, XqdError>;
    async fn insert(&self, key: &str, body: Vec<u8>, cfg: KvInsertConfig) -> Result<u64, XqdError>;
    async fn delete(&self, key: &str) -> Result<(), XqdError>;
    async fn list(&self, cfg: KvListConfig) -> Result<KvListResult, XqdError>;
}

#[derive(Clone)]
struct StoredValue {
    body: Vec<u8>,
    metadata: Vec<u8>,
    generation: u64,
}

#[derive(Default)]
pub struct MemoryKvStore {
    data: RwLock<HashMap<String, StoredValue>>,
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn lookup(&self, key: &str) -> Result<Option<KvLookupResult>, XqdError> {
        let data = self.data.read().unwrap();
        Ok(data.get(key).map(|v| KvLookupResult {
            body: v.body.clone(),
            metadata: v.metadata.clone(),
            generation: v.generation,
        }))
    }

    async fn insert(&self, key: &str, body: Vec<u8>, cfg: KvInsertConfig) -> Result<u64, XqdError> {
        let mut data = self.data.write().unwrap();
        let next_generation = data.get(key).map(|v| v.generation + 1).unwrap_or(0);
        if let Some(expected) = cfg.if_generation_match {
            let current = data.get(key).map(|v| v.generation);
            if current != Some(expected) {
                return Err(XqdError::InvalidArgument(
                    "generation mismatch".to_string(),
                ));
            }
        }
        data.insert(
            key.to_string(),
            StoredValue {
                body,
                metadata: cfg.metadata.unwrap_or_default(),
                generation: next_generation,
            },
        );
        Ok(next_generation)
    }

    async fn delete(&self, key: &str) -> Result<(), XqdError> {
        self.data.write().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self, cfg: KvListConfig) -> Result<KvListResult, XqdError> {
        let data = self.data.read().unwrap();
        let mut keys: Vec<String> = data
            .keys()
            .filter(|k| cfg.prefix.as_deref().map(|p| k.starts_with(p)).unwrap_or(true))
            .cloned()
            .collect();
        keys.sort();
        if let Some(cursor) = &cfg.cursor {
            if let Some(pos) = keys.iter().position(|k| k == cursor) {
                keys = keys.split_off(pos + 1);
            }
        }
        let mut next_cursor = None;
        if let Some(limit) = cfg.limit {
            if keys.len() > limit as usize {
                next_cursor = keys.get(limit as usize - 1).cloned();
                keys.truncate(limit as usize);
            }
        }
        Ok(KvListResult {
            keys,
            cursor: next_cursor,
        })
    }
}

/// Process-wide registry of named KV stores (§3 "shares... KV
/// stores").
#[derive(Default)]
pub struct KvStoreRegistry {
    stores: HashMap<String, std::sync::Arc<dyn KvStore>>,
}

impl KvStoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, store: std::sync::Arc<dyn KvStore>) {
        self.stores.insert(name.into(), store);
    }

    /// `kv_store_open`: absence is not an error (§4.I: "deliberate:
    /// absence is not an error").
    pub fn open(&self, name: &str) -> Option<std::sync::Arc<dyn KvStore>> {
        self.stores.get(name).cloned()
    }
}

/// Key validation policy (§4.I: "reject empty/over-long/illegal
/// chars").
pub const MAX_KEY_LEN: usize = 1024;

pub fn validate_key(key: &str) -> Result<(), XqdError> {
    if key.is_empty() {
        return Err(XqdError::InvalidArgument("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(XqdError::InvalidArgument(format!(
            "key exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    if key == "." || key == ".." || key.contains(['\r', '\n', '\0']) {
        return Err(XqdError::InvalidArgument(format!(
            "key contains illegal characters: {key:?}"
        )));
    }
    Ok(())
}

pub mod insert_mask_bits {
    pub const METADATA: u32 = 1 << 3;
    pub const TTL: u32 = 1 << 4;
    pub const IF_GENERATION_MATCH: u32 = 1 << 5;
}

/// Parses the insert config struct (§4.I: "mode (u32 at +0), unused
/// (u32 at +4), metadata ptr+len (bit 3, +8/+12), TTL seconds (bit 4,
/// +16), if-generation-match (bit 5, u64 at +20)").
pub fn read_insert_config(
    memory: &dyn MemoryView,
    ptr: u32,
    mask: u32,
) -> Result<KvInsertConfig, XqdError> {
    let mode = memory.read_u32(ptr)?;
    let mut cfg = KvInsertConfig {
        mode,
        ..Default::default()
    };
    if mask & insert_mask_bits::METADATA != 0 {
        let meta_ptr = memory.read_u32(ptr + 8)?;
        let meta_len = memory.read_u32(ptr + 12)?;
        cfg.metadata = Some(memory.read_bytes(meta_ptr, meta_len)?);
    }
    if mask & insert_mask_bits::TTL != 0 {
        cfg.ttl_secs = Some(memory.read_u32(ptr + 16)?);
    }
    if mask & insert_mask_bits::IF_GENERATION_MATCH != 0 {
        cfg.if_generation_match = Some(memory.read_u64(ptr + 20)?);
    }
    Ok(cfg)
}

pub mod list_mask_bits {
    pub const LIMIT: u32 = 1 << 0;
    pub const PREFIX: u32 = 1 << 1;
    pub const CURSOR: u32 = 1 << 2;
}

/// Parses the list config struct. Each optional field appears, in mask
/// order, at the next free offset (§4.I).
pub fn read_list_config(
    memory: &dyn MemoryView,
    ptr: u32,
    mask: u32,
) -> Result<KvListConfig, XqdError> {
    let mut cfg = KvListConfig::default();
    let mut off = ptr;
    if mask & list_mask_bits::LIMIT != 0 {
        cfg.limit = Some(memory.read_u32(off)?);
        off += 4;
    }
    if mask & list_mask_bits::PREFIX != 0 {
        let p = memory.read_u32(off)?;
        let l = memory.read_u32(off + 4)?;
        cfg.prefix = Some(memory.read_string(p, l)?);
        off += 8;
    }
    if mask & list_mask_bits::CURSOR != 0 {
        let p = memory.read_u32(off)?;
        let l = memory.read_u32(off + 4)?;
        cfg.cursor = Some(memory.read_string(p, l)?);
        off += 8;
    }
    let _ = off;
    Ok(cfg)
}

/// Outcome of an async KV lookup (§4.I "write body handle ... or
/// HandleInvalid on miss; write metadata ...; write generation; write an
/// error code (0 on success, 1 on unknown error)").
#[derive(Debug, Clone)]
pub struct KvLookupOutcome {
    pub found: Option<KvLookupResult>,
    pub error: u32,
}

#[derive(Debug, Clone)]
pub struct KvInsertOutcome {
    pub generation: u64,
    pub error: u32,
}

#[derive(Debug, Clone)]
pub struct KvDeleteOutcome {
    pub error: u32,
}

#[derive(Debug, Clone)]
pub struct KvListOutcome {
    pub result: Option<KvListResult>,
    pub error: u32,
}

/// Spawns the async lookup and completes `out` with the result
/// (§4.I: "spawn an async lookup; return a lookup handle").
pub fn spawn_lookup(
    store: std::sync::Arc<dyn KvStore>,
    key: String,
    out: std::sync::Arc<crate::oneshot::OneShot<KvLookupOutcome>>,
) {
    tokio::spawn(async move {
        let outcome = match store.lookup(&key).await {
            Ok(found) => KvLookupOutcome { found, error: 0 },
            Err(_) => KvLookupOutcome {
                found: None,
                error: 1,
            },
        };
        out.complete(outcome);
    });
}

pub fn spawn_insert(
    store: std::sync::Arc<dyn KvStore>,
    key: String,
    body: Vec<u8>,
    cfg: KvInsertConfig,
    out: std::sync::Arc<crate::oneshot::OneShot<KvInsertOutcome>>,
) {
    tokio::spawn(async move {
        let outcome = match store.insert(&key, body, cfg).await {
            Ok(generation) => KvInsertOutcome { generation, error: 0 },
            Err(_) => KvInsertOutcome {
                generation: 0,
                error: 1,
            },
        };
        out.complete(outcome);
    });
}

pub fn spawn_delete(
    store: std::sync::Arc<dyn KvStore>,
    key: String,
    out: std::sync::Arc<crate::oneshot::OneShot<KvDeleteOutcome>>,
) {
    tokio::spawn(async move {
        let error = match store.delete(&key).await {
            Ok(()) => 0,
            Err(_) => 1,
        };
        out.complete(KvDeleteOutcome { error });
    });
}

pub fn spawn_list(
    store: std::sync::Arc<dyn KvStore>,
    cfg: KvListConfig,
    out: std::sync::Arc<crate::oneshot::OneShot<KvListOutcome>>,
) {
    tokio::spawn(async move {
        let outcome = match store.list(cfg).await {
            Ok(result) => KvListOutcome {
                result: Some(result),
                error: 0,
            },
            Err(_) => KvListOutcome {
                result: None,
                error: 1,
            },
        };
        out.complete(outcome);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_lookup_roundtrips() {
        let store = MemoryKvStore::default();
        let gen0 = store
            .insert("k", b"v1".to_vec(), KvInsertConfig::default())
            .await
            .unwrap();
        assert_eq!(gen0, 0);
        let found = store.lookup("k").await.unwrap().unwrap();
        assert_eq!(found.body, b"v1");
        assert_eq!(found.generation, 0);

        let gen1 = store
            .insert("k", b"v2".to_vec(), KvInsertConfig::default())
            .await
            .unwrap();
        assert_eq!(gen1, 1);
    }

    #[tokio::test]
    async fn cas_rejects_stale_generation() {
        let store = MemoryKvStore::default();
        store
            .insert("k", b"v1".to_vec(), KvInsertConfig::default())
            .await
            .unwrap();
        let err = store
            .insert(
                "k",
                b"v2".to_vec(),
                KvInsertConfig {
                    if_generation_match: Some(99),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, XqdError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn list_respects_prefix_and_limit() {
        let store = MemoryKvStore::default();
        for k in ["a/1", "a/2", "a/3", "b/1"] {
            store
                .insert(k, b"x".to_vec(), KvInsertConfig::default())
                .await
                .unwrap();
        }
        let result = store
            .list(KvListConfig {
                limit: Some(2),
                prefix: Some("a/".to_string()),
                cursor: None,
            })
            .await
            .unwrap();
        assert_eq!(result.keys, vec!["a/1".to_string(), "a/2".to_string()]);
        assert!(result.cursor.is_some());
    }

    #[tokio::test]
    async fn spawn_lookup_completes_the_oneshot() {
        use std::sync::Arc;
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::default());
        store
            .insert("k", b"v".to_vec(), KvInsertConfig::default())
            .await
            .unwrap();
        let out = Arc::new(crate::oneshot::OneShot::new());
        spawn_lookup(store, "k".to_string(), out.clone());
        let outcome = out.wait().await;
        assert_eq!(outcome.error, 0);
        assert_eq!(outcome.found.unwrap().body, b"v");
    }

    #[test]
    fn key_validation_rejects_empty_and_long() {
        assert!(validate_key("ok").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key(&"x".repeat(MAX_KEY_LEN + 1)).is_err());
    }
}
