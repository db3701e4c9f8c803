//! Identifier cache: gml:id → store id, or an indirection to another gml:id.
//!
//! The durable side lives in the `gmlid_cache` table written by the forward
//! import pass; a size-bounded LRU keeps hot entries in memory.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::storage::{CacheRow, SqliteStorage};

/// Namespace an identifier is looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupKind {
    Feature,
    Geometry,
    SurfaceData,
    TextureAssociation,
}

impl LookupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupKind::Feature => "feature",
            LookupKind::Geometry => "geometry",
            LookupKind::SurfaceData => "surface_data",
            LookupKind::TextureAssociation => "texture_association",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheEntry {
    Resolved {
        id: i64,
        root_id: i64,
        reverse: bool,
        object_class: i32,
    },
    /// Points at another reference; `reverse` composes with the target's.
    Indirection {
        mapping: String,
        reverse: bool,
        root_id: Option<i64>,
    },
}

impl CacheEntry {
    fn size_bytes(&self, gmlid: &str) -> usize {
        let payload = match self {
            CacheEntry::Resolved { .. } => 0,
            CacheEntry::Indirection { mapping, .. } => mapping.len(),
        };
        gmlid.len() + payload + std::mem::size_of::<CacheEntry>()
    }

    fn from_row(row: CacheRow) -> Self {
        match row.mapping {
            Some(mapping) => CacheEntry::Indirection {
                mapping,
                reverse: row.reverse,
                root_id: (row.root_id > 0).then_some(row.root_id),
            },
            None => CacheEntry::Resolved {
                id: row.id,
                root_id: row.root_id,
                reverse: row.reverse,
                object_class: row.object_class,
            },
        }
    }

    fn to_row(&self, gmlid: &str, kind: LookupKind) -> CacheRow {
        match self {
            CacheEntry::Resolved {
                id,
                root_id,
                reverse,
                object_class,
            } => CacheRow {
                gmlid: gmlid.to_string(),
                kind: kind.as_str().to_string(),
                id: *id,
                root_id: *root_id,
                reverse: *reverse,
                object_class: *object_class,
                mapping: None,
            },
            CacheEntry::Indirection {
                mapping,
                reverse,
                root_id,
            } => CacheRow {
                gmlid: gmlid.to_string(),
                kind: kind.as_str().to_string(),
                id: 0,
                root_id: root_id.unwrap_or(0),
                reverse: *reverse,
                object_class: 0,
                mapping: Some(mapping.clone()),
            },
        }
    }
}

/// Lookup service consulted by the reference resolver. Implementations are
/// internally synchronised.
#[async_trait::async_trait]
pub trait IdentifierCache: Send + Sync {
    async fn get(&self, gmlid: &str, kind: LookupKind) -> Result<Option<CacheEntry>>;

    async fn put(&self, gmlid: &str, kind: LookupKind, entry: CacheEntry) -> Result<()>;
}

/// In-process cache without persistence.
#[derive(Default)]
pub struct MemoryIdentifierCache {
    entries: RwLock<HashMap<(String, LookupKind), CacheEntry>>,
}

impl MemoryIdentifierCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    #[cfg(test)]
    pub async fn remove(&self, gmlid: &str, kind: LookupKind) -> Option<CacheEntry> {
        self.entries
            .write()
            .await
            .remove(&(gmlid.to_string(), kind))
    }
}

#[async_trait::async_trait]
impl IdentifierCache for MemoryIdentifierCache {
    async fn get(&self, gmlid: &str, kind: LookupKind) -> Result<Option<CacheEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(gmlid.to_string(), kind))
            .cloned())
    }

    async fn put(&self, gmlid: &str, kind: LookupKind, entry: CacheEntry) -> Result<()> {
        self.entries
            .write()
            .await
            .insert((gmlid.to_string(), kind), entry);
        Ok(())
    }
}

/// `gmlid_cache` table fronted by a byte-bounded LRU. Misses are not cached,
/// since a later pass may find the entry.
pub struct SqliteIdentifierCache {
    storage: SqliteStorage,
    hot: RwLock<LruCache<(SmolStr, LookupKind), CacheEntry>>,
}

impl SqliteIdentifierCache {
    pub fn new(storage: SqliteStorage, capacity_bytes: usize) -> Self {
        Self {
            storage,
            hot: RwLock::new(LruCache::new(capacity_bytes)),
        }
    }

    #[cfg(test)]
    pub async fn hot_entries(&self) -> usize {
        self.hot.read().await.len()
    }
}

#[async_trait::async_trait]
impl IdentifierCache for SqliteIdentifierCache {
    async fn get(&self, gmlid: &str, kind: LookupKind) -> Result<Option<CacheEntry>> {
        let key = (SmolStr::new(gmlid), kind);
        if let Some(entry) = self.hot.write().await.get(&key) {
            return Ok(Some(entry));
        }

        let Some(row) = self.storage.get_cache_row(gmlid, kind.as_str()).await? else {
            return Ok(None);
        };
        let entry = CacheEntry::from_row(row);
        let size = entry.size_bytes(gmlid);
        self.hot.write().await.put(key, entry.clone(), size);
        Ok(Some(entry))
    }

    async fn put(&self, gmlid: &str, kind: LookupKind, entry: CacheEntry) -> Result<()> {
        self.storage.put_cache_row(&entry.to_row(gmlid, kind)).await?;
        let size = entry.size_bytes(gmlid);
        self.hot
            .write()
            .await
            .put((SmolStr::new(gmlid), kind), entry, size);
        Ok(())
    }
}

/// LRU cache with size-based eviction
pub struct LruCache<K: Hash + Eq + Clone, V: Clone> {
    capacity_bytes: usize,
    cache: HashMap<K, LruEntry<V>>,
    order: VecDeque<K>,
    current_size: usize,
}

#[derive(Clone)]
struct LruEntry<V> {
    value: V,
    size_bytes: usize,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            cache: HashMap::new(),
            order: VecDeque::new(),
            current_size: 0,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        if let Some(entry) = self.cache.get(key) {
            let value = entry.value.clone();
            self.move_to_front(key);
            Some(value)
        } else {
            None
        }
    }

    pub fn put(&mut self, key: K, value: V, size_bytes: usize) {
        // Remove old entry if exists
        self.remove(&key);

        // Don't cache if single item is larger than capacity
        if size_bytes > self.capacity_bytes {
            return;
        }

        while self.current_size + size_bytes > self.capacity_bytes && !self.cache.is_empty() {
            self.evict_lru();
        }

        self.cache.insert(key.clone(), LruEntry { value, size_bytes });
        self.order.push_front(key);
        self.current_size += size_bytes;
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        if let Some(entry) = self.cache.remove(key) {
            self.current_size = self.current_size.saturating_sub(entry.size_bytes);
            self.order.retain(|k| k != key);
            Some(entry.value)
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    #[cfg(test)]
    pub fn current_size_bytes(&self) -> usize {
        self.current_size
    }

    fn evict_lru(&mut self) {
        if let Some(key) = self.order.pop_back() {
            if let Some(entry) = self.cache.remove(&key) {
                self.current_size = self.current_size.saturating_sub(entry.size_bytes);
            }
        }
    }

    fn move_to_front(&mut self, key: &K) {
        self.order.retain(|k| k != key);
        self.order.push_front(key.clone());
    }
}
