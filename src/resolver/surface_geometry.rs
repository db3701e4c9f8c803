//! Geometry XLinks: the referenced subtree is rebuilt from its flat rows and
//! deep-copied under the referencing parent.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{BatchBuffer, Reference, Resolution, ResolverManager, XlinkResolver};
use crate::cache::LookupKind;
use crate::error::Result;
use crate::geometry::{GeometryTree, PolygonPayload};
use crate::models::{xlink_flag, PendingReference, SurfaceGeometryXlink, XlinkKind};
use crate::storage::{Sequence, SqliteStorage, SurfaceGeometryInsert};

/// Rows of one deep copy, parent before child, and the original to flag.
struct GeometryCopy {
    rows: Vec<SurfaceGeometryInsert>,
    referenced: Option<i64>,
}

pub struct SurfaceGeometryResolver {
    storage: SqliteStorage,
    write_lock: Arc<Mutex<()>>,
    batch: BatchBuffer<GeometryCopy>,
    /// Originals already flagged (or queued for flagging) during this run.
    referenced: Mutex<HashSet<i64>>,
    copied_rows: AtomicU64,
    flagged: AtomicU64,
}

impl SurfaceGeometryResolver {
    pub fn new(storage: SqliteStorage, write_lock: Arc<Mutex<()>>, batch_size: usize) -> Self {
        Self {
            storage,
            write_lock,
            batch: BatchBuffer::new(batch_size),
            referenced: Mutex::new(HashSet::new()),
            copied_rows: AtomicU64::new(0),
            flagged: AtomicU64::new(0),
        }
    }

    /// `(copied rows, originals flagged as referenced)` written so far.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.copied_rows.load(Ordering::Relaxed),
            self.flagged.load(Ordering::Relaxed),
        )
    }

    pub async fn resolve(
        &self,
        xlink: &SurfaceGeometryXlink,
        manager: &ResolverManager,
    ) -> Result<Resolution> {
        let Reference::Local(gmlid) = Reference::parse(&xlink.gmlid) else {
            return Ok(Resolution::Skipped(format!(
                "remote reference '{}'",
                xlink.gmlid
            )));
        };

        let Some(target) = manager
            .identifiers()
            .resolve(gmlid, LookupKind::Geometry, false)
            .await?
        else {
            return Ok(Resolution::Unresolved);
        };
        let reverse = target.reverse ^ xlink.reverse;

        let rows = self.storage.load_geometry_tree(target.root_id).await?;
        if rows.is_empty() {
            return Ok(Resolution::Unresolved);
        }
        let tree = match GeometryTree::build(rows) {
            Ok(tree) => tree,
            Err(e) => {
                return Ok(Resolution::Skipped(format!(
                    "geometry tree {} is inconsistent: {}",
                    target.root_id, e
                )))
            }
        };

        // Aliases resolve to a different gml:id, so the resolved row id wins
        let Some(located) = tree
            .get(target.id)
            .or_else(|| tree.find_by_gmlid(gmlid))
        else {
            return Ok(Resolution::Skipped(format!(
                "'{}' is not part of geometry tree {}",
                gmlid, target.root_id
            )));
        };
        let located_id = located.id;
        let subtree = tree.subtree_ids(located_id);

        // The subtree is still being extended by another pending reference
        if self
            .storage
            .has_pending_geometry_children(&subtree, xlink.pass)
            .await?
        {
            manager
                .enqueue(PendingReference::SurfaceGeometry(xlink.clone()))
                .await?;
            return Ok(Resolution::Deferred);
        }

        let geometry_type = match tree.classify_subtree(located_id) {
            Ok(geometry_type) => geometry_type,
            Err(e) => {
                return Ok(Resolution::Skipped(format!(
                    "cannot classify '{}': {}",
                    gmlid, e
                )))
            }
        };
        tracing::debug!(
            "Copying {:?} '{}' ({} nodes) to {} (reverse: {})",
            geometry_type,
            gmlid,
            subtree.len(),
            xlink.id,
            reverse
        );

        let copy_root_id = if xlink.root_id == 0 { xlink.id } else { xlink.root_id };
        let copy_parent_id = (xlink.parent_id != 0).then_some(xlink.parent_id);

        let mut new_ids: HashMap<i64, i64> = HashMap::with_capacity(subtree.len());
        let mut rows = Vec::with_capacity(subtree.len());
        for original_id in &subtree {
            let Some(node) = tree.get(*original_id) else {
                continue;
            };

            let (id, parent_id) = if *original_id == located_id {
                (xlink.id, copy_parent_id)
            } else {
                let parent_id = node.parent_id.and_then(|p| new_ids.get(&p).copied());
                (manager.allocate_id(Sequence::SurfaceGeometry).await?, parent_id)
            };
            new_ids.insert(*original_id, id);

            let geometry = match (&node.geometry, reverse) {
                (Some(bytes), true) => match reverse_payload(bytes) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        return Ok(Resolution::Skipped(format!(
                            "polygon {} cannot be reversed: {}",
                            original_id, e
                        )))
                    }
                },
                (geometry, _) => geometry.clone(),
            };

            rows.push(SurfaceGeometryInsert {
                id,
                gmlid: node.gmlid.clone(),
                parent_id,
                root_id: copy_root_id,
                is_solid: node.is_solid,
                is_composite: node.is_composite,
                is_triangulated: node.is_triangulated,
                is_xlink: xlink_flag::COPY,
                is_reverse: node.is_reverse ^ reverse,
                geometry,
                cityobject_id: xlink.cityobject_id,
            });
        }

        let referenced = {
            let mut flagged = self.referenced.lock().await;
            (located.is_xlink == xlink_flag::ORIGINAL && flagged.insert(located_id))
                .then_some(located_id)
        };

        if self.batch.push(GeometryCopy { rows, referenced }).await {
            self.flush().await?;
        }
        Ok(Resolution::Resolved)
    }
}

fn reverse_payload(bytes: &[u8]) -> std::result::Result<Vec<u8>, crate::geometry::CodecError> {
    PolygonPayload::decode(bytes)?.reversed().encode()
}

#[async_trait::async_trait]
impl XlinkResolver for SurfaceGeometryResolver {
    fn kind(&self) -> XlinkKind {
        XlinkKind::SurfaceGeometry
    }

    async fn flush(&self) -> Result<()> {
        let copies = self.batch.take().await;
        if copies.is_empty() {
            return Ok(());
        }

        let mut rows = Vec::new();
        let mut referenced = Vec::new();
        for copy in copies {
            rows.extend(copy.rows);
            referenced.extend(copy.referenced);
        }

        let _guard = self.write_lock.lock().await;
        let flagged = self.storage.write_geometry_batch(&rows, &referenced).await?;
        self.copied_rows
            .fetch_add(rows.len() as u64, Ordering::Relaxed);
        self.flagged.fetch_add(flagged, Ordering::Relaxed);
        tracing::debug!(
            "Flushed {} copied geometry rows, {} originals flagged",
            rows.len(),
            flagged
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.flush().await?;
        let (copied, flagged) = self.stats();
        tracing::info!(
            "Geometry references: {} rows copied, {} originals referenced",
            copied,
            flagged
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntry, IdentifierCache, MemoryIdentifierCache};
    use crate::models::SurfaceGeometryRow;
    use crate::test_support::{
        insert_geometry, node, pending_geometry, test_manager_with_cache, test_storage,
    };

    fn polygon(srid: i32) -> Vec<u8> {
        let ring = vec![
            0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0,
        ];
        PolygonPayload::new(srid, 3, vec![ring])
            .unwrap()
            .encode()
            .unwrap()
    }

    /// root(1) -> composite(2) -> polygons(3, 4)
    async fn seed_three_levels(storage: &SqliteStorage) {
        let mut root = node(1, Some("root"), None, 1);
        root.is_solid = true;
        let mut shell = node(2, Some("shell"), Some(1), 1);
        shell.is_composite = true;
        let mut left = node(3, Some("left"), Some(2), 1);
        left.geometry = Some(polygon(0));
        let mut right = node(4, Some("right"), Some(2), 1);
        right.geometry = Some(polygon(0));
        right.is_reverse = true;
        for row in [root, shell, left, right] {
            insert_geometry(storage, &row).await;
        }
    }

    async fn cache_with(
        gmlid: &str,
        id: i64,
        root_id: i64,
        reverse: bool,
    ) -> Arc<MemoryIdentifierCache> {
        let cache = Arc::new(MemoryIdentifierCache::new());
        cache
            .put(
                gmlid,
                LookupKind::Geometry,
                CacheEntry::Resolved {
                    id,
                    root_id,
                    reverse,
                    object_class: crate::models::object_class::SURFACE_GEOMETRY,
                },
            )
            .await
            .unwrap();
        cache
    }

    fn xlink(pending: PendingReference) -> SurfaceGeometryXlink {
        match pending {
            PendingReference::SurfaceGeometry(x) => x,
            other => panic!("unexpected {:?}", other),
        }
    }

    async fn copies_of(storage: &SqliteStorage, root_id: i64) -> Vec<SurfaceGeometryRow> {
        let mut rows = storage.load_geometry_tree(root_id).await.unwrap();
        rows.sort_by_key(|r| r.id);
        rows
    }

    #[tokio::test]
    async fn test_deep_copy_structure() {
        let (storage, _temp) = test_storage().await;
        seed_three_levels(&storage).await;
        // Forward-pass ids of the referencing rows are taken into account by the sequence
        for id in [100, 200] {
            storage.push_pending(&pending_geometry(id, 0, 0, "#root")).await.unwrap();
        }
        let cache = cache_with("root", 1, 1, false).await;
        let manager = test_manager_with_cache(storage.clone(), cache).await;
        let resolver = manager.surface_geometry().await;

        let first = xlink(pending_geometry(100, 0, 0, "#root"));
        assert_eq!(resolver.resolve(&first, &manager).await.unwrap(), Resolution::Resolved);
        manager.flush().await.unwrap();

        let copy = copies_of(&storage, 100).await;
        assert_eq!(copy.len(), 4);
        let ids: Vec<i64> = copy.iter().map(|r| r.id).collect();
        assert_eq!(ids[0], 100);
        assert!(ids[1..].iter().all(|id| *id > 100));

        let originals = copies_of(&storage, 1).await;
        for (orig, new) in originals.iter().zip(copy.iter()) {
            assert_eq!(orig.gmlid, new.gmlid);
            assert_eq!(
                (orig.is_solid, orig.is_composite, orig.is_triangulated, orig.is_reverse),
                (new.is_solid, new.is_composite, new.is_triangulated, new.is_reverse)
            );
            assert_eq!(orig.geometry, new.geometry);
            assert_eq!(new.is_xlink, xlink_flag::COPY);
        }

        // Every child points at a copied parent with a smaller id
        for row in &copy[1..] {
            let parent = row.parent_id.unwrap();
            assert!(parent < row.id);
            assert!(ids.contains(&parent));
        }
        assert_eq!(copy[0].parent_id, None);

        // Copying the same geometry again flags the original only once
        let second = xlink(pending_geometry(200, 0, 0, "#root"));
        assert_eq!(resolver.resolve(&second, &manager).await.unwrap(), Resolution::Resolved);
        manager.flush().await.unwrap();
        assert_eq!(copies_of(&storage, 200).await.len(), 4);
        assert_eq!(resolver.stats(), (8, 1));

        let original = storage.get_geometry(1).await.unwrap().unwrap();
        assert_eq!(original.is_xlink, xlink_flag::REFERENCED);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reversed_copy_under_parent() {
        let (storage, _temp) = test_storage().await;
        seed_three_levels(&storage).await;
        insert_geometry(&storage, &node(50, Some("target_root"), None, 50)).await;
        storage.push_pending(&pending_geometry(60, 50, 50, "shell")).await.unwrap();

        // Cached orientation and pending orientation compose
        let cache = cache_with("shell", 2, 1, true).await;
        let manager = test_manager_with_cache(storage.clone(), cache).await;
        let resolver = manager.surface_geometry().await;

        let mut pending = xlink(pending_geometry(60, 50, 50, "shell"));
        pending.reverse = false;
        assert_eq!(resolver.resolve(&pending, &manager).await.unwrap(), Resolution::Resolved);
        manager.flush().await.unwrap();

        let copy: Vec<_> = copies_of(&storage, 50)
            .await
            .into_iter()
            .filter(|r| r.id != 50)
            .collect();
        assert_eq!(copy.len(), 3);
        assert_eq!(copy[0].id, 60);
        assert_eq!(copy[0].parent_id, Some(50));

        let left = copy.iter().find(|r| r.gmlid.as_deref() == Some("left")).unwrap();
        let right = copy.iter().find(|r| r.gmlid.as_deref() == Some("right")).unwrap();
        assert!(left.is_reverse);
        assert!(!right.is_reverse);

        let original = PolygonPayload::decode(&polygon(0)).unwrap();
        let reversed = PolygonPayload::decode(left.geometry.as_ref().unwrap()).unwrap();
        assert_eq!(reversed, original.reversed());

        // The located node is flagged, not the tree root
        let located = storage.get_geometry(2).await.unwrap().unwrap();
        assert_eq!(located.is_xlink, xlink_flag::REFERENCED);
        let root = storage.get_geometry(1).await.unwrap().unwrap();
        assert_eq!(root.is_xlink, xlink_flag::ORIGINAL);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_child_defers_copy() {
        let (storage, _temp) = test_storage().await;
        seed_three_levels(&storage).await;
        // Another reference still wants to attach below the shell
        storage.push_pending(&pending_geometry(300, 2, 1, "elsewhere")).await.unwrap();

        let cache = cache_with("root", 1, 1, false).await;
        let manager = test_manager_with_cache(storage.clone(), cache).await;
        let resolver = manager.surface_geometry().await;

        let pending = xlink(pending_geometry(100, 0, 0, "root"));
        assert_eq!(resolver.resolve(&pending, &manager).await.unwrap(), Resolution::Deferred);
        manager.await_requeued().await;
        assert_eq!(storage.count_pending(XlinkKind::SurfaceGeometry, 1).await.unwrap(), 1);
        manager.flush().await.unwrap();
        assert!(copies_of(&storage, 100).await.is_empty());
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unresolvable_and_undefined() {
        let (storage, _temp) = test_storage().await;
        // Composite with an empty child cannot be classified
        let mut root = node(1, Some("broken"), None, 1);
        root.is_composite = true;
        insert_geometry(&storage, &root).await;
        insert_geometry(&storage, &node(2, None, Some(1), 1)).await;

        let cache = cache_with("broken", 1, 1, false).await;
        let manager = test_manager_with_cache(storage.clone(), cache).await;
        let resolver = manager.surface_geometry().await;

        let broken = xlink(pending_geometry(100, 0, 0, "broken"));
        assert!(matches!(
            resolver.resolve(&broken, &manager).await.unwrap(),
            Resolution::Skipped(_)
        ));

        let unknown = xlink(pending_geometry(101, 0, 0, "unknown"));
        assert_eq!(resolver.resolve(&unknown, &manager).await.unwrap(), Resolution::Unresolved);

        let remote = xlink(pending_geometry(102, 0, 0, "other.gml#broken"));
        assert!(matches!(
            resolver.resolve(&remote, &manager).await.unwrap(),
            Resolution::Skipped(_)
        ));
        manager.close().await.unwrap();
    }
}
