//! Fixtures shared by the unit tests.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use crate::cache::{IdentifierCache, MemoryIdentifierCache};
use crate::config::ResolverConfig;
use crate::events::EventSink;
use crate::models::{
    object_class, xlink_flag, GroupXlink, PendingReference, SurfaceGeometryRow,
    SurfaceGeometryXlink,
};
use crate::pool::ErrorSlot;
use crate::resolver::{IdentifierResolver, ResolverManager};
use crate::storage::SqliteStorage;

/// Migrated store in a fresh temp directory; keep the TempDir alive.
pub async fn test_storage() -> (SqliteStorage, TempDir) {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("citydb.sqlite");
    let storage = SqliteStorage::connect(path.to_str().unwrap(), 4).await.unwrap();
    storage.migrate().await.unwrap();
    (storage, temp)
}

pub async fn test_manager(storage: SqliteStorage) -> ResolverManager {
    test_manager_with_cache(storage, Arc::new(MemoryIdentifierCache::new())).await
}

pub async fn test_manager_with_cache(
    storage: SqliteStorage,
    cache: Arc<dyn IdentifierCache>,
) -> ResolverManager {
    build_manager(storage, cache, ResolverConfig::default()).await
}

/// Manager whose relative file references resolve against `import_dir`.
pub async fn test_manager_in(storage: SqliteStorage, import_dir: &Path) -> ResolverManager {
    let config = ResolverConfig {
        import_dir: Some(import_dir.to_path_buf()),
        srid: 25832,
        ..ResolverConfig::default()
    };
    build_manager(storage, Arc::new(MemoryIdentifierCache::new()), config).await
}

async fn build_manager(
    storage: SqliteStorage,
    cache: Arc<dyn IdentifierCache>,
    config: ResolverConfig,
) -> ResolverManager {
    let identifiers = Arc::new(IdentifierResolver::new(
        cache,
        storage.clone(),
        config.max_indirection_depth,
    ));
    ResolverManager::new(
        storage,
        identifiers,
        config,
        EventSink::default(),
        ErrorSlot::new(),
    )
    .await
    .unwrap()
}

pub async fn insert_cityobject(storage: &SqliteStorage, id: i64, gmlid: &str, objectclass_id: i32) {
    sqlx::query("INSERT INTO cityobject (id, objectclass_id, gmlid) VALUES (?, ?, ?)")
        .bind(id)
        .bind(objectclass_id)
        .bind(gmlid)
        .execute(storage.pool())
        .await
        .unwrap();
}

pub async fn insert_group(storage: &SqliteStorage, id: i64, gmlid: &str) {
    insert_cityobject(storage, id, gmlid, object_class::CITY_OBJECT_GROUP).await;
    sqlx::query("INSERT INTO cityobjectgroup (id) VALUES (?)")
        .bind(id)
        .execute(storage.pool())
        .await
        .unwrap();
}

pub async fn insert_surface_data(
    storage: &SqliteStorage,
    id: i64,
    gmlid: &str,
    objectclass_id: i32,
) {
    sqlx::query("INSERT INTO surface_data (id, gmlid, objectclass_id) VALUES (?, ?, ?)")
        .bind(id)
        .bind(gmlid)
        .bind(objectclass_id)
        .execute(storage.pool())
        .await
        .unwrap();
}

pub async fn insert_geometry(storage: &SqliteStorage, row: &SurfaceGeometryRow) {
    sqlx::query(
        r#"
        INSERT INTO surface_geometry
            (id, gmlid, parent_id, root_id, is_solid, is_composite, is_triangulated,
             is_xlink, is_reverse, geometry, cityobject_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row.id)
    .bind(&row.gmlid)
    .bind(row.parent_id)
    .bind(row.root_id)
    .bind(row.is_solid)
    .bind(row.is_composite)
    .bind(row.is_triangulated)
    .bind(row.is_xlink)
    .bind(row.is_reverse)
    .bind(row.geometry.as_deref())
    .bind(row.cityobject_id)
    .execute(storage.pool())
    .await
    .unwrap();
}

/// Plain original geometry row; flags and payload are set by the caller.
pub fn node(
    id: i64,
    gmlid: Option<&str>,
    parent_id: Option<i64>,
    root_id: i64,
) -> SurfaceGeometryRow {
    SurfaceGeometryRow {
        id,
        gmlid: gmlid.map(str::to_string),
        parent_id,
        root_id,
        is_solid: false,
        is_composite: false,
        is_triangulated: false,
        is_xlink: xlink_flag::ORIGINAL,
        is_reverse: false,
        geometry: None,
        cityobject_id: None,
    }
}

pub fn pending_group(group_id: i64, gmlid: &str, is_parent: bool) -> PendingReference {
    PendingReference::Group(GroupXlink {
        group_id,
        gmlid: gmlid.to_string(),
        is_parent,
        role: None,
        pass: 0,
    })
}

pub fn pending_geometry(id: i64, parent_id: i64, root_id: i64, gmlid: &str) -> PendingReference {
    PendingReference::SurfaceGeometry(SurfaceGeometryXlink {
        id,
        parent_id,
        root_id,
        reverse: false,
        gmlid: gmlid.to_string(),
        cityobject_id: None,
        pass: 0,
    })
}
