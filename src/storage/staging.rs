//! Staging queues filled by the forward import pass.
//!
//! Every queue carries a `pass` column. A fixpoint pass reads exactly the rows of
//! its own pass number, and rows re-queued during that pass land in `pass + 1`.

use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use sqlx::sqlite::SqliteRow;
use sqlx::QueryBuilder;
use std::collections::BTreeMap;

use super::sqlite::{Result, SqliteStorage, StorageError};
use crate::models::{PendingReference, XlinkKind};

/// SQLite caps bound parameters per statement; id lists are split into chunks.
const MAX_IDS_PER_QUERY: usize = 500;

const SELECT_BASIC: &str = r#"
    SELECT id, from_table, to_table, attr_name, gmlid, pass
    FROM tmp_basic WHERE pass = ? ORDER BY rowid
"#;
const SELECT_GROUP: &str = r#"
    SELECT group_id, gmlid, is_parent, role, pass
    FROM tmp_group_to_cityobject WHERE pass = ? ORDER BY rowid
"#;
const SELECT_SURFACE_GEOMETRY: &str = r#"
    SELECT id, parent_id, root_id, reverse, gmlid, cityobject_id, pass
    FROM tmp_surface_geometry WHERE pass = ? ORDER BY rowid
"#;
const SELECT_TEXTURE_PARAM: &str = r#"
    SELECT id, gmlid, is_texture_parametrization, world_to_texture, texture_coordinates, pass
    FROM tmp_texture_param WHERE pass = ? ORDER BY rowid
"#;
const SELECT_TEXTURE_COORD_LIST: &str = r#"
    SELECT id, gmlid, ring_no, texture_coordinates, pass
    FROM tmp_texture_coord_list WHERE pass = ? ORDER BY rowid
"#;
const SELECT_TEXTURE_ASSOCIATION: &str =
    "SELECT id, gmlid, uri, pass FROM tmp_texture_association WHERE pass = ? ORDER BY rowid";
const SELECT_DEPRECATED_MATERIAL: &str = r#"
    SELECT id, gmlid, surface_geometry_id, pass
    FROM tmp_deprecated_material WHERE pass = ? ORDER BY rowid
"#;
const SELECT_TEXTURE_IMAGE: &str =
    "SELECT id, file_uri, pass FROM tmp_texture_image WHERE pass = ? ORDER BY rowid";
const SELECT_WORLD_FILE: &str =
    "SELECT id, image_uri, pass FROM tmp_world_file WHERE pass = ? ORDER BY rowid";

impl SqliteStorage {
    // === Staging indexes ===

    /// Create the lookup indexes a phase needs before its first pass.
    pub async fn create_staging_index(&self, kind: XlinkKind) -> Result<()> {
        let table = kind.staging_table();
        let pass_index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_pass_idx ON {table} (pass)",
            table = table
        );
        sqlx::query(&pass_index).execute(self.pool()).await?;

        let extra = match kind {
            XlinkKind::Group => Some(
                "CREATE INDEX IF NOT EXISTS tmp_group_to_cityobject_group_idx \
                 ON tmp_group_to_cityobject (group_id, is_parent, pass)",
            ),
            XlinkKind::SurfaceGeometry => Some(
                "CREATE INDEX IF NOT EXISTS tmp_surface_geometry_parent_idx \
                 ON tmp_surface_geometry (parent_id, pass)",
            ),
            _ => None,
        };
        if let Some(sql) = extra {
            sqlx::query(sql).execute(self.pool()).await?;
        }
        Ok(())
    }

    // === Reading ===

    /// Stream every pending row of one kind and pass, in insertion order.
    pub fn stream_pending(
        &self,
        kind: XlinkKind,
        pass: i64,
    ) -> BoxStream<'_, Result<PendingReference>> {
        match kind {
            XlinkKind::Basic => self.fetch_staged(SELECT_BASIC, pass, PendingReference::Basic),
            XlinkKind::Group => self.fetch_staged(SELECT_GROUP, pass, PendingReference::Group),
            XlinkKind::SurfaceGeometry => self.fetch_staged(
                SELECT_SURFACE_GEOMETRY,
                pass,
                PendingReference::SurfaceGeometry,
            ),
            XlinkKind::TextureParam => {
                self.fetch_staged(SELECT_TEXTURE_PARAM, pass, PendingReference::TextureParam)
            }
            XlinkKind::TextureCoordList => self.fetch_staged(
                SELECT_TEXTURE_COORD_LIST,
                pass,
                PendingReference::TextureCoordList,
            ),
            XlinkKind::TextureAssociation => self.fetch_staged(
                SELECT_TEXTURE_ASSOCIATION,
                pass,
                PendingReference::TextureAssociation,
            ),
            XlinkKind::DeprecatedMaterial => self.fetch_staged(
                SELECT_DEPRECATED_MATERIAL,
                pass,
                PendingReference::DeprecatedMaterial,
            ),
            XlinkKind::TextureImage => {
                self.fetch_staged(SELECT_TEXTURE_IMAGE, pass, PendingReference::TextureImage)
            }
            XlinkKind::WorldFile => {
                self.fetch_staged(SELECT_WORLD_FILE, pass, PendingReference::WorldFile)
            }
        }
    }

    fn fetch_staged<'a, T>(
        &'a self,
        sql: &'static str,
        pass: i64,
        wrap: fn(T) -> PendingReference,
    ) -> BoxStream<'a, Result<PendingReference>>
    where
        T: for<'r> sqlx::FromRow<'r, SqliteRow> + Send + Unpin + 'a,
    {
        sqlx::query_as::<_, T>(sql)
            .bind(pass)
            .fetch(self.pool())
            .map_ok(wrap)
            .map_err(StorageError::from)
            .boxed()
    }

    pub async fn count_pending(&self, kind: XlinkKind, pass: i64) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE pass = ?", kind.staging_table());
        let count: (i64,) = sqlx::query_as(&sql)
            .bind(pass)
            .fetch_one(self.pool())
            .await?;
        Ok(count.0)
    }

    /// Pending rows per kind across all passes.
    pub async fn pending_counts(&self) -> Result<BTreeMap<XlinkKind, i64>> {
        let mut counts = BTreeMap::new();
        for kind in XlinkKind::ALL {
            let sql = format!("SELECT COUNT(*) FROM {}", kind.staging_table());
            let count: (i64,) = sqlx::query_as(&sql).fetch_one(self.pool()).await?;
            counts.insert(kind, count.0);
        }
        Ok(counts)
    }

    /// Whether a group still has unresolved rows of the same direction in this pass.
    pub async fn has_pending_group(
        &self,
        group_id: i64,
        is_parent: bool,
        pass: i64,
    ) -> Result<bool> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM (
                SELECT 1 FROM tmp_group_to_cityobject
                WHERE group_id = ? AND is_parent = ? AND pass = ?
                LIMIT 1
            )
            "#,
        )
        .bind(group_id)
        .bind(is_parent)
        .bind(pass)
        .fetch_one(self.pool())
        .await?;
        Ok(count.0 > 0)
    }

    /// Whether any of the given geometry nodes is still waiting for an XLink child
    /// in this pass.
    pub async fn has_pending_geometry_children(&self, ids: &[i64], pass: i64) -> Result<bool> {
        for chunk in ids.chunks(MAX_IDS_PER_QUERY) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "SELECT COUNT(*) FROM (SELECT 1 FROM tmp_surface_geometry WHERE pass = ",
            );
            builder.push_bind(pass);
            builder.push(" AND parent_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(") LIMIT 1)");

            let count: (i64,) = builder.build_query_as().fetch_one(self.pool()).await?;
            if count.0 > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // === Writing ===

    /// Append one row to its staging queue, keeping its pass number.
    pub async fn push_pending(&self, pending: &PendingReference) -> Result<()> {
        match pending {
            PendingReference::Basic(x) => {
                sqlx::query(
                    r#"
                    INSERT INTO tmp_basic (id, from_table, to_table, attr_name, gmlid, pass)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(x.id)
                .bind(&x.from_table)
                .bind(&x.to_table)
                .bind(&x.attr_name)
                .bind(&x.gmlid)
                .bind(x.pass)
                .execute(self.pool())
                .await?;
            }
            PendingReference::Group(x) => {
                sqlx::query(
                    r#"
                    INSERT INTO tmp_group_to_cityobject (group_id, gmlid, is_parent, role, pass)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(x.group_id)
                .bind(&x.gmlid)
                .bind(x.is_parent)
                .bind(&x.role)
                .bind(x.pass)
                .execute(self.pool())
                .await?;
            }
            PendingReference::SurfaceGeometry(x) => {
                sqlx::query(
                    r#"
                    INSERT INTO tmp_surface_geometry
                        (id, parent_id, root_id, reverse, gmlid, cityobject_id, pass)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(x.id)
                .bind(x.parent_id)
                .bind(x.root_id)
                .bind(x.reverse)
                .bind(&x.gmlid)
                .bind(x.cityobject_id)
                .bind(x.pass)
                .execute(self.pool())
                .await?;
            }
            PendingReference::TextureParam(x) => {
                sqlx::query(
                    r#"
                    INSERT INTO tmp_texture_param
                        (id, gmlid, is_texture_parametrization, world_to_texture,
                         texture_coordinates, pass)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(x.id)
                .bind(&x.gmlid)
                .bind(x.is_texture_parametrization)
                .bind(&x.world_to_texture)
                .bind(&x.texture_coordinates)
                .bind(x.pass)
                .execute(self.pool())
                .await?;
            }
            PendingReference::TextureCoordList(x) => {
                sqlx::query(
                    r#"
                    INSERT INTO tmp_texture_coord_list
                        (id, gmlid, ring_no, texture_coordinates, pass)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(x.id)
                .bind(&x.gmlid)
                .bind(x.ring_no)
                .bind(&x.texture_coordinates)
                .bind(x.pass)
                .execute(self.pool())
                .await?;
            }
            PendingReference::TextureAssociation(x) => {
                sqlx::query(
                    r#"
                    INSERT INTO tmp_texture_association (id, gmlid, uri, pass)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(x.id)
                .bind(&x.gmlid)
                .bind(&x.uri)
                .bind(x.pass)
                .execute(self.pool())
                .await?;
            }
            PendingReference::DeprecatedMaterial(x) => {
                sqlx::query(
                    r#"
                    INSERT INTO tmp_deprecated_material (id, gmlid, surface_geometry_id, pass)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(x.id)
                .bind(&x.gmlid)
                .bind(x.surface_geometry_id)
                .bind(x.pass)
                .execute(self.pool())
                .await?;
            }
            PendingReference::TextureImage(x) => {
                sqlx::query("INSERT INTO tmp_texture_image (id, file_uri, pass) VALUES (?, ?, ?)")
                    .bind(x.id)
                    .bind(&x.file_uri)
                    .bind(x.pass)
                    .execute(self.pool())
                    .await?;
            }
            PendingReference::WorldFile(x) => {
                sqlx::query("INSERT INTO tmp_world_file (id, image_uri, pass) VALUES (?, ?, ?)")
                    .bind(x.id)
                    .bind(&x.image_uri)
                    .bind(x.pass)
                    .execute(self.pool())
                    .await?;
            }
        }
        Ok(())
    }

    /// Drop every row of one pass once the pass has been processed.
    pub async fn delete_pass(&self, kind: XlinkKind, pass: i64) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE pass = ?", kind.staging_table());
        let result = sqlx::query(&sql).bind(pass).execute(self.pool()).await?;
        Ok(result.rows_affected())
    }

    /// Renumber leftovers of an earlier run so the next run starts at pass 0.
    pub async fn reset_passes(&self, kind: XlinkKind) -> Result<u64> {
        let sql = format!("UPDATE {} SET pass = 0 WHERE pass <> 0", kind.staging_table());
        let result = sqlx::query(&sql).execute(self.pool()).await?;
        Ok(result.rows_affected())
    }

    pub async fn truncate_staging(&self, kind: XlinkKind) -> Result<u64> {
        let sql = format!("DELETE FROM {}", kind.staging_table());
        let result = sqlx::query(&sql).execute(self.pool()).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pending_geometry, pending_group, test_storage};

    #[tokio::test]
    async fn test_push_and_stream_by_pass() {
        let (storage, _temp) = test_storage().await;
        storage.create_staging_index(XlinkKind::Group).await.unwrap();

        let first = pending_group(1, "a", false);
        storage.push_pending(&first).await.unwrap();
        storage
            .push_pending(&pending_group(2, "b", true).into_next_pass())
            .await
            .unwrap();

        let pass0: Vec<_> = storage
            .stream_pending(XlinkKind::Group, 0)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(pass0, vec![first]);

        assert_eq!(storage.count_pending(XlinkKind::Group, 1).await.unwrap(), 1);
        assert_eq!(storage.delete_pass(XlinkKind::Group, 0).await.unwrap(), 1);
        assert_eq!(storage.reset_passes(XlinkKind::Group).await.unwrap(), 1);
        assert_eq!(storage.count_pending(XlinkKind::Group, 0).await.unwrap(), 1);

        let counts = storage.pending_counts().await.unwrap();
        assert_eq!(counts[&XlinkKind::Group], 1);
        assert_eq!(counts[&XlinkKind::Basic], 0);
    }

    #[tokio::test]
    async fn test_has_pending_group_respects_direction_and_pass() {
        let (storage, _temp) = test_storage().await;
        storage
            .push_pending(&pending_group(9, "member", false))
            .await
            .unwrap();

        assert!(storage.has_pending_group(9, false, 0).await.unwrap());
        assert!(!storage.has_pending_group(9, true, 0).await.unwrap());
        assert!(!storage.has_pending_group(9, false, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_has_pending_geometry_children_chunks() {
        let (storage, _temp) = test_storage().await;
        storage
            .push_pending(&pending_geometry(100, 1234, 1, "child"))
            .await
            .unwrap();

        let many: Vec<i64> = (0..1300).collect();
        assert!(storage.has_pending_geometry_children(&many, 0).await.unwrap());
        assert!(!storage.has_pending_geometry_children(&[1, 2, 3], 0).await.unwrap());
        assert!(!storage.has_pending_geometry_children(&many, 1).await.unwrap());
        assert!(!storage.has_pending_geometry_children(&[], 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_truncate_staging() {
        let (storage, _temp) = test_storage().await;
        storage
            .push_pending(&pending_geometry(5, 0, 0, "g"))
            .await
            .unwrap();
        assert_eq!(
            storage
                .truncate_staging(XlinkKind::SurfaceGeometry)
                .await
                .unwrap(),
            1
        );
    }
}
