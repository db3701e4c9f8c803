use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::models::SurfaceGeometryRow;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Query performance metrics
#[derive(Debug, Clone, Default)]
pub struct QueryMetrics {
    pub total_queries: Arc<AtomicU64>,
    pub slow_queries: Arc<AtomicU64>,
    pub total_query_time_ms: Arc<AtomicU64>,
}

impl QueryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self, started: Instant) {
        let duration_ms = started.elapsed().as_millis() as u64;
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        self.total_query_time_ms
            .fetch_add(duration_ms, Ordering::Relaxed);

        // Queries over 100ms are considered slow
        if duration_ms > 100 {
            self.slow_queries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Slow query detected: {}ms", duration_ms);
        }
    }

    pub fn get_stats(&self) -> (u64, u64, u64) {
        (
            self.total_queries.load(Ordering::Relaxed),
            self.slow_queries.load(Ordering::Relaxed),
            self.total_query_time_ms.load(Ordering::Relaxed),
        )
    }
}

/// Id sequences, one per table that receives freshly allocated rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sequence {
    SurfaceGeometry,
    SurfaceData,
}

impl Sequence {
    pub const ALL: [Sequence; 2] = [Sequence::SurfaceGeometry, Sequence::SurfaceData];

    pub fn name(&self) -> &'static str {
        match self {
            Sequence::SurfaceGeometry => "surface_geometry_seq",
            Sequence::SurfaceData => "surface_data_seq",
        }
    }

    /// Highest id already in use, including ids pre-allocated by the forward pass.
    fn max_id_sql(&self) -> &'static str {
        match self {
            Sequence::SurfaceGeometry => {
                "MAX(COALESCE((SELECT MAX(id) FROM surface_geometry), 0), \
                 COALESCE((SELECT MAX(id) FROM tmp_surface_geometry), 0))"
            }
            Sequence::SurfaceData => "COALESCE((SELECT MAX(id) FROM surface_data), 0)",
        }
    }
}

/// Row of the durable identifier cache table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CacheRow {
    pub gmlid: String,
    pub kind: String,
    pub id: i64,
    pub root_id: i64,
    pub reverse: bool,
    pub object_class: i32,
    pub mapping: Option<String>,
}

/// New `surface_geometry` row produced by a deep copy.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceGeometryInsert {
    pub id: i64,
    pub gmlid: Option<String>,
    pub parent_id: Option<i64>,
    pub root_id: i64,
    pub is_solid: bool,
    pub is_composite: bool,
    pub is_triangulated: bool,
    pub is_xlink: i64,
    pub is_reverse: bool,
    pub geometry: Option<Vec<u8>>,
    pub cityobject_id: Option<i64>,
}

/// Mutation completing a basic reference. Names are checked against the schema
/// before a write is queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BasicWrite {
    JoinRow {
        table: String,
        from_column: String,
        from_id: i64,
        to_column: String,
        to_id: i64,
    },
    ColumnUpdate {
        table: String,
        column: String,
        id: i64,
        value: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupWrite {
    Member {
        group_id: i64,
        cityobject_id: i64,
        role: Option<String>,
    },
    Parent {
        group_id: i64,
        parent_id: i64,
    },
}

/// SQLite storage for the city model and the XLink staging queues
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    metrics: QueryMetrics,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(db_path: &str) -> Result<Self> {
        Self::connect(db_path, 20).await
    }

    /// Create a storage instance with an explicit connection limit
    pub async fn connect(db_path: &str, max_connections: u32) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Pragmas go on the connect options so that every pooled connection gets them
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .pragma("cache_size", "-64000") // 64MB cache
            .pragma("temp_store", "MEMORY");

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(4))
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Some(Duration::from_secs(300)))
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            metrics: QueryMetrics::new(),
        })
    }

    /// Get pool for transaction support
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get query metrics
    pub fn metrics(&self) -> &QueryMetrics {
        &self.metrics
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;

        tracing::info!("SQLite migrations completed");
        Ok(())
    }

    /// Quick connectivity check, runs SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close all pooled connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // === Schema ===

    /// Column names per table, read from the live schema.
    pub async fn table_columns(&self) -> Result<HashMap<String, HashSet<String>>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT m.name, p.name
            FROM sqlite_master m
            JOIN pragma_table_info(m.name) p
            WHERE m.type = 'table'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut columns: HashMap<String, HashSet<String>> = HashMap::new();
        for (table, column) in rows {
            columns
                .entry(table.to_lowercase())
                .or_default()
                .insert(column.to_lowercase());
        }
        Ok(columns)
    }

    /// Row count of an arbitrary table.
    pub async fn count_rows(&self, table: &str) -> Result<i64> {
        check_identifier(table)?;
        let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    // === Sequences ===

    /// Move a sequence past every id already present in its table.
    pub async fn sync_sequence(&self, sequence: Sequence) -> Result<i64> {
        let sql = format!(
            r#"
            INSERT INTO sequences (name, value)
            SELECT ?, {} WHERE true
            ON CONFLICT(name) DO UPDATE SET value = MAX(value, excluded.value)
            RETURNING value
            "#,
            sequence.max_id_sql()
        );
        let value: (i64,) = sqlx::query_as(&sql)
            .bind(sequence.name())
            .fetch_one(&self.pool)
            .await?;
        Ok(value.0)
    }

    /// Next value of a sequence.
    pub async fn next_id(&self, sequence: Sequence) -> Result<i64> {
        let value: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sequences (name, value) VALUES (?, 1)
            ON CONFLICT(name) DO UPDATE SET value = value + 1
            RETURNING value
            "#,
        )
        .bind(sequence.name())
        .fetch_one(&self.pool)
        .await?;
        Ok(value.0)
    }

    // === Lookups ===

    /// Feature by gml:id: `(id, objectclass_id)`.
    pub async fn find_feature(&self, gmlid: &str) -> Result<Option<(i64, i32)>> {
        let started = Instant::now();
        let row: Option<(i64, i32)> = sqlx::query_as(
            "SELECT id, objectclass_id FROM cityobject WHERE gmlid = ? ORDER BY id LIMIT 1",
        )
        .bind(gmlid)
        .fetch_optional(&self.pool)
        .await?;
        self.metrics.record_query(started);
        Ok(row)
    }

    /// Surface data (material or texture) by gml:id: `(id, objectclass_id)`.
    pub async fn find_surface_data(&self, gmlid: &str) -> Result<Option<(i64, i32)>> {
        let started = Instant::now();
        let row: Option<(i64, i32)> = sqlx::query_as(
            "SELECT id, objectclass_id FROM surface_data WHERE gmlid = ? ORDER BY id LIMIT 1",
        )
        .bind(gmlid)
        .fetch_optional(&self.pool)
        .await?;
        self.metrics.record_query(started);
        Ok(row)
    }

    /// Geometry node by gml:id, optionally restricted to one tree: `(id, root_id)`.
    /// Originals win over XLink copies carrying the same gml:id.
    pub async fn find_geometry(
        &self,
        gmlid: &str,
        root_id: Option<i64>,
    ) -> Result<Option<(i64, i64)>> {
        let started = Instant::now();
        let row: Option<(i64, i64)> = match root_id {
            Some(root_id) => {
                sqlx::query_as(
                    r#"
                    SELECT id, root_id FROM surface_geometry
                    WHERE gmlid = ? AND root_id = ?
                    ORDER BY id LIMIT 1
                    "#,
                )
                .bind(gmlid)
                .bind(root_id)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, root_id FROM surface_geometry
                    WHERE gmlid = ?
                    ORDER BY is_xlink = 1, id LIMIT 1
                    "#,
                )
                .bind(gmlid)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        self.metrics.record_query(started);
        Ok(row)
    }

    // === Identifier cache table ===

    pub async fn get_cache_row(&self, gmlid: &str, kind: &str) -> Result<Option<CacheRow>> {
        let started = Instant::now();
        let row = sqlx::query_as::<_, CacheRow>(
            r#"
            SELECT gmlid, kind, id, root_id, reverse, object_class, mapping
            FROM gmlid_cache WHERE gmlid = ? AND kind = ?
            "#,
        )
        .bind(gmlid)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;
        self.metrics.record_query(started);
        Ok(row)
    }

    pub async fn put_cache_row(&self, row: &CacheRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gmlid_cache (gmlid, kind, id, root_id, reverse, object_class, mapping)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(gmlid, kind) DO UPDATE SET
                id = excluded.id,
                root_id = excluded.root_id,
                reverse = excluded.reverse,
                object_class = excluded.object_class,
                mapping = excluded.mapping
            "#,
        )
        .bind(&row.gmlid)
        .bind(&row.kind)
        .bind(row.id)
        .bind(row.root_id)
        .bind(row.reverse)
        .bind(row.object_class)
        .bind(&row.mapping)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // === Geometry ===

    /// Every row of one geometry tree, in no particular order.
    pub async fn load_geometry_tree(&self, root_id: i64) -> Result<Vec<SurfaceGeometryRow>> {
        let started = Instant::now();
        let rows = sqlx::query_as::<_, SurfaceGeometryRow>(
            r#"
            SELECT id, gmlid, parent_id, root_id, is_solid, is_composite, is_triangulated,
                   is_xlink, is_reverse, geometry, cityobject_id
            FROM surface_geometry WHERE root_id = ?
            "#,
        )
        .bind(root_id)
        .fetch_all(&self.pool)
        .await?;
        self.metrics.record_query(started);
        Ok(rows)
    }

    pub async fn get_geometry(&self, id: i64) -> Result<Option<SurfaceGeometryRow>> {
        let row = sqlx::query_as::<_, SurfaceGeometryRow>(
            r#"
            SELECT id, gmlid, parent_id, root_id, is_solid, is_composite, is_triangulated,
                   is_xlink, is_reverse, geometry, cityobject_id
            FROM surface_geometry WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Write deep-copied geometry rows (in the given order) and flag referenced
    /// originals in one transaction. Returns how many originals were newly flagged.
    pub async fn write_geometry_batch(
        &self,
        inserts: &[SurfaceGeometryInsert],
        referenced: &[i64],
    ) -> Result<u64> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        for row in inserts {
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
            .execute(&mut *tx)
            .await?;
        }

        let mut flagged = 0u64;
        for id in referenced {
            let result = sqlx::query(
                "UPDATE surface_geometry SET is_xlink = ? WHERE id = ? AND is_xlink = ?",
            )
            .bind(crate::models::xlink_flag::REFERENCED)
            .bind(id)
            .bind(crate::models::xlink_flag::ORIGINAL)
            .execute(&mut *tx)
            .await?;
            flagged += result.rows_affected();
        }

        tx.commit().await?;
        self.metrics.record_query(started);
        Ok(flagged)
    }

    // === Feature references ===

    pub async fn write_basic_batch(&self, writes: &[BasicWrite]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for write in writes {
            match write {
                BasicWrite::JoinRow {
                    table,
                    from_column,
                    from_id,
                    to_column,
                    to_id,
                } => {
                    check_identifier(table)?;
                    check_identifier(from_column)?;
                    check_identifier(to_column)?;
                    let sql = format!(
                        "INSERT OR IGNORE INTO {} ({}, {}) VALUES (?, ?)",
                        table, from_column, to_column
                    );
                    sqlx::query(&sql)
                        .bind(from_id)
                        .bind(to_id)
                        .execute(&mut *tx)
                        .await?;
                }
                BasicWrite::ColumnUpdate {
                    table,
                    column,
                    id,
                    value,
                } => {
                    check_identifier(table)?;
                    check_identifier(column)?;
                    let sql = format!("UPDATE {} SET {} = ? WHERE id = ?", table, column);
                    sqlx::query(&sql)
                        .bind(value)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn write_group_batch(&self, writes: &[GroupWrite]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for write in writes {
            match write {
                GroupWrite::Member {
                    group_id,
                    cityobject_id,
                    role,
                } => {
                    sqlx::query(
                        r#"
                        INSERT INTO group_to_cityobject (cityobject_id, cityobjectgroup_id, role)
                        VALUES (?, ?, ?)
                        ON CONFLICT(cityobject_id, cityobjectgroup_id) DO UPDATE SET
                            role = excluded.role
                        "#,
                    )
                    .bind(cityobject_id)
                    .bind(group_id)
                    .bind(role)
                    .execute(&mut *tx)
                    .await?;
                }
                GroupWrite::Parent {
                    group_id,
                    parent_id,
                } => {
                    sqlx::query("UPDATE cityobjectgroup SET parent_cityobject_id = ? WHERE id = ?")
                        .bind(parent_id)
                        .bind(group_id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Table and column names are interpolated into SQL, so only plain identifiers pass.
pub fn check_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}
