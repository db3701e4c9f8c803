use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{BatchBuffer, Reference, Resolution, ResolverManager, XlinkResolver};
use crate::cache::LookupKind;
use crate::error::Result;
use crate::models::{BasicXlink, XlinkKind};
use crate::storage::{check_identifier, BasicWrite, SqliteStorage};

/// n:m relations stored in a join table instead of a foreign-key column.
struct JoinTable {
    from_table: &'static str,
    to_table: &'static str,
    table: &'static str,
    from_column: &'static str,
    to_column: &'static str,
}

const JOIN_TABLES: &[JoinTable] = &[
    JoinTable {
        from_table: "thematic_surface",
        to_table: "opening",
        table: "opening_to_them_surface",
        from_column: "thematic_surface_id",
        to_column: "opening_id",
    },
    JoinTable {
        from_table: "opening",
        to_table: "thematic_surface",
        table: "opening_to_them_surface",
        from_column: "opening_id",
        to_column: "thematic_surface_id",
    },
    JoinTable {
        from_table: "building",
        to_table: "address",
        table: "address_to_building",
        from_column: "building_id",
        to_column: "address_id",
    },
];

fn join_table(from_table: &str, to_table: &str) -> Option<&'static JoinTable> {
    JOIN_TABLES
        .iter()
        .find(|j| j.from_table == from_table && j.to_table == to_table)
}

/// Where a target id lives, judged by the referenced table.
fn lookup_kind(to_table: &str) -> LookupKind {
    match to_table {
        "surface_geometry" => LookupKind::Geometry,
        "surface_data" => LookupKind::SurfaceData,
        _ => LookupKind::Feature,
    }
}

/// Plain foreign keys: a join-table row or a column update.
pub struct BasicResolver {
    storage: SqliteStorage,
    write_lock: Arc<Mutex<()>>,
    columns: HashMap<String, HashSet<String>>,
    batch: BatchBuffer<BasicWrite>,
}

impl BasicResolver {
    pub async fn new(
        storage: SqliteStorage,
        write_lock: Arc<Mutex<()>>,
        batch_size: usize,
    ) -> Result<Self> {
        let columns = storage.table_columns().await?;
        Ok(Self {
            storage,
            write_lock,
            columns,
            batch: BatchBuffer::new(batch_size),
        })
    }

    fn has_column(&self, table: &str, column: &str) -> bool {
        self.columns
            .get(table)
            .is_some_and(|columns| columns.contains(column))
    }

    pub async fn resolve(
        &self,
        xlink: &BasicXlink,
        manager: &ResolverManager,
    ) -> Result<Resolution> {
        let Reference::Local(gmlid) = Reference::parse(&xlink.gmlid) else {
            return Ok(Resolution::Skipped(format!(
                "remote reference '{}'",
                xlink.gmlid
            )));
        };

        let from_table = xlink.from_table.to_lowercase();
        let to_table = xlink.to_table.to_lowercase();

        let Some(target) = manager
            .identifiers()
            .resolve(gmlid, lookup_kind(&to_table), true)
            .await?
        else {
            return Ok(Resolution::Unresolved);
        };

        let write = if let Some(join) = join_table(&from_table, &to_table) {
            BasicWrite::JoinRow {
                table: join.table.to_string(),
                from_column: join.from_column.to_string(),
                from_id: xlink.id,
                to_column: join.to_column.to_string(),
                to_id: target.id,
            }
        } else {
            let Some(column) = xlink.attr_name.as_deref().map(str::to_lowercase) else {
                return Ok(Resolution::Skipped(format!(
                    "no column to update for {} -> {}",
                    from_table, to_table
                )));
            };
            if check_identifier(&from_table).is_err()
                || check_identifier(&column).is_err()
                || !self.has_column(&from_table, &column)
            {
                return Ok(Resolution::Skipped(format!(
                    "unknown column {}.{}",
                    from_table, column
                )));
            }
            BasicWrite::ColumnUpdate {
                table: from_table,
                column,
                id: xlink.id,
                value: target.id,
            }
        };

        if self.batch.push(write).await {
            self.flush().await?;
        }
        Ok(Resolution::Resolved)
    }
}

#[async_trait::async_trait]
impl XlinkResolver for BasicResolver {
    fn kind(&self) -> XlinkKind {
        XlinkKind::Basic
    }

    async fn flush(&self) -> Result<()> {
        let writes = self.batch.take().await;
        if writes.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        self.storage.write_basic_batch(&writes).await?;
        tracing::debug!("Flushed {} basic references", writes.len());
        Ok(())
    }
}
