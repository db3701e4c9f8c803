use std::collections::{BTreeMap, HashMap};

use tokio::sync::Mutex;

use super::{Reference, Resolution, ResolverManager, XlinkResolver};
use crate::cache::LookupKind;
use crate::error::Result;
use crate::models::{TextureCoordListXlink, XlinkKind};
use crate::storage::{SqliteStorage, TextureParamInsert};

/// Ring coordinates of one polygon, keyed by ring number.
type RingCoordinates = BTreeMap<i64, String>;

/// Collects the texture coordinates of every ring of a polygon and writes them
/// as one `textureparam` row. Only complete polygons are written, so nothing is
/// flushed before the phase barrier.
pub struct TextureCoordListResolver {
    storage: SqliteStorage,
    polygons: Mutex<HashMap<(i64, i64), RingCoordinates>>,
}

impl TextureCoordListResolver {
    pub fn new(storage: SqliteStorage) -> Self {
        Self {
            storage,
            polygons: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(
        &self,
        xlink: &TextureCoordListXlink,
        manager: &ResolverManager,
    ) -> Result<Resolution> {
        let Reference::Local(gmlid) = Reference::parse(&xlink.gmlid) else {
            return Ok(Resolution::Skipped(format!(
                "remote reference '{}'",
                xlink.gmlid
            )));
        };

        // A ring's gml:id is registered against the polygon it bounds
        let Some(polygon) = manager
            .identifiers()
            .resolve(gmlid, LookupKind::Geometry, false)
            .await?
        else {
            return Ok(Resolution::Unresolved);
        };

        self.polygons
            .lock()
            .await
            .entry((polygon.id, xlink.id))
            .or_default()
            .insert(xlink.ring_no, xlink.texture_coordinates.trim().to_string());
        Ok(Resolution::Resolved)
    }
}

#[async_trait::async_trait]
impl XlinkResolver for TextureCoordListResolver {
    fn kind(&self) -> XlinkKind {
        XlinkKind::TextureCoordList
    }

    async fn flush(&self) -> Result<()> {
        let polygons = std::mem::take(&mut *self.polygons.lock().await);
        if polygons.is_empty() {
            return Ok(());
        }

        let rows: Vec<TextureParamInsert> = polygons
            .into_iter()
            .map(|((surface_geometry_id, surface_data_id), rings)| TextureParamInsert {
                surface_geometry_id,
                surface_data_id,
                is_texture_parametrization: true,
                world_to_texture: None,
                texture_coordinates: Some(rings.into_values().collect::<Vec<_>>().join(";")),
            })
            .collect();
        self.storage.write_texture_params(&rows).await?;
        tracing::debug!("Flushed texture coordinates of {} polygons", rows.len());
        Ok(())
    }
}
