use super::{BatchBuffer, Reference, Resolution, ResolverManager, XlinkResolver};
use crate::cache::LookupKind;
use crate::error::Result;
use crate::models::{TextureParamXlink, XlinkKind};
use crate::storage::{SqliteStorage, TextureParamInsert};

pub struct TextureParamResolver {
    storage: SqliteStorage,
    batch: BatchBuffer<TextureParamInsert>,
}

impl TextureParamResolver {
    pub fn new(storage: SqliteStorage, batch_size: usize) -> Self {
        Self {
            storage,
            batch: BatchBuffer::new(batch_size),
        }
    }

    pub async fn resolve(
        &self,
        xlink: &TextureParamXlink,
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

        let row = TextureParamInsert {
            surface_geometry_id: target.id,
            surface_data_id: xlink.id,
            is_texture_parametrization: xlink.is_texture_parametrization,
            world_to_texture: xlink.world_to_texture.clone(),
            texture_coordinates: xlink.texture_coordinates.clone(),
        };
        if self.batch.push(row).await {
            self.flush().await?;
        }
        Ok(Resolution::Resolved)
    }
}

#[async_trait::async_trait]
impl XlinkResolver for TextureParamResolver {
    fn kind(&self) -> XlinkKind {
        XlinkKind::TextureParam
    }

    async fn flush(&self) -> Result<()> {
        let rows = self.batch.take().await;
        if rows.is_empty() {
            return Ok(());
        }
        self.storage.write_texture_params(&rows).await?;
        Ok(())
    }
}
