use super::{BatchBuffer, Reference, Resolution, ResolverManager, XlinkResolver};
use crate::cache::LookupKind;
use crate::error::Result;
use crate::models::{DeprecatedMaterialXlink, XlinkKind};
use crate::storage::{MaterialCopy, Sequence, SqliteStorage};

/// CityGML 0.4 material references: each gets a private copy of the material.
pub struct DeprecatedMaterialResolver {
    storage: SqliteStorage,
    batch: BatchBuffer<MaterialCopy>,
}

impl DeprecatedMaterialResolver {
    pub fn new(storage: SqliteStorage, batch_size: usize) -> Self {
        Self {
            storage,
            batch: BatchBuffer::new(batch_size),
        }
    }

    pub async fn resolve(
        &self,
        xlink: &DeprecatedMaterialXlink,
        manager: &ResolverManager,
    ) -> Result<Resolution> {
        let Reference::Local(gmlid) = Reference::parse(&xlink.gmlid) else {
            return Ok(Resolution::Skipped(format!(
                "remote reference '{}'",
                xlink.gmlid
            )));
        };

        let Some(material) = manager
            .identifiers()
            .resolve(gmlid, LookupKind::SurfaceData, true)
            .await?
        else {
            return Ok(Resolution::Unresolved);
        };

        let copy = MaterialCopy {
            source_id: material.id,
            new_id: manager.allocate_id(Sequence::SurfaceData).await?,
            appearance_id: xlink.id,
            surface_geometry_id: xlink.surface_geometry_id,
        };
        if self.batch.push(copy).await {
            self.flush().await?;
        }
        Ok(Resolution::Resolved)
    }
}

#[async_trait::async_trait]
impl XlinkResolver for DeprecatedMaterialResolver {
    fn kind(&self) -> XlinkKind {
        XlinkKind::DeprecatedMaterial
    }

    async fn flush(&self) -> Result<()> {
        let copies = self.batch.take().await;
        if copies.is_empty() {
            return Ok(());
        }
        self.storage.copy_materials(&copies).await?;
        Ok(())
    }
}
