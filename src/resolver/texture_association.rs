use super::{BatchBuffer, Reference, Resolution, ResolverManager, XlinkResolver};
use crate::cache::LookupKind;
use crate::error::Result;
use crate::models::{TextureAssociationXlink, XlinkKind};
use crate::storage::{SqliteStorage, TextureParamCopy};

/// Shares a texture parameterization declared elsewhere with another geometry.
/// Runs after plain texture parameters have been written.
pub struct TextureAssociationResolver {
    storage: SqliteStorage,
    batch: BatchBuffer<TextureParamCopy>,
}

impl TextureAssociationResolver {
    pub fn new(storage: SqliteStorage, batch_size: usize) -> Self {
        Self {
            storage,
            batch: BatchBuffer::new(batch_size),
        }
    }

    pub async fn resolve(
        &self,
        xlink: &TextureAssociationXlink,
        manager: &ResolverManager,
    ) -> Result<Resolution> {
        let (Reference::Local(uri), Reference::Local(gmlid)) =
            (Reference::parse(&xlink.uri), Reference::parse(&xlink.gmlid))
        else {
            return Ok(Resolution::Skipped(format!(
                "remote texture association '{}' -> '{}'",
                xlink.uri, xlink.gmlid
            )));
        };

        // The association entry carries the original surface_data id and the
        // geometry it was declared for
        let Some(source) = manager
            .identifiers()
            .resolve(uri, LookupKind::TextureAssociation, false)
            .await?
        else {
            return Ok(Resolution::Unresolved);
        };
        let Some(target) = manager
            .identifiers()
            .resolve(gmlid, LookupKind::Geometry, false)
            .await?
        else {
            return Ok(Resolution::Unresolved);
        };

        let copy = TextureParamCopy {
            source_surface_data_id: source.id,
            source_geometry_id: source.root_id,
            target_surface_data_id: xlink.id,
            target_geometry_id: target.id,
        };
        if self.batch.push(copy).await {
            self.flush().await?;
        }
        Ok(Resolution::Resolved)
    }
}

#[async_trait::async_trait]
impl XlinkResolver for TextureAssociationResolver {
    fn kind(&self) -> XlinkKind {
        XlinkKind::TextureAssociation
    }

    async fn flush(&self) -> Result<()> {
        let copies = self.batch.take().await;
        if copies.is_empty() {
            return Ok(());
        }
        let copied = self.storage.copy_texture_params(&copies).await?;
        if copied < copies.len() as u64 {
            tracing::warn!(
                "{} of {} texture associations had no parameterization to copy",
                copies.len() as u64 - copied,
                copies.len()
            );
        }
        Ok(())
    }
}
