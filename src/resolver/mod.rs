//! Per-kind XLink resolvers and the registry that owns them.

pub mod basic;
pub mod deprecated_material;
pub mod group;
pub mod identifier;
pub mod manager;
pub mod surface_geometry;
pub mod texture_association;
pub mod texture_coord_list;
pub mod texture_image;
pub mod texture_param;
pub mod world_file;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::XlinkKind;

pub use basic::BasicResolver;
pub use deprecated_material::DeprecatedMaterialResolver;
pub use group::GroupResolver;
pub use identifier::{IdentifierResolver, Reference, ResolvedReference};
pub use manager::ResolverManager;
pub use surface_geometry::SurfaceGeometryResolver;
pub use texture_association::TextureAssociationResolver;
pub use texture_coord_list::TextureCoordListResolver;
pub use texture_image::TextureImageResolver;
pub use texture_param::TextureParamResolver;
pub use world_file::WorldFileResolver;

/// Outcome of resolving one pending reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Mutation queued for the next flush.
    Resolved,
    /// Handed to the next pass because its target is still being extended.
    Deferred,
    /// Target not known yet.
    Unresolved,
    /// Can never be resolved; the row is dropped.
    Skipped(String),
}

#[async_trait::async_trait]
pub trait XlinkResolver: Send + Sync {
    fn kind(&self) -> XlinkKind;

    /// Write every buffered mutation.
    async fn flush(&self) -> Result<()>;

    /// Flush and release resources; the resolver is not used afterwards.
    async fn close(&self) -> Result<()> {
        self.flush().await
    }
}

/// Mutations buffered by one resolver between flushes.
pub struct BatchBuffer<T> {
    items: Mutex<Vec<T>>,
    batch_size: usize,
}

impl<T> BatchBuffer<T> {
    pub fn new(batch_size: usize) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
        }
    }

    /// Returns true once the buffer holds a full batch.
    pub async fn push(&self, item: T) -> bool {
        let mut items = self.items.lock().await;
        items.push(item);
        items.len() >= self.batch_size
    }

    pub async fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock().await)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}
