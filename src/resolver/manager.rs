use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use super::{
    BasicResolver, DeprecatedMaterialResolver, GroupResolver, IdentifierResolver, Resolution,
    SurfaceGeometryResolver, TextureAssociationResolver, TextureCoordListResolver,
    TextureImageResolver, TextureParamResolver, WorldFileResolver, XlinkResolver,
};
use crate::config::ResolverConfig;
use crate::error::{Result, XlinkError};
use crate::events::EventSink;
use crate::models::PendingReference;
use crate::pool::{ErrorSlot, WorkHandler, WorkerPool};
use crate::storage::{Sequence, SqliteStorage};

/// Writes re-queued references back into their staging table.
struct StagingWriter {
    storage: SqliteStorage,
}

#[async_trait::async_trait]
impl WorkHandler<PendingReference> for StagingWriter {
    async fn handle(&self, item: PendingReference) -> Result<()> {
        tracing::debug!(
            "Re-queueing {} reference '{}' for pass {}",
            item.kind(),
            item.reference(),
            item.pass()
        );
        self.storage.push_pending(&item).await?;
        Ok(())
    }
}

/// Owns one lazily built resolver per kind for the duration of a run, plus the
/// resources they share: store, reference resolver, id sequences, write lock and
/// the re-queue pool.
pub struct ResolverManager {
    storage: SqliteStorage,
    identifiers: Arc<IdentifierResolver>,
    config: ResolverConfig,
    write_lock: Arc<Mutex<()>>,
    requeue: WorkerPool<PendingReference>,
    events: EventSink,
    errors: ErrorSlot,

    basic: OnceCell<Arc<BasicResolver>>,
    group: OnceCell<Arc<GroupResolver>>,
    surface_geometry: OnceCell<Arc<SurfaceGeometryResolver>>,
    texture_param: OnceCell<Arc<TextureParamResolver>>,
    texture_coord_list: OnceCell<Arc<TextureCoordListResolver>>,
    texture_association: OnceCell<Arc<TextureAssociationResolver>>,
    deprecated_material: OnceCell<Arc<DeprecatedMaterialResolver>>,
    texture_image: OnceCell<Arc<TextureImageResolver>>,
    world_file: OnceCell<Arc<WorldFileResolver>>,
}

impl ResolverManager {
    /// Sequences are moved past every existing id before any resolver allocates one.
    pub async fn new(
        storage: SqliteStorage,
        identifiers: Arc<IdentifierResolver>,
        config: ResolverConfig,
        events: EventSink,
        errors: ErrorSlot,
    ) -> Result<Self> {
        for sequence in Sequence::ALL {
            let value = storage.sync_sequence(sequence).await?;
            tracing::debug!("Sequence {} starts after {}", sequence.name(), value);
        }

        let requeue = WorkerPool::new(
            "requeue",
            1,
            config.queue_capacity,
            Arc::new(StagingWriter {
                storage: storage.clone(),
            }),
            errors.clone(),
        );

        Ok(Self {
            storage,
            identifiers,
            config,
            write_lock: Arc::new(Mutex::new(())),
            requeue,
            events,
            errors,
            basic: OnceCell::new(),
            group: OnceCell::new(),
            surface_geometry: OnceCell::new(),
            texture_param: OnceCell::new(),
            texture_coord_list: OnceCell::new(),
            texture_association: OnceCell::new(),
            deprecated_material: OnceCell::new(),
            texture_image: OnceCell::new(),
            world_file: OnceCell::new(),
        })
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn identifiers(&self) -> &IdentifierResolver {
        &self.identifiers
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn errors(&self) -> &ErrorSlot {
        &self.errors
    }

    // === Resolvers ===

    pub async fn basic(&self) -> Result<Arc<BasicResolver>> {
        self.basic
            .get_or_try_init(|| async {
                let resolver = BasicResolver::new(
                    self.storage.clone(),
                    self.write_lock.clone(),
                    self.config.batch_size,
                )
                .await?;
                Ok::<_, XlinkError>(Arc::new(resolver))
            })
            .await
            .cloned()
    }

    pub async fn group(&self) -> Arc<GroupResolver> {
        self.group
            .get_or_init(|| async {
                Arc::new(GroupResolver::new(
                    self.storage.clone(),
                    self.config.batch_size,
                ))
            })
            .await
            .clone()
    }

    pub async fn surface_geometry(&self) -> Arc<SurfaceGeometryResolver> {
        self.surface_geometry
            .get_or_init(|| async {
                Arc::new(SurfaceGeometryResolver::new(
                    self.storage.clone(),
                    self.write_lock.clone(),
                    self.config.batch_size,
                ))
            })
            .await
            .clone()
    }

    pub async fn texture_param(&self) -> Arc<TextureParamResolver> {
        self.texture_param
            .get_or_init(|| async {
                Arc::new(TextureParamResolver::new(
                    self.storage.clone(),
                    self.config.batch_size,
                ))
            })
            .await
            .clone()
    }

    pub async fn texture_coord_list(&self) -> Arc<TextureCoordListResolver> {
        self.texture_coord_list
            .get_or_init(|| async {
                Arc::new(TextureCoordListResolver::new(self.storage.clone()))
            })
            .await
            .clone()
    }

    pub async fn texture_association(&self) -> Arc<TextureAssociationResolver> {
        self.texture_association
            .get_or_init(|| async {
                Arc::new(TextureAssociationResolver::new(
                    self.storage.clone(),
                    self.config.batch_size,
                ))
            })
            .await
            .clone()
    }

    pub async fn deprecated_material(&self) -> Arc<DeprecatedMaterialResolver> {
        self.deprecated_material
            .get_or_init(|| async {
                Arc::new(DeprecatedMaterialResolver::new(
                    self.storage.clone(),
                    self.config.batch_size,
                ))
            })
            .await
            .clone()
    }

    pub async fn texture_image(&self) -> Arc<TextureImageResolver> {
        self.texture_image
            .get_or_init(|| async {
                Arc::new(TextureImageResolver::new(
                    self.storage.clone(),
                    self.config.import_dir(),
                    self.config.batch_size,
                ))
            })
            .await
            .clone()
    }

    pub async fn world_file(&self) -> Arc<WorldFileResolver> {
        self.world_file
            .get_or_init(|| async {
                Arc::new(WorldFileResolver::new(
                    self.storage.clone(),
                    self.config.import_dir(),
                    self.config.srid,
                    self.config.batch_size,
                ))
            })
            .await
            .clone()
    }

    /// Route a pending reference to the resolver of its kind.
    pub async fn resolve(&self, pending: &PendingReference) -> Result<Resolution> {
        match pending {
            PendingReference::Basic(x) => self.basic().await?.resolve(x, self).await,
            PendingReference::Group(x) => self.group().await.resolve(x, self).await,
            PendingReference::SurfaceGeometry(x) => {
                self.surface_geometry().await.resolve(x, self).await
            }
            PendingReference::TextureParam(x) => self.texture_param().await.resolve(x, self).await,
            PendingReference::TextureCoordList(x) => {
                self.texture_coord_list().await.resolve(x, self).await
            }
            PendingReference::TextureAssociation(x) => {
                self.texture_association().await.resolve(x, self).await
            }
            PendingReference::DeprecatedMaterial(x) => {
                self.deprecated_material().await.resolve(x, self).await
            }
            PendingReference::TextureImage(x) => self.texture_image().await.resolve(x, self).await,
            PendingReference::WorldFile(x) => self.world_file().await.resolve(x, self).await,
        }
    }

    // === Shared resources ===

    pub async fn allocate_id(&self, sequence: Sequence) -> Result<i64> {
        Ok(self.storage.next_id(sequence).await?)
    }

    /// Schedule a reference for the next pass of its phase.
    pub async fn enqueue(&self, pending: PendingReference) -> Result<()> {
        self.requeue.submit(pending.into_next_pass()).await?;
        Ok(())
    }

    /// Wait until every re-queued reference has been written back.
    pub async fn await_requeued(&self) {
        self.requeue.await_idle().await;
    }

    fn constructed(&self) -> Vec<Arc<dyn XlinkResolver>> {
        let mut resolvers: Vec<Arc<dyn XlinkResolver>> = Vec::new();
        if let Some(r) = self.basic.get() {
            resolvers.push(r.clone());
        }
        if let Some(r) = self.group.get() {
            resolvers.push(r.clone());
        }
        if let Some(r) = self.surface_geometry.get() {
            resolvers.push(r.clone());
        }
        if let Some(r) = self.texture_param.get() {
            resolvers.push(r.clone());
        }
        if let Some(r) = self.texture_coord_list.get() {
            resolvers.push(r.clone());
        }
        if let Some(r) = self.texture_association.get() {
            resolvers.push(r.clone());
        }
        if let Some(r) = self.deprecated_material.get() {
            resolvers.push(r.clone());
        }
        if let Some(r) = self.texture_image.get() {
            resolvers.push(r.clone());
        }
        if let Some(r) = self.world_file.get() {
            resolvers.push(r.clone());
        }
        resolvers
    }

    /// Flush every resolver built so far.
    pub async fn flush(&self) -> Result<()> {
        for resolver in self.constructed() {
            resolver.flush().await?;
        }
        Ok(())
    }

    /// Close every resolver, even after a failure, then stop the re-queue pool.
    /// Returns the first failure.
    pub async fn close(&self) -> Result<()> {
        self.requeue.await_idle().await;

        let mut first_error = None;
        for resolver in self.constructed() {
            if let Err(e) = resolver.close().await {
                tracing::error!("Failed to close {} resolver: {}", resolver.kind(), e);
                first_error.get_or_insert(e);
            }
        }
        self.requeue.shutdown().await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
