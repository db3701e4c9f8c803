use super::{BatchBuffer, Reference, Resolution, ResolverManager, XlinkResolver};
use crate::cache::LookupKind;
use crate::error::Result;
use crate::models::{object_class, GroupXlink, PendingReference, XlinkKind};
use crate::storage::{GroupWrite, SqliteStorage};

/// CityObjectGroup members and parent pointers.
pub struct GroupResolver {
    storage: SqliteStorage,
    batch: BatchBuffer<GroupWrite>,
}

impl GroupResolver {
    pub fn new(storage: SqliteStorage, batch_size: usize) -> Self {
        Self {
            storage,
            batch: BatchBuffer::new(batch_size),
        }
    }

    pub async fn resolve(
        &self,
        xlink: &GroupXlink,
        manager: &ResolverManager,
    ) -> Result<Resolution> {
        let Reference::Local(gmlid) = Reference::parse(&xlink.gmlid) else {
            return Ok(Resolution::Skipped(format!(
                "remote reference '{}'",
                xlink.gmlid
            )));
        };

        // Members may already be in the store from an earlier import
        let Some(target) = manager
            .identifiers()
            .resolve(gmlid, LookupKind::Feature, true)
            .await?
        else {
            return Ok(Resolution::Unresolved);
        };

        // A nested group that still waits for its own references of the same
        // direction is handled in a later pass
        if target.object_class == object_class::CITY_OBJECT_GROUP
            && self
                .storage
                .has_pending_group(target.id, xlink.is_parent, xlink.pass)
                .await?
        {
            manager
                .enqueue(PendingReference::Group(xlink.clone()))
                .await?;
            return Ok(Resolution::Deferred);
        }

        let write = if xlink.is_parent {
            GroupWrite::Parent {
                group_id: xlink.group_id,
                parent_id: target.id,
            }
        } else {
            GroupWrite::Member {
                group_id: xlink.group_id,
                cityobject_id: target.id,
                role: xlink.role.clone(),
            }
        };

        if self.batch.push(write).await {
            self.flush().await?;
        }
        Ok(Resolution::Resolved)
    }
}

#[async_trait::async_trait]
impl XlinkResolver for GroupResolver {
    fn kind(&self) -> XlinkKind {
        XlinkKind::Group
    }

    async fn flush(&self) -> Result<()> {
        let writes = self.batch.take().await;
        if writes.is_empty() {
            return Ok(());
        }
        self.storage.write_group_batch(&writes).await?;
        tracing::debug!("Flushed {} group references", writes.len());
        Ok(())
    }
}
