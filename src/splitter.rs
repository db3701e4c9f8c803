//! Phase driver: drains the staging queues in dependency order through the
//! worker pool and runs the fixpoint loop for self-referencing kinds.
//!
//! Phases: Basic → Group (recursive) → Appearance (coordinate lists, parameters,
//! images and world files, then associations) → DeprecatedMaterial →
//! SurfaceGeometry (recursive). Every phase ends with an idle barrier and a
//! flush, so a later phase always sees the writes of the earlier ones.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::{EventSink, ImportEvent};
use crate::models::{PendingReference, XlinkKind};
use crate::pool::{ErrorSlot, WorkHandler, WorkerPool};
use crate::resolver::{Resolution, ResolverManager};
use crate::storage::SqliteStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Basic,
    Group,
    Appearance,
    DeprecatedMaterial,
    SurfaceGeometry,
}

impl Phase {
    pub const ORDER: [Phase; 5] = [
        Phase::Basic,
        Phase::Group,
        Phase::Appearance,
        Phase::DeprecatedMaterial,
        Phase::SurfaceGeometry,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Basic => "basic",
            Phase::Group => "group",
            Phase::Appearance => "appearance",
            Phase::DeprecatedMaterial => "deprecated_material",
            Phase::SurfaceGeometry => "surface_geometry",
        }
    }

    /// Kinds of this phase, grouped into barrier-separated stages.
    pub fn stages(&self) -> &'static [&'static [XlinkKind]] {
        match self {
            Phase::Basic => &[&[XlinkKind::Basic]],
            Phase::Group => &[&[XlinkKind::Group]],
            Phase::Appearance => &[
                &[
                    XlinkKind::TextureCoordList,
                    XlinkKind::TextureParam,
                    XlinkKind::TextureImage,
                    XlinkKind::WorldFile,
                ],
                &[XlinkKind::TextureAssociation],
            ],
            Phase::DeprecatedMaterial => &[&[XlinkKind::DeprecatedMaterial]],
            Phase::SurfaceGeometry => &[&[XlinkKind::SurfaceGeometry]],
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-phase outcome counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub resolved: u64,
    pub deferred: u64,
    pub retried: u64,
    pub unresolved: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    resolved: AtomicU64,
    deferred: AtomicU64,
    retried: AtomicU64,
    unresolved: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    /// Read and reset.
    fn take(&self) -> Counts {
        Counts {
            resolved: self.resolved.swap(0, Ordering::SeqCst),
            deferred: self.deferred.swap(0, Ordering::SeqCst),
            retried: self.retried.swap(0, Ordering::SeqCst),
            unresolved: self.unresolved.swap(0, Ordering::SeqCst),
            skipped: self.skipped.swap(0, Ordering::SeqCst),
            failed: self.failed.swap(0, Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub passes: i64,
    pub counts: Counts,
    /// Rows left in the queue when a cycle stopped the phase.
    pub abandoned: i64,
    pub cycle_detected: bool,
}

impl PhaseReport {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            passes: 0,
            counts: Counts::default(),
            abandoned: 0,
            cycle_detected: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    SuccessWithWarnings,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub phases_completed: usize,
    pub cycles_detected: Vec<Phase>,
    pub cancelled: bool,
    pub phases: Vec<PhaseReport>,
    pub resolved: u64,
    pub skipped: u64,
    pub unresolved: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            phases_completed: 0,
            cycles_detected: Vec::new(),
            cancelled: false,
            phases: Vec::new(),
            resolved: 0,
            skipped: 0,
            unresolved: 0,
            started_at: now,
            finished_at: now,
        }
    }

    fn record(&mut self, report: PhaseReport) {
        self.resolved += report.counts.resolved;
        self.skipped += report.counts.skipped;
        self.unresolved += report.counts.unresolved + report.abandoned.max(0) as u64;
        if report.cycle_detected {
            self.cycles_detected.push(report.phase);
        }
        self.phases.push(report);
    }

    pub fn status(&self) -> RunStatus {
        if self.cancelled {
            RunStatus::Cancelled
        } else if !self.cycles_detected.is_empty() || self.skipped > 0 || self.unresolved > 0 {
            RunStatus::SuccessWithWarnings
        } else {
            RunStatus::Success
        }
    }
}

/// Resolves one pending reference and files the outcome.
struct XlinkWorker {
    manager: Arc<ResolverManager>,
    counters: Arc<Counters>,
    events: EventSink,
}

#[async_trait::async_trait]
impl WorkHandler<PendingReference> for XlinkWorker {
    async fn handle(&self, item: PendingReference) -> Result<()> {
        let kind = item.kind();
        match self.manager.resolve(&item).await {
            Ok(Resolution::Resolved) => {
                self.counters.resolved.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Resolution::Deferred) => {
                self.counters.deferred.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Resolution::Unresolved) if kind.is_recursive() => {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                self.manager.enqueue(item).await?;
            }
            Ok(Resolution::Unresolved) => {
                tracing::warn!(
                    "Unresolved {} reference '{}'",
                    kind,
                    item.reference()
                );
                self.counters.unresolved.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Resolution::Skipped(reason)) => {
                tracing::error!(
                    "Skipping {} reference '{}': {}",
                    kind,
                    item.reference(),
                    reason
                );
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                self.events.emit(ImportEvent::ReferenceSkipped {
                    kind,
                    reference: item.reference().to_string(),
                    reason,
                });
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.events.emit(ImportEvent::ReferenceFailed {
                    kind,
                    reference: item.reference().to_string(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        }
        Ok(())
    }
}

enum Flow {
    Continue,
    Cancelled,
}

/// Drives one resolution run over every staging queue.
pub struct ReferenceSplitter {
    storage: SqliteStorage,
    manager: Arc<ResolverManager>,
    pool: WorkerPool<PendingReference>,
    counters: Arc<Counters>,
    events: EventSink,
    errors: ErrorSlot,
    cancel: CancellationToken,
}

impl ReferenceSplitter {
    pub fn new(manager: Arc<ResolverManager>, cancel: CancellationToken) -> Self {
        let counters = Arc::new(Counters::default());
        let events = manager.events().clone();
        let errors = manager.errors().clone();
        let config = manager.config().clone();

        let pool = WorkerPool::new(
            "xlink",
            config.workers,
            config.queue_capacity,
            Arc::new(XlinkWorker {
                manager: manager.clone(),
                counters: counters.clone(),
                events: events.clone(),
            }),
            errors.clone(),
        );

        Self {
            storage: manager.storage().clone(),
            manager,
            pool,
            counters,
            events,
            errors,
            cancel,
        }
    }

    /// Stop after the work already submitted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run every phase. Resolvers are closed and the pool is stopped on every
    /// exit path; the first failure wins.
    pub async fn run(&self) -> Result<RunResult> {
        let mut result = RunResult::new();
        tracing::info!("XLink resolution started");

        let outcome = self.run_phases(&mut result).await;

        self.pool.await_idle().await;
        self.pool.shutdown().await;
        let closed = self.manager.close().await;
        result.finished_at = Utc::now();

        match (outcome, closed) {
            (Err(e), closed) => {
                if let Err(close_error) = closed {
                    tracing::error!("Failed to close resolvers after error: {}", close_error);
                }
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => {
                tracing::info!(
                    "Resolution finished: {} resolved, {} skipped, {} unresolved, cycles in {:?}",
                    result.resolved,
                    result.skipped,
                    result.unresolved,
                    result.cycles_detected
                );
                Ok(result)
            }
        }
    }

    async fn run_phases(&self, result: &mut RunResult) -> Result<()> {
        for phase in Phase::ORDER {
            if self.cancel.is_cancelled() {
                self.cancelled(phase, result);
                return Ok(());
            }

            self.events.emit(ImportEvent::PhaseStarted {
                phase: phase.name().to_string(),
            });
            tracing::info!("Phase {} started", phase);

            let mut report = PhaseReport::new(phase);
            let flow = if phase.stages().len() == 1 && phase.stages()[0][0].is_recursive() {
                self.run_recursive(phase, phase.stages()[0][0], &mut report).await?
            } else {
                self.run_stages(phase, &mut report).await?
            };
            report.counts = self.counters.take();

            tracing::info!(
                "Phase {} done: {} resolved, {} deferred, {} skipped, {} unresolved in {} passes",
                phase,
                report.counts.resolved,
                report.counts.deferred,
                report.counts.skipped,
                report.counts.unresolved + report.abandoned.max(0) as u64,
                report.passes
            );
            result.record(report);

            if let Flow::Cancelled = flow {
                self.cancelled(phase, result);
                return Ok(());
            }
            result.phases_completed += 1;
            self.events.emit(ImportEvent::PhaseCompleted {
                phase: phase.name().to_string(),
            });
        }
        Ok(())
    }

    fn cancelled(&self, phase: Phase, result: &mut RunResult) {
        tracing::warn!("Resolution cancelled in phase {}", phase);
        result.cancelled = true;
        self.events.emit(ImportEvent::Cancelled {
            phase: phase.name().to_string(),
        });
    }

    /// Non-recursive kinds: one pass per stage, then the queues are emptied.
    async fn run_stages(&self, phase: Phase, report: &mut PhaseReport) -> Result<Flow> {
        for kinds in phase.stages() {
            for kind in kinds.iter() {
                self.storage.reset_passes(*kind).await?;
            }

            let mut flow = Flow::Continue;
            for kind in kinds.iter() {
                if let Flow::Cancelled = self.submit_pass(*kind, 0).await? {
                    flow = Flow::Cancelled;
                    break;
                }
            }
            self.barrier().await?;
            report.passes += 1;

            if let Flow::Cancelled = flow {
                return Ok(Flow::Cancelled);
            }
            for kind in kinds.iter() {
                self.storage.truncate_staging(*kind).await?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Fixpoint loop: repeat passes until nothing is re-queued or the number of
    /// re-queued rows stops shrinking.
    async fn run_recursive(
        &self,
        phase: Phase,
        kind: XlinkKind,
        report: &mut PhaseReport,
    ) -> Result<Flow> {
        self.storage.reset_passes(kind).await?;
        let mut remaining = -1i64;
        let mut pass = 0i64;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }

            self.storage.create_staging_index(kind).await?;
            let flow = self.submit_pass(kind, pass).await?;
            self.barrier().await?;
            if let Flow::Cancelled = flow {
                return Ok(Flow::Cancelled);
            }

            let unresolved = self.storage.count_pending(kind, pass + 1).await?;
            self.storage.delete_pass(kind, pass).await?;
            report.passes += 1;
            self.events.emit(ImportEvent::PassCompleted {
                phase: phase.name().to_string(),
                pass,
                unresolved,
            });
            tracing::debug!("Phase {} pass {}: {} rows left", phase, pass, unresolved);

            if unresolved == 0 {
                return Ok(Flow::Continue);
            }
            if unresolved == remaining {
                self.report_cycle(phase, kind, pass + 1, unresolved).await?;
                report.cycle_detected = true;
                report.abandoned = unresolved;
                return Ok(Flow::Continue);
            }
            remaining = unresolved;
            pass += 1;
        }
    }

    /// Every row still queued is named in the log; the rows stay in the queue.
    async fn report_cycle(
        &self,
        phase: Phase,
        kind: XlinkKind,
        pass: i64,
        unresolved: i64,
    ) -> Result<()> {
        tracing::error!(
            "Cyclic or unresolvable references in phase {}: {} rows abandoned",
            phase,
            unresolved
        );
        self.events.emit(ImportEvent::CycleDetected {
            phase: phase.name().to_string(),
            unresolved,
        });

        let mut rows = self.storage.stream_pending(kind, pass);
        while let Some(row) = rows.try_next().await? {
            tracing::error!("Abandoned {} reference '{}'", kind, row.reference());
        }
        Ok(())
    }

    async fn submit_pass(&self, kind: XlinkKind, pass: i64) -> Result<Flow> {
        let mut rows = self.storage.stream_pending(kind, pass);
        let mut submitted = 0u64;
        while let Some(row) = rows.try_next().await? {
            if self.cancel.is_cancelled() {
                tracing::debug!("Stopped {} after {} rows", kind, submitted);
                return Ok(Flow::Cancelled);
            }
            self.pool.submit(row).await?;
            submitted += 1;
        }
        if submitted > 0 {
            tracing::debug!("Submitted {} {} rows of pass {}", submitted, kind, pass);
        }
        Ok(Flow::Continue)
    }

    /// Wait for the workers and the re-queue writer, surface the first worker
    /// failure, then write every buffered mutation.
    async fn barrier(&self) -> Result<()> {
        self.pool.await_idle().await;
        self.manager.await_requeued().await;
        if let Some(e) = self.errors.take() {
            return Err(e);
        }
        self.manager.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PolygonPayload;
    use crate::models::{object_class, xlink_flag, BasicXlink};
    use crate::test_support::{
        insert_cityobject, insert_geometry, insert_group, node, pending_geometry, pending_group,
        test_manager, test_storage,
    };

    async fn splitter(storage: &SqliteStorage) -> ReferenceSplitter {
        let manager = Arc::new(test_manager(storage.clone()).await);
        ReferenceSplitter::new(manager, CancellationToken::new())
    }

    fn member(group_id: i64, gmlid: &str) -> PendingReference {
        pending_group(group_id, gmlid, false)
    }

    #[tokio::test]
    async fn test_nested_groups_converge() {
        let (storage, _temp) = test_storage().await;
        for (id, gmlid) in [(1, "G1"), (2, "G2"), (3, "G3")] {
            insert_group(&storage, id, gmlid).await;
        }
        insert_cityobject(&storage, 5, "B1", object_class::BUILDING).await;
        // G1 contains G2 contains G3 contains B1
        for row in [member(1, "G2"), member(2, "G3"), member(3, "B1")] {
            storage.push_pending(&row).await.unwrap();
        }

        let splitter = splitter(&storage).await;
        let mut events = splitter.events.subscribe();
        let result = splitter.run().await.unwrap();

        let group = result.phases.iter().find(|r| r.phase == Phase::Group).unwrap();
        assert_eq!(group.passes, 3);
        assert!(!group.cycle_detected);
        assert_eq!(group.counts.resolved, 3);
        assert_eq!(result.status(), RunStatus::Success);
        assert_eq!(result.phases_completed, 5);
        assert_eq!(storage.count_rows("group_to_cityobject").await.unwrap(), 3);
        assert_eq!(storage.count_rows("tmp_group_to_cityobject").await.unwrap(), 0);

        let mut passes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ImportEvent::PassCompleted { pass, unresolved, .. } = event {
                passes.push((pass, unresolved));
            }
        }
        assert_eq!(passes, vec![(0, 2), (1, 1), (2, 0)]);
    }

    #[tokio::test]
    async fn test_group_cycle_is_reported_once() {
        let (storage, _temp) = test_storage().await;
        insert_group(&storage, 1, "G1").await;
        insert_group(&storage, 2, "G2").await;
        insert_group(&storage, 3, "G3").await;
        insert_cityobject(&storage, 5, "B1", object_class::BUILDING).await;
        // G1 and G2 name each other as parent
        for row in [
            pending_group(1, "G2", true),
            pending_group(2, "G1", true),
            member(3, "B1"),
        ] {
            storage.push_pending(&row).await.unwrap();
        }

        let splitter = splitter(&storage).await;
        let mut events = splitter.events.subscribe();
        let result = splitter.run().await.unwrap();

        assert_eq!(result.cycles_detected, vec![Phase::Group]);
        assert_eq!(result.status(), RunStatus::SuccessWithWarnings);
        let group = result.phases.iter().find(|r| r.phase == Phase::Group).unwrap();
        assert!(group.cycle_detected);
        assert_eq!(group.abandoned, 2);

        // The acyclic membership went through; the cyclic rows stay queued
        let members: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT cityobject_id, cityobjectgroup_id FROM group_to_cityobject",
        )
        .fetch_all(storage.pool())
        .await
        .unwrap();
        assert_eq!(members, vec![(5, 3)]);
        assert_eq!(storage.count_pending(XlinkKind::Group, 2).await.unwrap(), 2);

        let mut cycles = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ImportEvent::CycleDetected { .. }) {
                cycles += 1;
            }
        }
        assert_eq!(cycles, 1);
    }

    #[tokio::test]
    async fn test_end_to_end_run() {
        let (storage, _temp) = test_storage().await;
        insert_cityobject(&storage, 8, "WIN_1", object_class::OPENING).await;
        storage
            .push_pending(&PendingReference::Basic(BasicXlink {
                id: 1,
                from_table: "thematic_surface".to_string(),
                to_table: "opening".to_string(),
                attr_name: None,
                gmlid: "#WIN_1".to_string(),
                pass: 0,
            }))
            .await
            .unwrap();

        let payload = PolygonPayload::new(
            0,
            3,
            vec![vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]],
        )
        .unwrap()
        .encode()
        .unwrap();
        let mut shell = node(1, Some("shell"), None, 1);
        shell.is_composite = true;
        let mut a = node(2, Some("a"), Some(1), 1);
        a.geometry = Some(payload.clone());
        let mut b = node(3, Some("b"), Some(1), 1);
        b.geometry = Some(payload);
        for row in [shell, a, b] {
            insert_geometry(&storage, &row).await;
        }
        storage
            .push_pending(&pending_geometry(100, 0, 0, "#shell"))
            .await
            .unwrap();

        let result = splitter(&storage).await.run().await.unwrap();
        assert_eq!(result.phases_completed, 5);
        assert_eq!(result.resolved, 2);
        assert!(result.cycles_detected.is_empty());
        assert_eq!(result.status(), RunStatus::Success);

        assert_eq!(storage.count_rows("opening_to_them_surface").await.unwrap(), 1);
        let copies: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM surface_geometry WHERE is_xlink = ?")
                .bind(xlink_flag::COPY)
                .fetch_one(storage.pool())
                .await
                .unwrap();
        assert_eq!(copies.0, 3);
        let referenced: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM surface_geometry WHERE is_xlink = ?")
                .bind(xlink_flag::REFERENCED)
                .fetch_one(storage.pool())
                .await
                .unwrap();
        assert_eq!(referenced.0, 1);
        assert_eq!(storage.count_rows("tmp_basic").await.unwrap(), 0);
        assert_eq!(storage.count_rows("tmp_surface_geometry").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_keeps_queues() {
        let (storage, _temp) = test_storage().await;
        storage.push_pending(&member(1, "G2")).await.unwrap();

        let splitter = splitter(&storage).await;
        splitter.cancel();
        let result = splitter.run().await.unwrap();

        assert!(result.cancelled);
        assert_eq!(result.status(), RunStatus::Cancelled);
        assert_eq!(result.phases_completed, 0);
        assert_eq!(storage.count_rows("tmp_group_to_cityobject").await.unwrap(), 1);
    }
}
