//! Bounded worker pool with a blocking `submit` and an idle barrier.
//!
//! Workers share one bounded receiver. Every submitted item carries an
//! in-flight guard, so the in-flight count drops even when an item is discarded
//! unprocessed. Each item runs in its own task; a panic fails only that item.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::XlinkError;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool '{0}' is closed")]
    Closed(String),
}

/// Processes one work item.
#[async_trait::async_trait]
pub trait WorkHandler<T>: Send + Sync + 'static {
    async fn handle(&self, item: T) -> Result<(), XlinkError>;
}

/// First failure reported by any worker; later failures are only logged.
#[derive(Clone, Default)]
pub struct ErrorSlot {
    inner: Arc<ErrorSlotInner>,
}

#[derive(Default)]
struct ErrorSlotInner {
    is_set: std::sync::atomic::AtomicBool,
    error: std::sync::Mutex<Option<XlinkError>>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, error: XlinkError) {
        let mut slot = self
            .inner
            .error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(error);
            self.inner.is_set.store(true, Ordering::SeqCst);
        } else {
            tracing::debug!("Additional worker failure: {}", error);
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.is_set.load(Ordering::SeqCst)
    }

    pub fn take(&self) -> Option<XlinkError> {
        let mut slot = self
            .inner
            .error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let error = slot.take();
        self.inner.is_set.store(false, Ordering::SeqCst);
        error
    }
}

/// RAII guard that decrements the in-flight counter on drop
struct InFlightGuard {
    counter: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl InFlightGuard {
    fn acquire(counter: &Arc<AtomicUsize>, idle: &Arc<Notify>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: counter.clone(),
            idle: idle.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

struct Job<T> {
    item: T,
    _guard: InFlightGuard,
}

pub struct WorkerPool<T> {
    name: String,
    sender: std::sync::Mutex<Option<mpsc::Sender<Job<T>>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    processed: Arc<AtomicU64>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new<H>(
        name: &str,
        workers: usize,
        capacity: usize,
        handler: Arc<H>,
        errors: ErrorSlot,
    ) -> Self
    where
        H: WorkHandler<T>,
    {
        let (tx, rx) = mpsc::channel::<Job<T>>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let processed = Arc::new(AtomicU64::new(0));

        let handles = (0..workers.max(1))
            .map(|_| {
                let rx = rx.clone();
                let handler = handler.clone();
                let errors = errors.clone();
                let processed = processed.clone();
                let name = name.to_string();
                tokio::spawn(async move {
                    pool_worker(name, rx, handler, errors, processed).await;
                })
            })
            .collect();

        tracing::debug!("Worker pool '{}' started with {} workers", name, workers.max(1));

        Self {
            name: name.to_string(),
            sender: std::sync::Mutex::new(Some(tx)),
            workers: std::sync::Mutex::new(handles),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            processed,
        }
    }

    /// Queue one item; waits while the queue is full.
    pub async fn submit(&self, item: T) -> Result<(), PoolError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| PoolError::Closed(self.name.clone()))?;

        let job = Job {
            item,
            _guard: InFlightGuard::acquire(&self.in_flight, &self.idle),
        };
        sender
            .send(job)
            .await
            .map_err(|_| PoolError::Closed(self.name.clone()))
    }

    /// Wait until every submitted item has completed.
    pub async fn await_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Stop accepting work, let the workers drain the queue and join them.
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(sender);

        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Worker of pool '{}' ended abnormally: {}", self.name, e);
            }
        }
        tracing::debug!(
            "Worker pool '{}' shut down after {} items",
            self.name,
            self.processed()
        );
    }
}

async fn pool_worker<T, H>(
    name: String,
    rx: Arc<Mutex<mpsc::Receiver<Job<T>>>>,
    handler: Arc<H>,
    errors: ErrorSlot,
    processed: Arc<AtomicU64>,
) where
    T: Send + 'static,
    H: WorkHandler<T>,
{
    loop {
        // Lock receiver, grab one job, release lock immediately
        let job = {
            let mut rx_guard = rx.lock().await;
            rx_guard.recv().await
        };

        let Some(Job { item, _guard }) = job else {
            break; // Channel closed, queue drained
        };

        let task_handler = handler.clone();
        match tokio::spawn(async move { task_handler.handle(item).await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.record(e),
            Err(e) => {
                tracing::error!("Work item in pool '{}' panicked: {}", name, e);
                errors.record(XlinkError::Internal(anyhow::anyhow!(
                    "work item in pool '{}' failed: {}",
                    name,
                    e
                )));
            }
        }
        processed.fetch_add(1, Ordering::Relaxed);
        // `_guard` drops here, after the item has completed
    }
}
