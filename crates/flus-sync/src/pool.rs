use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::engine::{SyncEngine, SyncOutcome};

/// Bounded queue of item ids drained by at most `workers` concurrent syncs.
/// Duplicate ids are harmless; the engine collapses them per item.
pub struct SyncWorkerPool {
    engine: Arc<SyncEngine>,
    sender: Mutex<Option<mpsc::Sender<String>>>,
    shutdown: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncWorkerPool {
    pub fn start(engine: Arc<SyncEngine>, workers: usize, queue_depth: usize) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel(queue_depth.max(1));
        let (shutdown, stop) = watch::channel(false);
        let dispatcher = tokio::spawn(dispatch(engine.clone(), receiver, stop, workers));
        info!(workers, queue_depth, "sync worker pool started");
        Self {
            engine,
            sender: Mutex::new(Some(sender)),
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Returns `false` when the queue is full or the pool is closed; the
    /// request is dropped and a later trigger picks the item up.
    pub fn enqueue(&self, item_id: &str) -> bool {
        let sender = guard(&self.sender);
        let Some(sender) = sender.as_ref() else {
            warn!(item_id, "sync pool closed; request dropped");
            return false;
        };
        match sender.try_send(item_id.to_string()) {
            Ok(()) => {
                debug!(item_id, "sync queued");
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(item_id, "sync queue full; request dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(item_id, "sync pool closed; request dropped");
                false
            }
        }
    }

    /// Stops accepting work. Queued items still run.
    pub fn close(&self) {
        guard(&self.sender).take();
    }

    /// Closes the queue and waits for every queued and running sync.
    pub async fn drain(&self) {
        self.close();
        let handle = guard(&self.dispatcher).take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "sync dispatcher ended abnormally");
            }
        }
    }

    /// Cancels running syncs at their next page boundary, discards the
    /// queue, and waits for workers to finish.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.drain().await;
        info!("sync worker pool stopped");
    }
}

async fn dispatch(
    engine: Arc<SyncEngine>,
    mut receiver: mpsc::Receiver<String>,
    mut stop: watch::Receiver<bool>,
    workers: usize,
) {
    let permits = Arc::new(Semaphore::new(workers));
    let mut running = JoinSet::new();
    loop {
        let item_id = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            next = receiver.recv() => match next {
                Some(item_id) => item_id,
                None => break,
            },
        };
        let permit = tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let engine = engine.clone();
        let cancel = stop.clone();
        running.spawn(async move {
            let _permit = permit;
            match engine.sync_with_cancel(&item_id, cancel).await {
                Ok(report) if report.outcome == SyncOutcome::Completed => {}
                Ok(report) => warn!(item_id = %item_id, outcome = ?report.outcome, "queued sync did not complete"),
                Err(err) => warn!(item_id = %item_id, error = %err, "queued sync failed"),
            }
        });
        while running.try_join_next().is_some() {}
    }
    while let Some(joined) = running.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "sync worker panicked");
        }
    }
}
