//! Flush scheduler.
//!
//! Three triggers call [`SyncEngine::attempt_flush`]: a repeating timer,
//! the "back online" signal and a manual sync request. Every trigger spawns
//! a flush; the engine's single-flight guard turns overlapping ones into
//! no-ops, and the next tick picks up whatever they would have done.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::api::RemoteApi;
use super::cancel::CancelToken;
use super::engine::SyncEngine;

/// Why a flush was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Tick,
    Online,
    Manual,
}

/// Handle to a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SyncTrigger>,
    cancel: CancelToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Connectivity came back; flush now.
    pub fn notify_online(&self) {
        self.trigger(SyncTrigger::Online);
    }

    /// User asked to sync.
    pub fn sync_now(&self) {
        self.trigger(SyncTrigger::Manual);
    }

    fn trigger(&self, trigger: SyncTrigger) {
        // A full channel already has a flush pending.
        if self.tx.try_send(trigger).is_err() {
            tracing::trace!(?trigger, "Trigger dropped");
        }
    }

    /// Stop the timer and wait for the scheduler loop to exit. Flushes
    /// already spawned run to completion unless the engine is shut down.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Scheduler task ended abnormally");
        }
    }
}

/// Start the scheduler on the current tokio runtime.
pub fn spawn_scheduler<A>(engine: Arc<SyncEngine<A>>) -> SchedulerHandle
where
    A: RemoteApi + 'static,
{
    let (tx, mut rx) = mpsc::channel(4);
    let cancel = CancelToken::new();
    let stop = cancel.clone();
    let engine_stop = engine.cancel_token();

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(engine.settings().flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let trigger = tokio::select! {
                () = stop.cancelled() => break,
                () = engine_stop.cancelled() => break,
                _ = interval.tick() => SyncTrigger::Tick,
                trigger = rx.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
            };
            tracing::trace!(?trigger, "Flush triggered");
            let engine = engine.clone();
            tokio::spawn(async move {
                let report = engine.attempt_flush().await;
                if !report.skipped && !report.is_empty() {
                    tracing::debug!(?trigger, ?report, "Scheduled flush done");
                }
            });
        }
        tracing::debug!("Scheduler stopped");
    });

    SchedulerHandle { tx, cancel, task }
}
