//! Background processing of completed calls.
//!
//! Call completion never waits on the pipeline: `submit` only enqueues.
//! A call is skipped while a run for it is in flight; once that run has
//! finished the call may be submitted again.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use crate::{PipelineResult, PipelineRunner};

/// Notification that a call finished and its transcript is stored
#[derive(Debug, Clone)]
pub struct CallCompleted {
    pub call_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("pipeline queue is closed")]
    Closed,
}

pub struct PipelineQueue {
    sender: mpsc::Sender<CallCompleted>,
    worker: JoinHandle<Vec<PipelineResult>>,
}

impl PipelineQueue {
    /// Start the worker. At most `max_concurrent` pipelines run at once.
    pub fn start(runner: Arc<PipelineRunner>, max_concurrent: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(work(runner, receiver, max_concurrent.max(1)));
        Self { sender, worker }
    }

    pub async fn submit(&self, call_id: impl Into<String>) -> Result<(), QueueError> {
        self.sender
            .send(CallCompleted {
                call_id: call_id.into(),
            })
            .await
            .map_err(|_| QueueError::Closed)
    }

    /// Stop accepting calls and wait for everything queued to finish.
    pub async fn shutdown(self) -> Vec<PipelineResult> {
        drop(self.sender);
        match self.worker.await {
            Ok(results) => results,
            Err(e) => {
                error!(error = %e, "Pipeline queue worker failed");
                Vec::new()
            }
        }
    }
}

async fn work(
    runner: Arc<PipelineRunner>,
    mut receiver: mpsc::Receiver<CallCompleted>,
    max_concurrent: usize,
) -> Vec<PipelineResult> {
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut in_flight = HashSet::new();
    let mut tasks = JoinSet::new();
    let mut results = Vec::new();

    while let Some(event) = receiver.recv().await {
        // Collect whatever has already finished
        while let Some(joined) = tasks.try_join_next() {
            collect(joined, &mut in_flight, &mut results);
        }

        if !in_flight.insert(event.call_id.clone()) {
            debug!(call_id = %event.call_id, "Call already being processed, skipping");
            continue;
        }

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let runner = runner.clone();
        info!(call_id = %event.call_id, "Starting pipeline for completed call");
        tasks.spawn(async move {
            let _permit = permit;
            runner.run(&event.call_id).await
        });
    }

    while let Some(joined) = tasks.join_next().await {
        collect(joined, &mut in_flight, &mut results);
    }
    results
}

fn collect(
    joined: Result<PipelineResult, tokio::task::JoinError>,
    in_flight: &mut HashSet<String>,
    results: &mut Vec<PipelineResult>,
) {
    match joined {
        Ok(result) => {
            in_flight.remove(&result.call_id);
            results.push(result);
        }
        Err(e) => error!(error = %e, "Pipeline task panicked"),
    }
}
