//! Partitioned worker pool
//!
//! Each topic gets a fixed set of workers. An event is assigned to a worker
//! by its partition (`partition % workers`), or by a blake3 hash of its
//! partition key when it has no partition, so one partition is always
//! processed in order by a single worker while partitions run in parallel.

use crate::config::WorkerConfig;
use crate::error::{PipelineError, Result};
use crate::orchestrator::{Disposition, Pipeline};
use crate::types::InboundEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Worker index for an event among `workers` workers
pub fn lane_for(event: &InboundEvent, workers: usize) -> usize {
    let workers = workers.max(1);
    match event.partition {
        Some(partition) => partition as usize % workers,
        None => {
            let hash = blake3::hash(event.partition_key.as_bytes());
            let bytes = hash.as_bytes();
            let hash_u32 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            hash_u32 as usize % workers
        }
    }
}

/// Workers of one topic
struct TopicLanes {
    senders: Vec<mpsc::Sender<InboundEvent>>,
}

/// Fixed-size worker pool per topic
pub struct WorkerPool {
    pipeline: Arc<Pipeline>,
    config: WorkerConfig,
    topics: Mutex<HashMap<String, TopicLanes>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Create pool; workers for a topic start on its first event
    pub fn new(pipeline: Arc<Pipeline>, config: WorkerConfig, cancel: CancellationToken) -> Self {
        Self {
            pipeline,
            config,
            topics: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
            cancel,
        }
    }

    /// Create pool and start workers for `topics` up front
    pub fn start(
        pipeline: Arc<Pipeline>,
        config: WorkerConfig,
        topics: &[&str],
        cancel: CancellationToken,
    ) -> Self {
        let pool = Self::new(pipeline, config, cancel);
        {
            let mut lanes = pool.topics.lock();
            for topic in topics {
                lanes.insert(topic.to_string(), pool.spawn_lanes(topic));
            }
        }
        pool
    }

    /// Queue an event on its partition's worker; waits while that worker's
    /// queue is full
    pub async fn submit(&self, event: InboundEvent) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Unavailable(
                "worker pool is shutting down".to_string(),
            ));
        }

        let sender = {
            let mut topics = self.topics.lock();
            let lanes = topics
                .entry(event.source_topic.clone())
                .or_insert_with(|| self.spawn_lanes(&event.source_topic));
            let lane = lane_for(&event, lanes.senders.len());
            lanes.senders[lane].clone()
        };

        sender
            .send(event)
            .await
            .map_err(|_| PipelineError::Unavailable("worker stopped".to_string()))
    }

    /// Number of workers per topic
    pub fn workers_per_topic(&self) -> usize {
        self.config.workers_per_topic.max(1)
    }

    /// Stop accepting events, finish everything queued, then return
    pub async fn close(self) {
        self.topics.lock().clear();
        self.join().await;
    }

    /// Stop now: in-flight events finish their current step, queued events
    /// stay unacknowledged
    pub async fn shutdown(self) {
        info!("Shutting down worker pool");
        self.cancel.cancel();
        self.topics.lock().clear();
        self.join().await;
    }

    async fn join(self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker task failed: {}", e);
            }
        }
        info!("Worker pool stopped");
    }

    fn spawn_lanes(&self, topic: &str) -> TopicLanes {
        let workers = self.workers_per_topic();
        let queue_depth = self.config.queue_depth.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = self.handles.lock();

        for worker in 0..workers {
            let (tx, rx) = mpsc::channel(queue_depth);
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                topic.to_string(),
                worker,
                rx,
                self.pipeline.clone(),
                self.cancel.clone(),
            )));
        }

        info!(topic, workers, "Started topic workers");
        TopicLanes { senders }
    }
}

async fn run_worker(
    topic: String,
    worker: usize,
    mut rx: mpsc::Receiver<InboundEvent>,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
) {
    debug!(topic = %topic, worker, "Worker started");

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };

        let event_id = event.event_id.clone();
        if let Disposition::Redeliver = pipeline.process(event).await {
            debug!(topic = %topic, worker, event_id = %event_id, "Event left for redelivery");
        }
    }

    // Whatever is still queued was never acked and will be redelivered
    rx.close();
    debug!(topic = %topic, worker, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_lane_by_partition() {
        let event = InboundEvent::new("E1", "AML_ALERT", Map::new()).at("t", 7, 0);
        assert_eq!(lane_for(&event, 3), 1);
        assert_eq!(lane_for(&event, 1), 0);
    }

    #[test]
    fn test_lane_by_key_is_stable() {
        let a = InboundEvent::new("E1", "AML_ALERT", Map::new()).keyed("C-1");
        let b = InboundEvent::new("E2", "KYC_VIOLATION", Map::new()).keyed("C-1");

        let lane = lane_for(&a, 4);
        assert!(lane < 4);
        assert_eq!(lane, lane_for(&b, 4));
    }
}
