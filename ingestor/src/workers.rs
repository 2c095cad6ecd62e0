use crate::errors::{Error, Result};
use crate::ingest::{decode, report_drop, Pipeline};
use crate::metrics::{BATCH_SIZE, CHANNEL_FULL_TOTAL, INGEST_LATENCY_SECONDS, READINGS_DROPPED_TOTAL};
use crate::model::{Reading, SensorPayload};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub workers: usize,
    pub channel_capacity: usize,
    pub max_batch: usize,
    pub max_wait_ms: u64,
}

/// Routes decoded payloads to workers. All payloads of one device go to the
/// same worker, which keeps their order.
///
/// Dropping the dispatcher closes every worker channel; workers then flush
/// what they hold and stop.
pub struct Dispatcher {
    shards: Vec<mpsc::Sender<SensorPayload>>,
}

impl Dispatcher {
    pub fn shard_for(&self, device_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Decodes a raw payload and queues it for its device's worker.
    pub async fn dispatch(&self, payload: &[u8]) -> Result<()> {
        let candidate = decode(payload)?;
        let tx = &self.shards[self.shard_for(&candidate.device_id)];

        match tx.try_send(candidate) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(candidate)) => {
                CHANNEL_FULL_TOTAL.inc();
                debug!("Worker channel full, waiting for capacity");
                tx.send(candidate).await.map_err(|_| Error::ChannelSend)
            }
            Err(TrySendError::Closed(_)) => {
                error!("Worker channel closed, cannot queue telemetry");
                Err(Error::ChannelSend)
            }
        }
    }
}

pub fn spawn_workers(
    pipeline: Arc<Pipeline>,
    settings: WorkerSettings,
) -> (Dispatcher, Vec<JoinHandle<()>>) {
    let workers = settings.workers.max(1);
    let mut shards = Vec::with_capacity(workers);
    let mut handles = Vec::with_capacity(workers);

    for id in 0..workers {
        let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
        let pipeline = pipeline.clone();
        handles.push(tokio::spawn(async move {
            run_worker(id, rx, pipeline, settings.max_batch, settings.max_wait_ms).await;
        }));
        shards.push(tx);
    }

    info!("Started {} ingestion workers", workers);
    (Dispatcher { shards }, handles)
}

async fn run_worker(
    id: usize,
    mut rx: mpsc::Receiver<SensorPayload>,
    pipeline: Arc<Pipeline>,
    max_batch: usize,
    max_wait_ms: u64,
) {
    debug!(
        "Worker {} starting with max_batch={}, max_wait_ms={}",
        id, max_batch, max_wait_ms
    );

    let max_batch = max_batch.max(1);
    let mut buffer: Vec<Reading> = Vec::with_capacity(max_batch);
    let mut ticker = interval(Duration::from_millis(max_wait_ms.max(1)));

    loop {
        tokio::select! {
            candidate = rx.recv() => {
                match candidate {
                    Some(candidate) => {
                        match pipeline.admit(candidate).await {
                            Ok(reading) => buffer.push(reading),
                            Err(e) => report_drop(&e),
                        }

                        if buffer.len() >= max_batch {
                            flush_batch(&pipeline, &mut buffer).await;
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        debug!("Worker {} channel closed, flushing remaining batch", id);
                        flush_batch(&pipeline, &mut buffer).await;
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_batch(&pipeline, &mut buffer).await;
                }
            }
        }
    }

    debug!("Worker {} stopped", id);
}

/// Writes the buffered readings in one statement. Failures are not retried.
async fn flush_batch(pipeline: &Pipeline, buffer: &mut Vec<Reading>) {
    let batch_len = buffer.len();
    if batch_len == 0 {
        return;
    }

    debug!("Flushing batch of {} readings", batch_len);
    BATCH_SIZE.set(batch_len as f64);

    let start = Instant::now();
    match pipeline.persist(buffer).await {
        Ok(()) => {
            INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
            debug!(
                "Batch stored in {:.3}s",
                start.elapsed().as_secs_f64()
            );
        }
        Err(e) => {
            READINGS_DROPPED_TOTAL.inc_by(batch_len as f64);
            error!("Failed to store batch of {} readings, dropping it: {}", batch_len, e);
        }
    }

    buffer.clear();
}
