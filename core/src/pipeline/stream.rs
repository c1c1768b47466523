//! Streaming execution: one tokio task per stage joined by bounded queues.
//!
//! CPU work runs on the blocking pool so stage tasks only shuttle frames.
//! Shutdown stops ingestion before the next frame; frames already in flight
//! drain through the remaining stages.

use super::Pipeline;
use crate::config::QueuePolicy;
use crate::cube::IqCube;
use crate::interface::capture::RawFrame;
use crate::interface::detection::FrameDetections;
use crate::prelude::{ParseError, ProcessingStage, StageError, StageResult};
use crate::telemetry::log::LogManager;
use crate::telemetry::metrics::MetricsRecorder;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Result of offering an item to a [`FrameQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Accepted after discarding the oldest queued item.
    DroppedOldest,
    /// The consumer has gone away; the item was discarded.
    Closed,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO between two stage tasks.
pub struct FrameQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    policy: QueuePolicy,
    readable: Notify,
    writable: Notify,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize, policy: QueuePolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
            }),
            capacity: capacity.max(1),
            policy,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for room under [`QueuePolicy::Block`]; evicts the oldest item
    /// under [`QueuePolicy::DropOldest`].
    pub async fn push(&self, item: T) -> PushOutcome {
        let mut item = Some(item);
        loop {
            let notified = self.writable.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    return PushOutcome::Closed;
                }
                let outcome = if state.items.len() < self.capacity {
                    Some(PushOutcome::Accepted)
                } else if self.policy == QueuePolicy::DropOldest {
                    state.items.pop_front();
                    Some(PushOutcome::DroppedOldest)
                } else {
                    None
                };
                if let Some(outcome) = outcome {
                    if let Some(item) = item.take() {
                        state.items.push_back(item);
                    }
                    drop(state);
                    self.readable.notify_one();
                    return outcome;
                }
            }
            notified.await;
        }
    }

    /// Next item in arrival order, or `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.readable.notified();
            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.writable.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuses further pushes. Queued items remain available to `pop`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        self.readable.notify_one();
        self.writable.notify_one();
    }
}

/// Runs a [`Pipeline`] as concurrent stage tasks on the current tokio
/// runtime.
pub struct StreamingPipeline {
    pipeline: Arc<Pipeline>,
    logger: LogManager,
}

impl StreamingPipeline {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            logger: LogManager::for_stage("stream"),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn queue<T>(&self) -> Arc<FrameQueue<T>> {
        let stream = &self.pipeline.config.stream;
        Arc::new(FrameQueue::new(stream.queue_depth, stream.policy))
    }

    /// Processes `frames` until the source is exhausted or `shutdown` turns
    /// true. Reports arrive in frame order minus any dropped or skipped
    /// frames.
    pub async fn run<I>(
        &self,
        frames: I,
        shutdown: watch::Receiver<bool>,
    ) -> StageResult<Vec<FrameDetections>>
    where
        I: IntoIterator<Item = Result<RawFrame, ParseError>>,
        I::IntoIter: Send + 'static,
    {
        let metrics = Arc::clone(&self.pipeline.metrics);
        let cubes = self.queue();
        let calibrated = self.queue();
        let maps = self.queue();
        let beamformed = self.queue();
        let cfar = self.queue();
        let reports = self.queue();

        let source = spawn_source(
            Arc::clone(&self.pipeline),
            frames.into_iter(),
            Arc::clone(&cubes),
            Arc::clone(&metrics),
            shutdown,
        );
        let p = Arc::clone(&self.pipeline);
        let calibrate = spawn_stage(
            "calibration",
            Arc::clone(&cubes),
            Arc::clone(&calibrated),
            Arc::clone(&metrics),
            move |cube| p.calibration.execute(cube),
        );
        let p = Arc::clone(&self.pipeline);
        let transform = spawn_stage(
            "range_doppler",
            Arc::clone(&calibrated),
            Arc::clone(&maps),
            Arc::clone(&metrics),
            move |cube| p.range_doppler.execute(cube),
        );
        let p = Arc::clone(&self.pipeline);
        let beamform = spawn_stage(
            "beamform",
            Arc::clone(&maps),
            Arc::clone(&beamformed),
            Arc::clone(&metrics),
            move |map| p.beamformer.execute(map),
        );
        let p = Arc::clone(&self.pipeline);
        let detect = spawn_stage(
            "cfar",
            Arc::clone(&beamformed),
            Arc::clone(&cfar),
            Arc::clone(&metrics),
            move |frame| p.cfar.execute(frame),
        );
        let p = Arc::clone(&self.pipeline);
        let assemble = spawn_stage(
            "assembler",
            Arc::clone(&cfar),
            Arc::clone(&reports),
            Arc::clone(&metrics),
            move |frame| p.assemble(frame),
        );

        let mut collected = Vec::new();
        while let Some(report) = reports.pop().await {
            self.pipeline.record(&report);
            collected.push(report);
        }

        let mut first_error = None;
        for handle in [source, calibrate, transform, beamform, detect, assemble] {
            let outcome = handle
                .await
                .map_err(|err| StageError::Internal(format!("stage task failed: {}", err)))
                .and_then(|result| result);
            if let Err(err) = outcome {
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_error {
            self.logger.warn(&format!("stream aborted: {}", err));
            return Err(err);
        }

        let summary = metrics.snapshot();
        self.logger.record(&format!(
            "stream drained: {} processed, {} skipped, {} dropped",
            summary.frames_processed, summary.frames_skipped, summary.frames_dropped
        ));
        Ok(collected)
    }
}

/// Forwards `item` downstream, counting evictions. Returns false once the
/// downstream queue is closed.
async fn forward<T>(queue: &FrameQueue<T>, item: T, metrics: &MetricsRecorder) -> bool {
    match queue.push(item).await {
        PushOutcome::Accepted => true,
        PushOutcome::DroppedOldest => {
            metrics.record_dropped();
            true
        }
        PushOutcome::Closed => false,
    }
}

/// Per-frame errors skip the frame; fatal ones end the task.
fn triage(logger: &LogManager, metrics: &MetricsRecorder, err: StageError) -> StageResult<()> {
    if err.is_fatal() {
        logger.warn(&format!("fatal: {}", err));
        return Err(err);
    }
    logger.warn(&format!("skipping frame: {}", err));
    metrics.record_skipped();
    Ok(())
}

fn spawn_source<S>(
    pipeline: Arc<Pipeline>,
    mut frames: S,
    output: Arc<FrameQueue<IqCube>>,
    metrics: Arc<MetricsRecorder>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<StageResult<()>>
where
    S: Iterator<Item = Result<RawFrame, ParseError>> + Send + 'static,
{
    tokio::spawn(async move {
        let logger = LogManager::for_stage("ingest");
        let result = async {
            loop {
                let stop = *shutdown.borrow();
                if stop {
                    logger.record("shutdown requested, ingestion stopped");
                    break;
                }
                let Some(item) = frames.next() else {
                    break;
                };
                let frame = match item {
                    Ok(frame) => frame,
                    Err(err) => {
                        triage(&logger, &metrics, err.into())?;
                        continue;
                    }
                };
                let stage = Arc::clone(&pipeline);
                let decoded = tokio::task::spawn_blocking(move || stage.ingestor.execute(frame))
                    .await
                    .map_err(|err| StageError::Internal(format!("ingest worker: {}", err)))?;
                match decoded {
                    Ok(cube) => {
                        if !forward(&output, cube, &metrics).await {
                            break;
                        }
                    }
                    Err(err) => triage(&logger, &metrics, err)?,
                }
            }
            Ok::<(), StageError>(())
        }
        .await;
        output.close();
        result
    })
}

fn spawn_stage<I, O, F>(
    name: &'static str,
    input: Arc<FrameQueue<I>>,
    output: Arc<FrameQueue<O>>,
    metrics: Arc<MetricsRecorder>,
    work: F,
) -> JoinHandle<StageResult<()>>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> StageResult<O> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    tokio::spawn(async move {
        let logger = LogManager::for_stage(name);
        let result = async {
            while let Some(item) = input.pop().await {
                let work = Arc::clone(&work);
                let outcome = tokio::task::spawn_blocking(move || work(item))
                    .await
                    .map_err(|err| StageError::Internal(format!("{} worker: {}", name, err)))?;
                match outcome {
                    Ok(next) => {
                        if !forward(&output, next, &metrics).await {
                            break;
                        }
                    }
                    Err(err) => triage(&logger, &metrics, err)?,
                }
            }
            Ok::<(), StageError>(())
        }
        .await;
        output.close();
        // Upstream pushes now see a closed queue and stop.
        input.close();
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn block_policy_preserves_order() {
        let queue = Arc::new(FrameQueue::new(2, QueuePolicy::Block));
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for i in 0..10 {
                    assert_eq!(queue.push(i).await, PushOutcome::Accepted);
                }
                queue.close();
            })
        };
        let mut seen = Vec::new();
        while let Some(item) = queue.pop().await {
            seen.push(item);
        }
        producer.await.unwrap();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn drop_oldest_evicts_front() {
        let queue = FrameQueue::new(2, QueuePolicy::DropOldest);
        assert_eq!(queue.push(1).await, PushOutcome::Accepted);
        assert_eq!(queue.push(2).await, PushOutcome::Accepted);
        assert_eq!(queue.push(3).await, PushOutcome::DroppedOldest);
        queue.close();
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn closed_queue_refuses_pushes() {
        let queue = FrameQueue::new(1, QueuePolicy::Block);
        queue.close();
        assert_eq!(queue.push(7).await, PushOutcome::Closed);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn close_wakes_blocked_producer() {
        let queue = Arc::new(FrameQueue::new(1, QueuePolicy::Block));
        queue.push(1).await;
        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(2).await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(blocked.await.unwrap(), PushOutcome::Closed);
    }
}
