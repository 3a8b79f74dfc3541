//! Fixed-size pool of OS threads for CPU-bound geometry work.
//!
//! Jobs are typed messages sent over a bounded channel. Candidate geometry
//! for clip and overlap jobs arrives over a second bounded channel owned by
//! the job, so a slow worker applies backpressure to the dataset reader.
//! Every job produces a [`JobResult`]; errors and panics are reported in it
//! and never cross the pool boundary.

use crate::error::{EngineError, Result};
use geo::MultiPolygon;
use overlay_core::models::{ClipOp, FragmentHash, GeographyId};
use overlay_geo::area::{area_square_km, planar_area_square_km};
use overlay_geo::transform::to_equal_area;
use overlay_geo::{
    clip_sketch_to_polygons, content_hash, decompose_overlaps, overlap_area_by_class,
    CandidateError, ClipOutcome, CoverOptions, FragmentPiece, OverlapCandidate, OverlapOutcome,
    PreparedSketch,
};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub type Candidate<T> = std::result::Result<T, CandidateError>;

/// Clip a sketch against streamed candidate polygons
pub struct ClipJob {
    pub request_id: Uuid,
    pub sketch: Arc<PreparedSketch>,
    pub op: ClipOp,
    pub candidates: mpsc::Receiver<Candidate<MultiPolygon<f64>>>,
}

/// Sum target-feature area inside a geography
pub struct OverlapJob {
    pub request_id: Uuid,
    pub geography: Arc<PreparedSketch>,
    pub group_by: Option<String>,
    pub candidates: mpsc::Receiver<Candidate<OverlapCandidate>>,
}

/// Wrap an intermediate result as a sketch, building its cover
pub struct PrepareJob {
    pub request_id: Uuid,
    pub geometry: MultiPolygon<f64>,
    pub cover: CoverOptions,
}

/// Split overlapping geography clips into hashed fragment pieces
pub struct DecomposeJob {
    pub request_id: Uuid,
    pub clips: Vec<(GeographyId, MultiPolygon<f64>)>,
}

/// Measure area in km²
pub struct MeasureJob {
    pub request_id: Uuid,
    pub geometry: MultiPolygon<f64>,
    /// Measure in EPSG:6933 instead of geodesically
    pub equal_area: bool,
}

/// Arbitrary CPU-bound closure
pub struct TaskJob {
    pub request_id: Uuid,
    pub task: Box<dyn FnOnce() -> Result<JobValue> + Send>,
}

pub enum Job {
    Clip(ClipJob),
    Overlap(OverlapJob),
    Prepare(PrepareJob),
    Decompose(DecomposeJob),
    Measure(MeasureJob),
    Task(TaskJob),
}

#[derive(Debug)]
pub enum JobValue {
    Clip(ClipOutcome),
    Overlap(OverlapOutcome),
    Prepared(Box<PreparedSketch>),
    Pieces(Vec<(FragmentHash, FragmentPiece)>),
    Area { square_km: f64 },
}

impl JobValue {
    fn kind(&self) -> &'static str {
        match self {
            JobValue::Clip(_) => "clip",
            JobValue::Overlap(_) => "overlap",
            JobValue::Prepared(_) => "prepared",
            JobValue::Pieces(_) => "pieces",
            JobValue::Area { .. } => "area",
        }
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    Success(JobValue),
    Failure(EngineError),
}

#[derive(Debug)]
pub struct JobResult {
    pub request_id: Uuid,
    pub outcome: JobOutcome,
}

impl JobResult {
    pub fn into_result(self) -> Result<JobValue> {
        match self.outcome {
            JobOutcome::Success(value) => Ok(value),
            JobOutcome::Failure(e) => Err(e),
        }
    }

    pub fn into_clip(self) -> Result<ClipOutcome> {
        let request_id = self.request_id;
        match self.into_result()? {
            JobValue::Clip(outcome) => Ok(outcome),
            other => Err(EngineError::UnexpectedResult { request_id, got: other.kind() }),
        }
    }

    pub fn into_overlap(self) -> Result<OverlapOutcome> {
        let request_id = self.request_id;
        match self.into_result()? {
            JobValue::Overlap(outcome) => Ok(outcome),
            other => Err(EngineError::UnexpectedResult { request_id, got: other.kind() }),
        }
    }

    pub fn into_prepared(self) -> Result<PreparedSketch> {
        let request_id = self.request_id;
        match self.into_result()? {
            JobValue::Prepared(sketch) => Ok(*sketch),
            other => Err(EngineError::UnexpectedResult { request_id, got: other.kind() }),
        }
    }

    pub fn into_pieces(self) -> Result<Vec<(FragmentHash, FragmentPiece)>> {
        let request_id = self.request_id;
        match self.into_result()? {
            JobValue::Pieces(pieces) => Ok(pieces),
            other => Err(EngineError::UnexpectedResult { request_id, got: other.kind() }),
        }
    }

    pub fn into_area(self) -> Result<f64> {
        let request_id = self.request_id;
        match self.into_result()? {
            JobValue::Area { square_km } => Ok(square_km),
            other => Err(EngineError::UnexpectedResult { request_id, got: other.kind() }),
        }
    }
}

/// Drain a candidate channel from a worker thread
fn blocking_iter<T>(mut rx: mpsc::Receiver<T>) -> impl Iterator<Item = T> {
    std::iter::from_fn(move || rx.blocking_recv())
}

impl Job {
    pub fn request_id(&self) -> Uuid {
        match self {
            Job::Clip(j) => j.request_id,
            Job::Overlap(j) => j.request_id,
            Job::Prepare(j) => j.request_id,
            Job::Decompose(j) => j.request_id,
            Job::Measure(j) => j.request_id,
            Job::Task(j) => j.request_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Job::Clip(_) => "clip",
            Job::Overlap(_) => "overlap",
            Job::Prepare(_) => "prepare",
            Job::Decompose(_) => "decompose",
            Job::Measure(_) => "measure",
            Job::Task(_) => "task",
        }
    }

    fn run(self) -> Result<JobValue> {
        match self {
            Job::Clip(job) => {
                let outcome = clip_sketch_to_polygons(&job.sketch, job.op, blocking_iter(job.candidates))?;
                Ok(JobValue::Clip(outcome))
            }
            Job::Overlap(job) => {
                let outcome = overlap_area_by_class(
                    &job.geography,
                    job.group_by.as_deref(),
                    blocking_iter(job.candidates),
                )?;
                Ok(JobValue::Overlap(outcome))
            }
            Job::Prepare(job) => {
                Ok(JobValue::Prepared(Box::new(PreparedSketch::from_geometry(job.geometry, job.cover))))
            }
            Job::Decompose(job) => {
                let pieces = decompose_overlaps(&job.clips)
                    .into_iter()
                    .map(|piece| (content_hash(&piece.geometry, &piece.geography_ids), piece))
                    .collect();
                Ok(JobValue::Pieces(pieces))
            }
            Job::Measure(job) => {
                let square_km = if job.equal_area {
                    planar_area_square_km(&to_equal_area(&job.geometry)?)
                } else {
                    area_square_km(&job.geometry)
                };
                Ok(JobValue::Area { square_km })
            }
            Job::Task(job) => (job.task)(),
        }
    }
}

struct Envelope {
    job: Job,
    reply: oneshot::Sender<JobResult>,
}

/// Pool of worker threads created once at start-up.
///
/// The shared receiver uses `Mutex::unwrap()`; jobs run outside the lock
/// under `catch_unwind`, so the lock cannot be poisoned by a failing job.
pub struct WorkerPool {
    sender: Option<mpsc::Sender<Envelope>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` worker threads sharing a queue of `channel_capacity` jobs
    pub fn new(size: usize, channel_capacity: usize) -> Result<Self> {
        if size == 0 {
            return Err(overlay_core::OverlayError::ConfigInvalid {
                key: "worker_threads".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }

        let (sender, receiver) = mpsc::channel(channel_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("overlay-worker-{}", index))
                .spawn(move || worker_loop(index, receiver))
                .map_err(overlay_core::OverlayError::from)?;
            workers.push(handle);
        }

        tracing::info!(workers = size, queue = channel_capacity, "worker pool started");
        Ok(Self { sender: Some(sender), workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job; the receiver resolves with its result
    pub async fn submit(&self, job: Job) -> Result<oneshot::Receiver<JobResult>> {
        let sender = self.sender.as_ref().ok_or(EngineError::PoolClosed)?;
        let (reply, result) = oneshot::channel();
        sender.send(Envelope { job, reply }).await.map_err(|_| EngineError::PoolClosed)?;
        Ok(result)
    }

    /// Queue a job and wait for its result
    pub async fn run(&self, job: Job) -> Result<JobResult> {
        let result = self.submit(job).await?;
        result.await.map_err(|_| EngineError::PoolClosed)
    }

    /// Run a closure on a worker thread
    pub async fn run_task<F>(&self, task: F) -> Result<JobResult>
    where
        F: FnOnce() -> Result<JobValue> + Send + 'static,
    {
        self.run(Job::Task(TaskJob { request_id: Uuid::new_v4(), task: Box::new(task) })).await
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue lets idle workers exit; busy ones finish their job first
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn worker_loop(index: usize, receiver: Arc<Mutex<mpsc::Receiver<Envelope>>>) {
    loop {
        let envelope = receiver.lock().unwrap().blocking_recv();
        let Some(Envelope { job, reply }) = envelope else {
            tracing::debug!(worker = index, "worker exiting");
            break;
        };

        let request_id = job.request_id();
        let kind = job.kind();
        tracing::debug!(worker = index, %request_id, kind, "job started");

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
            Ok(Ok(value)) => JobOutcome::Success(value),
            Ok(Err(e)) => {
                tracing::warn!(worker = index, %request_id, kind, error = %e, "job failed");
                JobOutcome::Failure(e)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(worker = index, %request_id, kind, %message, "job panicked");
                JobOutcome::Failure(EngineError::WorkerPanic { request_id, message })
            }
        };

        // The submitter may have gone away; the result is dropped then
        let _ = reply.send(JobResult { request_id, outcome });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn square(size: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![polygon![
            (x: 0.0, y: 0.0), (x: size, y: 0.0), (x: size, y: size), (x: 0.0, y: size), (x: 0.0, y: 0.0)
        ]])
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        assert!(matches!(
            WorkerPool::new(0, 4),
            Err(EngineError::Overlay(overlay_core::OverlayError::ConfigInvalid { .. }))
        ));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let pool = WorkerPool::new(1, 4).unwrap();
        let result = pool.run_task(|| panic!("boom")).await.unwrap();
        match result.outcome {
            JobOutcome::Failure(EngineError::WorkerPanic { request_id, message }) => {
                assert_eq!(request_id, result.request_id);
                assert_eq!(message, "boom");
            }
            other => panic!("expected panic failure, got {:?}", other),
        }

        // The worker survives and keeps serving jobs
        let area = pool.run_task(|| Ok(JobValue::Area { square_km: 2.0 })).await.unwrap();
        assert_eq!(area.into_area().unwrap(), 2.0);
    }

    #[tokio::test]
    async fn test_clip_job_streams_candidates() {
        let pool = WorkerPool::new(2, 4).unwrap();
        let sketch = Arc::new(PreparedSketch::from_geometry(square(10.0), CoverOptions::with_target(8)));
        let (tx, rx) = mpsc::channel(1);
        let request_id = Uuid::new_v4();

        let pending = pool
            .submit(Job::Clip(ClipJob { request_id, sketch, op: ClipOp::Intersect, candidates: rx }))
            .await
            .unwrap();
        for _ in 0..5 {
            tx.send(Ok(square(4.0))).await.unwrap();
        }
        drop(tx);

        let result = pending.await.unwrap();
        assert_eq!(result.request_id, request_id);
        let outcome = result.into_clip().unwrap();
        assert_eq!(outcome.stats.candidates, 5);
        assert!(outcome.changed);
    }

    #[tokio::test]
    async fn test_wrong_result_kind() {
        let pool = WorkerPool::new(1, 1).unwrap();
        let result = pool.run_task(|| Ok(JobValue::Area { square_km: 1.0 })).await.unwrap();
        assert!(matches!(result.into_clip(), Err(EngineError::UnexpectedResult { got: "area", .. })));
    }
}
