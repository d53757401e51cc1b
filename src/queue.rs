use crate::constants::SLICE_QUEUE_BUFFER;
use crate::job::{JobOutcome, SliceJob};
use crate::slicer::{Slicer, SlicerError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

type Request = (SliceJob, oneshot::Sender<JobReport>);

/// A job handed back by the worker together with its result.
#[derive(Debug)]
pub struct JobReport {
    pub job: SliceJob,
    pub result: Result<JobOutcome, SlicerError>,
}

#[derive(Error, Debug)]
pub enum QueueError {
    /// Another job is already waiting; the submitted job is returned untouched.
    #[error("Slicer is busy with another model")]
    Busy { job: SliceJob },
    #[error("Slice queue is shut down")]
    Closed { job: SliceJob },
    #[error("Slice worker stopped before reporting a result")]
    Worker,
}

/// A slice queue that runs at most one slicer job at a time on a background
/// worker, keeping the interactive side free while mandoline runs.
#[derive(Clone)]
pub struct SliceQueue {
    sender: Arc<Mutex<Option<mpsc::Sender<Request>>>>,
    /// Shared reference to the worker handle for graceful shutdown.
    worker_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SliceQueue {
    /// Creates a queue with a dedicated worker task. Must be called inside a
    /// tokio runtime.
    ///
    /// The worker runs each job through `spawn_blocking`, since the slicer
    /// blocks until its child process exits.
    pub fn new(slicer: Arc<dyn Slicer>) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Request>(SLICE_QUEUE_BUFFER);

        let handle = tokio::spawn(async move {
            while let Some((mut job, reply)) = receiver.recv().await {
                let slicer = Arc::clone(&slicer);
                let start = std::time::Instant::now();
                let report = tokio::task::spawn_blocking(move || {
                    let result = job.run(slicer.as_ref());
                    JobReport { job, result }
                })
                .await;
                match report {
                    Ok(report) => {
                        tracing::info!(
                            "Slice job for {} completed in {:.2}s",
                            report.job.source().display(),
                            start.elapsed().as_secs_f64()
                        );
                        // Ignore send error if the submitter went away
                        let _ = reply.send(report);
                    }
                    Err(e) => tracing::error!("Slice task failed: {}", e),
                }
            }
            tracing::debug!("Slice worker shutting down");
        });

        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            worker_handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Submits a job and waits for the worker to report back.
    ///
    /// If a job is already waiting behind the running one, the new job is
    /// rejected with [`QueueError::Busy`] instead of piling up.
    pub async fn submit(&self, job: SliceJob) -> Result<JobReport, QueueError> {
        let sender = self.sender.lock().await.clone();
        let Some(sender) = sender else {
            return Err(QueueError::Closed { job });
        };

        let (reply, result_receiver) = oneshot::channel();
        match sender.try_send((job, reply)) {
            Ok(()) => {}
            Err(TrySendError::Full((job, _))) => {
                tracing::debug!("Slice queue full, rejecting {}", job.source().display());
                return Err(QueueError::Busy { job });
            }
            Err(TrySendError::Closed((job, _))) => return Err(QueueError::Closed { job }),
        }
        result_receiver.await.map_err(|_| QueueError::Worker)
    }

    /// Stops accepting jobs and waits for the worker to finish what it holds.
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();

        let handle = self.worker_handle.lock().await.take();
        if let Some(h) = handle {
            match h.await {
                Ok(()) => tracing::debug!("Slice worker shut down cleanly"),
                Err(e) => tracing::warn!("Slice worker panicked: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::CountingSlicer;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    /// Blocks every validation until the test releases it.
    struct GatedSlicer {
        gate: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl Slicer for GatedSlicer {
        fn validate(&self, _source: &Path) -> Result<(), SlicerError> {
            let _ = self.gate.lock().unwrap().recv();
            Ok(())
        }

        fn slice(&self, _source: &Path, _output: &Path) -> Result<(), SlicerError> {
            Ok(())
        }
    }

    struct PanickingSlicer;

    impl Slicer for PanickingSlicer {
        fn validate(&self, _source: &Path) -> Result<(), SlicerError> {
            panic!("slicer crashed");
        }

        fn slice(&self, _source: &Path, _output: &Path) -> Result<(), SlicerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_submit_runs_job() {
        let slicer = Arc::new(CountingSlicer::default());
        let queue = SliceQueue::new(slicer.clone());

        let report = queue
            .submit(SliceJob::new("part.stl", "part.gcode"))
            .await
            .unwrap();
        assert_eq!(report.result.unwrap(), JobOutcome::Sliced);
        assert!(report.job.is_sliced());

        // The returned job remembers it was sliced.
        let again = queue.submit(report.job).await.unwrap();
        assert_eq!(again.result.unwrap(), JobOutcome::AlreadySliced);
        assert_eq!(slicer.slices.load(Ordering::SeqCst), 1);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_is_reported_with_job() {
        let slicer = Arc::new(CountingSlicer {
            fail_validation: true,
            ..Default::default()
        });
        let queue = SliceQueue::new(slicer);
        let report = queue
            .submit(SliceJob::new("part.stl", "part.gcode"))
            .await
            .unwrap();
        assert!(matches!(
            report.result,
            Err(SlicerError::ValidationFailed { .. })
        ));
        assert!(!report.job.is_validated());
    }

    #[tokio::test]
    async fn test_rejects_when_full() {
        let (release, gate) = std::sync::mpsc::channel();
        let queue = SliceQueue::new(Arc::new(GatedSlicer {
            gate: std::sync::Mutex::new(gate),
        }));

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.submit(SliceJob::new("a.stl", "a.gcode")).await }
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        let second = tokio::spawn({
            let queue = queue.clone();
            async move { queue.submit(SliceJob::new("b.stl", "b.gcode")).await }
        });
        tokio::time::sleep(Duration::from_millis(150)).await;

        let third = queue.submit(SliceJob::new("c.stl", "c.gcode")).await;
        match third {
            Err(QueueError::Busy { job }) => assert_eq!(job.source(), Path::new("c.stl")),
            other => panic!("expected Busy, got {:?}", other.map(|r| r.job)),
        }

        release.send(()).unwrap();
        release.send(()).unwrap();
        assert!(first.await.unwrap().unwrap().result.is_ok());
        assert!(second.await.unwrap().unwrap().result.is_ok());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let queue = SliceQueue::new(Arc::new(CountingSlicer::default()));
        queue.shutdown().await;
        let err = queue
            .submit(SliceJob::new("part.stl", "part.gcode"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Closed { .. }));
    }

    #[tokio::test]
    async fn test_worker_panic_is_reported() {
        let queue = SliceQueue::new(Arc::new(PanickingSlicer));
        let err = queue
            .submit(SliceJob::new("part.stl", "part.gcode"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Worker));

        // The worker survives a crashed job.
        let err = queue
            .submit(SliceJob::new("other.stl", "other.gcode"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Worker));
    }
}
