use crate::core::broadcaster::{Observer, TelemetryBroadcaster};
use crate::core::error::ControlError;
use crate::core::events::{TelemetryEvent, TransferEvent};
use crate::core::model::{JobId, JobLease, JobSnapshot, JobState};
use crate::core::registry::{owned_by, vacate_if_owner, JobRegistry};
use crate::plugins::transfer::{EventStream, TransferControl, TransferEngine};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartAccepted {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAccepted {
    Requested,
    AlreadyRequested,
}

enum Flow {
    Continue,
    Finished,
}

/// Drives the single job: accepts start/cancel control calls and turns engine events into
/// telemetry. The registry lock is the only synchronization point for both paths.
#[derive(Clone)]
pub struct Coordinator {
    registry: Arc<JobRegistry>,
    engine: Arc<dyn TransferEngine>,
    telemetry: TelemetryBroadcaster,
    out_dir: PathBuf,
    cancel_timeout: Option<Duration>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<JobRegistry>,
        engine: Arc<dyn TransferEngine>,
        telemetry: TelemetryBroadcaster,
        out_dir: PathBuf,
        cancel_timeout: Option<Duration>,
    ) -> Self {
        Self { registry, engine, telemetry, out_dir, cancel_timeout }
    }

    pub fn subscribe(&self) -> Observer {
        self.telemetry.subscribe()
    }

    pub fn status(&self) -> Option<JobSnapshot> {
        self.registry.peek()
    }

    pub async fn start(&self, resource_id: &str) -> Result<StartAccepted, ControlError> {
        let resource_id = resource_id.trim();
        if resource_id.is_empty() {
            return Err(ControlError::MissingResourceId);
        }

        let lease = self.registry.try_occupy(resource_id, self.out_dir.clone())?;
        if self.engine.is_tracking(resource_id) {
            warn!(resource_id, engine = self.engine.name(), "engine still holds this resource");
            self.registry.release(lease.id);
            return Err(ControlError::AlreadyActive);
        }

        let handle = match self.engine.begin(resource_id, &self.out_dir).await {
            Ok(h) => h,
            Err(e) => {
                warn!(resource_id, "begin failed: {}", e);
                self.registry.release(lease.id);
                return Err(e.into());
            }
        };

        let control: Arc<dyn TransferControl> = Arc::from(handle.control);
        let cancel_pending = {
            let mut slot = self.registry.lock();
            match owned_by(&mut slot, lease.id) {
                Some(job) => {
                    job.control = Some(control.clone());
                    job.state == JobState::Terminating
                }
                None => {
                    drop(slot);
                    error!(job = %lease.id, "slot lost before the transfer was attached");
                    let _ = control.cancel();
                    return Err(ControlError::EngineUnavailable("job was released during startup".to_string()));
                }
            }
        };

        info!(job = %lease.id, resource_id, engine = self.engine.name(), "job started");
        self.spawn_job(lease.clone(), handle.events);

        if cancel_pending {
            if let Err(e) = control.cancel() {
                let err = ControlError::from(e);
                error!(job = %lease.id, "{}", err);
                self.abort_job(lease.id, err.to_string());
            }
        }

        Ok(StartAccepted { job_id: lease.id })
    }

    pub fn cancel(&self) -> Result<CancelAccepted, ControlError> {
        let mut slot = self.registry.lock();
        let Some(job) = slot.as_mut() else {
            return Err(ControlError::NoActiveJob);
        };
        if job.state == JobState::Terminating {
            return Ok(CancelAccepted::AlreadyRequested);
        }

        job.state = JobState::Terminating;
        job.lease.cancel_requested.cancel();
        let job_id = job.id;

        // Not attached yet: `start` issues the cancel once the handle exists.
        let Some(control) = job.control.clone() else {
            info!(job = %job_id, "cancel requested before engine handle attached");
            return Ok(CancelAccepted::Requested);
        };

        match control.cancel() {
            Ok(()) => {
                info!(job = %job_id, "cancel requested");
                Ok(CancelAccepted::Requested)
            }
            Err(e) => {
                let err = ControlError::from(e);
                error!(job = %job_id, "{}", err);
                vacate_if_owner(&mut slot, job_id);
                self.telemetry.publish(TelemetryEvent::error(err.to_string()));
                Err(err)
            }
        }
    }

    fn spawn_job(&self, lease: JobLease, events: EventStream) {
        let job_id = lease.id;
        let runner = self.clone();
        let task = tokio::spawn(async move { runner.drive(lease, events).await });

        let supervisor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!(job = %job_id, "job task died: {}", e);
                supervisor.abort_job(job_id, "internal error: job task terminated unexpectedly");
            }
        });
    }

    async fn drive(self, lease: JobLease, mut events: EventStream) {
        let timeout = self.cancel_timeout;
        let mut deadline: Option<Instant> = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = lease.released.cancelled() => return,
                _ = lease.cancel_requested.cancelled(), if deadline.is_none() && timeout.is_some() => {
                    deadline = timeout.map(|t| Instant::now() + t);
                    continue;
                }
                _ = cancel_deadline(deadline) => TransferEvent::CancelFailed { reason: "timeout".to_string() },
                next = events.next() => match next {
                    Some(ev) => ev,
                    None => TransferEvent::Failed {
                        reason: "transfer engine stopped without reporting an outcome".to_string(),
                    },
                },
            };

            if let Flow::Finished = self.apply(lease.id, event) {
                return;
            }
        }
    }

    fn apply(&self, job_id: JobId, event: TransferEvent) -> Flow {
        let mut slot = self.registry.lock();
        let Some(job) = owned_by(&mut slot, job_id) else {
            debug!(job = %job_id, ?event, "discarding event for released job");
            return Flow::Finished;
        };

        let terminal = match event {
            TransferEvent::Metadata { name, total_bytes } => {
                debug!(job = %job_id, %name, ?total_bytes, "metadata resolved");
                job.display_name = Some(name);
                if total_bytes.is_some() {
                    job.total_bytes = total_bytes;
                }
                return Flow::Continue;
            }
            TransferEvent::Progress { bytes_transferred, total_bytes, rate_bytes_per_sec } => {
                job.bytes_transferred = job.bytes_transferred.max(bytes_transferred);
                if total_bytes.is_some() {
                    job.total_bytes = total_bytes;
                }
                job.rate_bytes_per_sec = rate_bytes_per_sec;
                self.telemetry.publish(TelemetryEvent::progress(job));
                return Flow::Continue;
            }
            TransferEvent::Completed => {
                info!(job = %job_id, name = ?job.display_name, "job completed");
                TelemetryEvent::done(job)
            }
            TransferEvent::Failed { reason } => {
                error!(job = %job_id, "job failed: {}", reason);
                TelemetryEvent::error(reason)
            }
            TransferEvent::Cancelled => {
                info!(job = %job_id, "job cancelled");
                TelemetryEvent::cancelled()
            }
            TransferEvent::CancelFailed { reason } => {
                error!(job = %job_id, "cancel failed: {}", reason);
                TelemetryEvent::error(format!("cancel failed: {}", reason))
            }
        };

        vacate_if_owner(&mut slot, job_id);
        self.telemetry.publish(terminal);
        Flow::Finished
    }

    /// Fatal path for faults outside the event stream. No-op if the job already finished.
    fn abort_job(&self, job_id: JobId, message: impl Into<String>) {
        let mut slot = self.registry.lock();
        if vacate_if_owner(&mut slot, job_id).is_some() {
            self.telemetry.publish(TelemetryEvent::error(message));
        }
    }
}

async fn cancel_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{DoneEvent, ErrorEvent};
    use crate::plugins::transfer::scripted::ScriptedEngine;
    use tokio::sync::broadcast::error::TryRecvError;

    const MAGNET: &str = "magnet:?xt=urn:btih:abc";

    fn coordinator(engine: Arc<ScriptedEngine>, cancel_timeout: Option<Duration>) -> Coordinator {
        Coordinator::new(
            Arc::new(JobRegistry::new()),
            engine,
            TelemetryBroadcaster::new(64),
            PathBuf::from("/tmp/relay-test"),
            cancel_timeout,
        )
    }

    async fn next(rx: &mut Observer) -> TelemetryEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for telemetry")
            .expect("telemetry closed")
    }

    fn progress(bytes: u64, total: u64) -> TransferEvent {
        TransferEvent::Progress { bytes_transferred: bytes, total_bytes: Some(total), rate_bytes_per_sec: 10 }
    }

    #[tokio::test]
    async fn metadata_progress_then_completion() {
        let engine = ScriptedEngine::new();
        let coord = coordinator(engine.clone(), None);
        let mut rx = coord.subscribe();

        coord.start(MAGNET).await.unwrap();
        let t = engine.take_transfer();
        t.emit(TransferEvent::Metadata { name: "X".into(), total_bytes: Some(1000) });
        t.emit(progress(300, 1000));
        t.emit(progress(700, 1000));
        t.emit(TransferEvent::Completed);

        let TelemetryEvent::Progress(p1) = next(&mut rx).await else { panic!("expected progress") };
        let TelemetryEvent::Progress(p2) = next(&mut rx).await else { panic!("expected progress") };
        assert_eq!((p1.bytes_transferred, p1.progress_percent), (300, 30.0));
        assert_eq!((p2.bytes_transferred, p2.progress_percent), (700, 70.0));
        assert_eq!(p2.name.as_deref(), Some("X"));

        assert_eq!(
            next(&mut rx).await,
            TelemetryEvent::Done(DoneEvent { message: "Download complete: X".into(), name: "X".into() })
        );
        assert!(coord.status().is_none());
    }

    #[tokio::test]
    async fn name_arriving_late_shows_up_in_later_progress() {
        let engine = ScriptedEngine::new();
        let coord = coordinator(engine.clone(), None);
        let mut rx = coord.subscribe();

        coord.start(MAGNET).await.unwrap();
        let t = engine.take_transfer();
        t.emit(progress(10, 100));
        t.emit(TransferEvent::Metadata { name: "late".into(), total_bytes: None });
        t.emit(progress(20, 100));

        let TelemetryEvent::Progress(first) = next(&mut rx).await else { panic!() };
        let TelemetryEvent::Progress(second) = next(&mut rx).await else { panic!() };
        assert_eq!(first.name, None);
        assert_eq!(second.name.as_deref(), Some("late"));
        assert_eq!(second.total_bytes, Some(100));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_start_is_rejected_and_one_terminal_event() {
        let engine = ScriptedEngine::new();
        let coord = coordinator(engine.clone(), None);
        let mut rx = coord.subscribe();

        let (a, b) = (coord.clone(), coord.clone());
        let (a, b) = tokio::join!(
            tokio::spawn(async move { a.start(MAGNET).await }),
            tokio::spawn(async move { b.start(MAGNET).await }),
        );
        let results = [a.unwrap(), b.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| r == &Err(ControlError::AlreadyActive)));
        assert_eq!(engine.begun(), 1);

        engine.take_transfer().emit(TransferEvent::Completed);
        assert!(matches!(next(&mut rx).await, TelemetryEvent::Done(_)));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_concurrent_starts_have_a_single_winner() {
        let engine = ScriptedEngine::new();
        let coord = coordinator(engine.clone(), None);
        let barrier = Arc::new(tokio::sync::Barrier::new(32));

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let coord = coord.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    coord.start(&format!("magnet:?xt=urn:btih:{}", i)).await
                })
            })
            .collect();
        let mut accepted = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(e) => assert_eq!(e, ControlError::AlreadyActive),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(engine.begun(), 1);
    }

    #[tokio::test]
    async fn cancel_confirmed_frees_slot_for_next_start() {
        let engine = ScriptedEngine::new();
        let coord = coordinator(engine.clone(), None);
        let mut rx = coord.subscribe();

        coord.start(MAGNET).await.unwrap();
        let t = engine.take_transfer();
        assert_eq!(coord.cancel(), Ok(CancelAccepted::Requested));
        assert_eq!(t.cancel_calls(), 1);
        assert_eq!(coord.status().map(|s| s.state), Some(JobState::Terminating));
        assert_eq!(coord.start(MAGNET).await, Err(ControlError::AlreadyActive));

        t.emit(progress(50, 100));
        t.emit(TransferEvent::Cancelled);
        assert!(matches!(next(&mut rx).await, TelemetryEvent::Progress(_)));
        assert_eq!(next(&mut rx).await, TelemetryEvent::cancelled());
        assert!(coord.status().is_none());

        coord.start(MAGNET).await.unwrap();
        coord.cancel().unwrap();
        assert_eq!(coord.cancel(), Ok(CancelAccepted::AlreadyRequested));
        assert_eq!(engine.take_transfer().cancel_calls(), 1);
    }

    async fn wait_for_occupied_slot(coord: &Coordinator) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while coord.status().is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("start never occupied the slot");
    }

    #[tokio::test]
    async fn cancel_during_begin_is_issued_once_the_handle_exists() {
        let engine = ScriptedEngine::new();
        let gate = engine.gate_begin();
        let coord = coordinator(engine.clone(), None);
        let mut rx = coord.subscribe();

        let starter = coord.clone();
        let start = tokio::spawn(async move { starter.start(MAGNET).await });
        wait_for_occupied_slot(&coord).await;

        assert_eq!(coord.cancel(), Ok(CancelAccepted::Requested));
        assert_eq!(coord.status().map(|s| s.state), Some(JobState::Terminating));
        assert_eq!(engine.begun(), 0);

        gate.notify_one();
        start.await.unwrap().unwrap();
        let t = engine.take_transfer();
        assert_eq!(t.cancel_calls(), 1);
        assert_eq!(coord.cancel(), Ok(CancelAccepted::AlreadyRequested));

        t.emit(TransferEvent::Cancelled);
        assert_eq!(next(&mut rx).await, TelemetryEvent::cancelled());
        assert!(coord.status().is_none());
    }

    #[tokio::test]
    async fn deferred_cancel_failure_aborts_the_job() {
        let engine = ScriptedEngine::new();
        let gate = engine.gate_begin();
        engine.fail_cancels_with("handle busy");
        let coord = coordinator(engine.clone(), None);
        let mut rx = coord.subscribe();

        let starter = coord.clone();
        let start = tokio::spawn(async move { starter.start(MAGNET).await });
        wait_for_occupied_slot(&coord).await;
        assert_eq!(coord.cancel(), Ok(CancelAccepted::Requested));

        gate.notify_one();
        assert!(start.await.unwrap().is_ok());
        let t = engine.take_transfer();
        assert_eq!(t.cancel_calls(), 1);

        assert_eq!(next(&mut rx).await, TelemetryEvent::error("cancel failed: handle busy"));
        assert!(coord.status().is_none());

        t.emit(TransferEvent::Cancelled);
        coord.start(MAGNET).await.unwrap();
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn engine_failure_reports_reason_verbatim() {
        let engine = ScriptedEngine::new();
        let coord = coordinator(engine.clone(), None);
        let mut rx = coord.subscribe();

        coord.start(MAGNET).await.unwrap();
        engine.take_transfer().emit(TransferEvent::Failed { reason: "peer timeout".into() });

        assert_eq!(next(&mut rx).await, TelemetryEvent::Error(ErrorEvent { message: "peer timeout".into() }));
        assert!(coord.status().is_none());
        coord.start("magnet:?xt=urn:btih:other").await.unwrap();
    }

    #[tokio::test]
    async fn cancel_while_idle_is_rejected_without_telemetry() {
        let coord = coordinator(ScriptedEngine::new(), None);
        let mut rx = coord.subscribe();

        for _ in 0..3 {
            assert_eq!(coord.cancel(), Err(ControlError::NoActiveJob));
        }
        assert!(coord.status().is_none());
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn begin_failure_releases_the_slot() {
        let engine = ScriptedEngine::new();
        let coord = coordinator(engine.clone(), None);

        assert_eq!(coord.start("not-a-magnet").await, Err(ControlError::InvalidResourceIdentifier));
        assert!(coord.status().is_none());
        assert_eq!(coord.start("   ").await, Err(ControlError::MissingResourceId));

        engine.set_unavailable("no session");
        assert_eq!(coord.start(MAGNET).await, Err(ControlError::EngineUnavailable("no session".into())));
        assert!(coord.status().is_none());
    }

    #[tokio::test]
    async fn resource_still_tracked_by_engine_is_rejected() {
        let engine = ScriptedEngine::new();
        engine.track(MAGNET);
        let coord = coordinator(engine.clone(), None);

        assert_eq!(coord.start(MAGNET).await, Err(ControlError::AlreadyActive));
        assert!(coord.status().is_none());
        assert_eq!(engine.begun(), 0);
    }

    #[tokio::test]
    async fn progress_bytes_never_go_backwards() {
        let engine = ScriptedEngine::new();
        let coord = coordinator(engine.clone(), None);
        let mut rx = coord.subscribe();

        coord.start(MAGNET).await.unwrap();
        let t = engine.take_transfer();
        for bytes in [100, 400, 250, 400, 900] {
            t.emit(progress(bytes, 1000));
        }

        let mut last = 0;
        for _ in 0..5 {
            let TelemetryEvent::Progress(p) = next(&mut rx).await else { panic!() };
            assert!(p.bytes_transferred >= last);
            last = p.bytes_transferred;
        }
        assert_eq!(last, 900);
    }

    #[tokio::test]
    async fn late_events_from_released_job_are_discarded() {
        let engine = ScriptedEngine::new();
        let coord = coordinator(engine.clone(), None);
        let mut rx = coord.subscribe();

        coord.start(MAGNET).await.unwrap();
        let old = engine.take_transfer();
        old.emit(TransferEvent::Completed);
        assert!(matches!(next(&mut rx).await, TelemetryEvent::Done(_)));

        let accepted = coord.start(MAGNET).await.unwrap();
        let current = engine.take_transfer();
        old.emit(progress(999, 1000));
        old.emit(TransferEvent::Failed { reason: "stale".into() });
        current.emit(progress(1, 1000));

        let TelemetryEvent::Progress(p) = next(&mut rx).await else { panic!() };
        assert_eq!(p.bytes_transferred, 1);
        assert_eq!(coord.status().map(|s| s.id), Some(accepted.job_id));
    }

    #[tokio::test]
    async fn synchronous_cancel_failure_is_fatal() {
        let engine = ScriptedEngine::new();
        engine.fail_cancels_with("file locked");
        let coord = coordinator(engine.clone(), None);
        let mut rx = coord.subscribe();

        coord.start(MAGNET).await.unwrap();
        let t = engine.take_transfer();
        assert_eq!(coord.cancel(), Err(ControlError::CancelFailed("file locked".into())));
        assert_eq!(next(&mut rx).await, TelemetryEvent::error("cancel failed: file locked"));
        assert!(coord.status().is_none());

        t.emit(TransferEvent::Cancelled);
        coord.start(MAGNET).await.unwrap();
    }

    #[tokio::test]
    async fn asynchronous_cancel_failure_is_fatal() {
        let engine = ScriptedEngine::new();
        let coord = coordinator(engine.clone(), None);
        let mut rx = coord.subscribe();

        coord.start(MAGNET).await.unwrap();
        coord.cancel().unwrap();
        engine.take_transfer().emit(TransferEvent::CancelFailed { reason: "handle busy".into() });

        assert_eq!(next(&mut rx).await, TelemetryEvent::error("cancel failed: handle busy"));
        assert!(coord.status().is_none());
    }

    #[tokio::test]
    async fn unconfirmed_cancel_times_out() {
        let engine = ScriptedEngine::new();
        let coord = coordinator(engine.clone(), Some(Duration::from_millis(50)));
        let mut rx = coord.subscribe();

        coord.start(MAGNET).await.unwrap();
        let _t = engine.take_transfer();
        coord.cancel().unwrap();

        assert_eq!(next(&mut rx).await, TelemetryEvent::error("cancel failed: timeout"));
        assert!(coord.status().is_none());
    }

    #[tokio::test]
    async fn closed_stream_without_outcome_fails_the_job() {
        let engine = ScriptedEngine::new();
        let coord = coordinator(engine.clone(), None);
        let mut rx = coord.subscribe();

        coord.start(MAGNET).await.unwrap();
        drop(engine.take_transfer());

        assert_eq!(
            next(&mut rx).await,
            TelemetryEvent::error("transfer engine stopped without reporting an outcome")
        );
        assert!(coord.status().is_none());
    }

    #[tokio::test]
    async fn panicking_job_task_does_not_leave_slot_stuck() {
        let engine = ScriptedEngine::new();
        engine.panic_on_poll();
        let coord = coordinator(engine.clone(), None);
        let mut rx = coord.subscribe();

        coord.start(MAGNET).await.unwrap();

        assert_eq!(
            next(&mut rx).await,
            TelemetryEvent::error("internal error: job task terminated unexpectedly")
        );
        assert!(coord.status().is_none());
    }
}
