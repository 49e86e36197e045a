//! Liveview worker: runs the capture loop on a background task and hands the
//! latest frame to any number of concurrent pollers.
//!
//! ```text
//! STOPPED --start()--> STARTING --first frame--> STREAMING
//!                          |                         |
//!                          +--no stream--> ERROR     +--stop()/idle/EOF/stall--> STOPPED
//! ```
//!
//! `ERROR` and `STOPPED` both accept a new `start()`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::capture::error::{ErrorKind, LiveViewError};
use crate::capture::{CameraSource, CaptureError, CaptureSession, Frame};
use crate::pipeline::fps::FpsMeter;
use crate::pipeline::frame_buffer::FrameBuffer;
use crate::LiveViewConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Stopped,
    Starting,
    Streaming,
    Error,
}

/// State plus the reason for it, replaced as a whole on every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub message: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl WorkerStatus {
    fn new(state: WorkerState) -> Self {
        Self {
            state,
            message: None,
            error_kind: None,
        }
    }

    fn stopped(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(WorkerState::Stopped)
        }
    }

    fn error(err: &CaptureError) -> Self {
        Self {
            state: WorkerState::Error,
            message: Some(err.detail()),
            error_kind: Some(err.kind()),
        }
    }
}

/// Notifications for collaborators that prefer push over polling
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    FrameAvailable(u64),
    StatusChanged(WorkerStatus),
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub idle_timeout: Duration,
    /// Longest wait for the next frame before the stream counts as stalled
    pub stall_timeout: Duration,
    /// Publish at most this many frames per second
    pub max_fps: Option<f64>,
}

impl From<&LiveViewConfig> for WorkerSettings {
    fn from(config: &LiveViewConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            stall_timeout: config.stall_timeout(),
            max_fps: config.max_fps,
        }
    }
}

/// State shared between the worker handle and its background task
struct Shared {
    status: ArcSwap<WorkerStatus>,
    buffer: FrameBuffer,
    /// A background task owns the camera
    running: AtomicBool,
    stop_requested: AtomicBool,
    /// Wakes a capture loop blocked on a read
    stop_signal: Notify,
    epoch: Instant,
    /// Milliseconds since `epoch` of the last frame request
    last_polled_ms: AtomicU64,
    fps_bits: AtomicU64,
    subscribers: ArcSwap<Vec<flume::Sender<WorkerEvent>>>,
}

impl Shared {
    /// Resolves once a stop has been requested for the current run
    async fn stopped(&self) {
        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                return;
            }
            // A permit left over from an earlier run only causes a recheck
            self.stop_signal.notified().await;
        }
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_polled_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_polled_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    fn set_status(&self, status: WorkerStatus) {
        debug!(state = ?status.state, message = ?status.message, "liveview status changed");
        self.status.store(Arc::new(status.clone()));
        self.emit(WorkerEvent::StatusChanged(status));
    }

    fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
        metrics::gauge!("polaris_liveview_fps").set(fps);
    }

    fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    /// Never blocks: full subscribers miss the event, gone ones are pruned
    fn emit(&self, event: WorkerEvent) {
        let subscribers = self.subscribers.load();
        if subscribers.is_empty() {
            return;
        }
        let mut disconnected = false;
        for tx in subscribers.iter() {
            if let Err(flume::TrySendError::Disconnected(_)) = tx.try_send(event.clone()) {
                disconnected = true;
            }
        }
        if disconnected {
            self.subscribers.rcu(|subs| {
                subs.iter()
                    .filter(|tx| !tx.is_disconnected())
                    .cloned()
                    .collect::<Vec<_>>()
            });
        }
    }

    /// Final transition of a run; releases the worker for the next start()
    fn finish(&self, status: WorkerStatus) {
        self.set_fps(0.0);
        self.set_status(status);
        self.running.store(false, Ordering::Release);
    }
}

/// Owner of the single liveview session for one camera
pub struct LiveViewWorker {
    source: Arc<CameraSource>,
    settings: WorkerSettings,
    shared: Arc<Shared>,
    runtime: Handle,
}

impl LiveViewWorker {
    pub fn new(source: CameraSource, settings: WorkerSettings, runtime: Handle) -> Self {
        Self {
            source: Arc::new(source),
            settings,
            shared: Arc::new(Shared {
                status: ArcSwap::from_pointee(WorkerStatus::new(WorkerState::Stopped)),
                buffer: FrameBuffer::new(),
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                stop_signal: Notify::new(),
                epoch: Instant::now(),
                last_polled_ms: AtomicU64::new(0),
                fps_bits: AtomicU64::new(0f64.to_bits()),
                subscribers: ArcSwap::from_pointee(Vec::new()),
            }),
            runtime,
        }
    }

    /// Spawn the capture loop and return immediately
    ///
    /// Rejected with [`LiveViewError::AlreadyRunning`] while a previous run
    /// still owns the camera.
    pub fn start(&self) -> Result<(), LiveViewError> {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LiveViewError::AlreadyRunning);
        }

        info!("Starting liveview");
        self.shared.stop_requested.store(false, Ordering::Release);
        self.shared.buffer.clear();
        self.shared.touch();
        self.shared.set_status(WorkerStatus::new(WorkerState::Starting));

        let shared = Arc::clone(&self.shared);
        let source = Arc::clone(&self.source);
        let settings = self.settings.clone();
        self.runtime.spawn(run_capture(shared, source, settings));
        Ok(())
    }

    /// Ask the capture loop to stop after the current frame
    ///
    /// Safe from any thread; a no-op when nothing is running.
    pub fn stop(&self) {
        if !self.shared.running.load(Ordering::Acquire) {
            debug!("stop() called, but liveview is not running");
            return;
        }
        info!("Liveview stop requested");
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.stop_signal.notify_one();
    }

    /// The most recent frame; never waits for a new one
    ///
    /// Also counts as activity for the idle timeout.
    pub fn get_latest_frame(&self) -> Result<Arc<Frame>, LiveViewError> {
        self.shared.touch();
        self.shared.buffer.latest().ok_or(LiveViewError::NotStreaming)
    }

    /// The buffered frame for inspection, not counted as client activity
    pub fn peek_frame(&self) -> Option<Arc<Frame>> {
        self.shared.buffer.latest()
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.status.load_full().as_ref().clone()
    }

    pub fn state(&self) -> WorkerState {
        self.shared.status.load().state
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Published frames per second over the recent window
    pub fn fps(&self) -> f64 {
        self.shared.fps()
    }

    /// Number of the buffered frame, without touching the idle timer
    pub fn frame_no(&self) -> Option<u64> {
        self.shared.buffer.frame_no()
    }

    pub fn buffer_stats(&self) -> (usize, usize) {
        self.shared.buffer.stats()
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Receive frame and status events; at most `capacity` are queued
    pub fn subscribe(&self, capacity: usize) -> flume::Receiver<WorkerEvent> {
        let (tx, rx) = flume::bounded(capacity.max(1));
        self.shared.subscribers.rcu(|subs| {
            let mut subs = subs.as_ref().clone();
            subs.push(tx.clone());
            subs
        });
        rx
    }

    /// Poll until the worker leaves STARTING, for at most `max_wait`
    pub async fn wait_for_startup(
        &self,
        max_wait: Duration,
        poll: Duration,
    ) -> Result<WorkerStatus, LiveViewError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let status = self.status();
            if status.state != WorkerState::Starting {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(LiveViewError::StartTimeout(max_wait));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Start unless already running, then wait out STARTING
    ///
    /// A run that already published its final state but is still releasing
    /// the camera is waited for, then replaced by a fresh one.
    pub async fn ensure_started(
        &self,
        max_wait: Duration,
        poll: Duration,
    ) -> Result<WorkerStatus, LiveViewError> {
        let deadline = Instant::now() + max_wait;
        loop {
            match self.start() {
                Ok(()) => break,
                Err(LiveViewError::AlreadyRunning) => {
                    if matches!(self.state(), WorkerState::Starting | WorkerState::Streaming) {
                        break;
                    }
                    if Instant::now() >= deadline {
                        return Err(LiveViewError::StartTimeout(max_wait));
                    }
                    tokio::time::sleep(poll).await;
                }
                Err(e) => return Err(e),
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.wait_for_startup(remaining, poll)
            .await
            .map_err(|e| match e {
                LiveViewError::StartTimeout(_) => LiveViewError::StartTimeout(max_wait),
                other => other,
            })
    }

    /// Stop and wait until the camera has been released
    pub async fn shutdown(&self, max_wait: Duration) -> bool {
        self.stop();
        let deadline = Instant::now() + max_wait;
        while self.is_running() {
            if Instant::now() >= deadline {
                warn!("Liveview did not stop within {:?}", max_wait);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

/// Why the capture loop ended
#[derive(Debug)]
enum StopReason {
    Requested,
    IdleTimeout(Duration),
    StreamEnded,
    ReadFailed(std::io::Error),
    Stalled(Duration),
}

async fn run_capture(shared: Arc<Shared>, source: Arc<CameraSource>, settings: WorkerSettings) {
    let mut session = match source.open().await {
        Ok(session) => session,
        Err(e) => {
            error!("Liveview failed to start: {}", e);
            metrics::counter!("polaris_capture_errors_total").increment(1);
            shared.finish(WorkerStatus::error(&e));
            return;
        }
    };
    if let Some(pid) = session.pid() {
        debug!(pid, "capture process is streaming");
    }

    let (reason, published) = stream_frames(&shared, &mut session, &settings).await;

    // Teardown runs on every exit path before the final state is set
    session.close().await;

    let status = match reason {
        StopReason::Requested => {
            info!("Liveview stopped on request after {} frames", published);
            WorkerStatus::stopped("stopped on request")
        }
        StopReason::IdleTimeout(idle) => {
            info!("No client polled for {:?}, stopping liveview", idle);
            metrics::counter!("polaris_idle_stops_total").increment(1);
            WorkerStatus::stopped("idle timeout")
        }
        StopReason::StreamEnded if published == 0 => {
            let err = CaptureError::StartupFailure("stream ended before the first frame".into());
            error!("Liveview failed to start: {}", err);
            metrics::counter!("polaris_capture_errors_total").increment(1);
            WorkerStatus::error(&err)
        }
        StopReason::StreamEnded => {
            info!("Camera stream ended after {} frames", published);
            WorkerStatus::stopped("stream ended")
        }
        StopReason::ReadFailed(e) if published == 0 => {
            error!("Liveview failed to start: {}", e);
            metrics::counter!("polaris_capture_errors_total").increment(1);
            WorkerStatus::error(&CaptureError::Io(e))
        }
        StopReason::ReadFailed(e) => {
            warn!("Camera stream interrupted: {}", e);
            metrics::counter!("polaris_capture_errors_total").increment(1);
            WorkerStatus::stopped(format!("stream interrupted: {}", e))
        }
        StopReason::Stalled(after) if published == 0 => {
            let err = CaptureError::StartupFailure(format!("no frame within {:?}", after));
            error!("Liveview failed to start: {}", err);
            metrics::counter!("polaris_capture_errors_total").increment(1);
            WorkerStatus::error(&err)
        }
        StopReason::Stalled(after) => {
            warn!("Camera stream stalled, no frame for {:?}", after);
            metrics::counter!("polaris_capture_errors_total").increment(1);
            WorkerStatus::stopped(format!("stream stalled for {:?}", after))
        }
    };
    shared.finish(status);
}

/// The capture loop proper; returns why it ended and how many frames it published
async fn stream_frames(
    shared: &Shared,
    session: &mut CaptureSession,
    settings: &WorkerSettings,
) -> (StopReason, u64) {
    let format = session.format();
    let min_interval = settings
        .max_fps
        .filter(|fps| *fps > 0.0)
        .map(|fps| Duration::from_secs_f64(1.0 / fps));
    let mut fps = FpsMeter::default();
    let mut last_publish: Option<Instant> = None;
    let mut frame_no: u64 = 0;

    loop {
        // A camera can hold its pipe open without writing, so the read
        // is raced against stop() and bounded by the stall timeout
        let read = tokio::select! {
            biased;
            _ = shared.stopped() => return (StopReason::Requested, frame_no),
            read = timeout(settings.stall_timeout, session.next_frame()) => read,
        };
        let data = match read {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => return (StopReason::StreamEnded, frame_no),
            Ok(Err(e)) => return (StopReason::ReadFailed(e), frame_no),
            Err(_) => return (StopReason::Stalled(settings.stall_timeout), frame_no),
        };

        if frame_no > 0 {
            let idle = shared.idle_for();
            if idle > settings.idle_timeout {
                return (StopReason::IdleTimeout(idle), frame_no);
            }
        }

        let now = Instant::now();
        let throttled = matches!(
            (min_interval, last_publish),
            (Some(min), Some(last)) if now.duration_since(last) < min
        );
        if throttled {
            metrics::counter!("polaris_frames_dropped_total").increment(1);
            continue;
        }

        shared.buffer.publish(Frame::new(frame_no, format, data));
        last_publish = Some(now);
        if frame_no == 0 {
            info!("Liveview streaming");
            shared.set_status(WorkerStatus::new(WorkerState::Streaming));
        }
        shared.emit(WorkerEvent::FrameAvailable(frame_no));
        metrics::counter!("polaris_frames_published_total").increment(1);
        if let Some(rate) = fps.record(now) {
            shared.set_fps(rate);
        }
        frame_no += 1;
    }
}
