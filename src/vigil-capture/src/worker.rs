//! Per-stream capture worker
//!
//! Each stream runs on its own OS thread so a hung or crashing decoder
//! cannot stall other streams. The worker owns its status and reports
//! every transition over a channel; it never writes shared state other
//! than its frame queue.

use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::queue::FrameQueue;
use crate::source::{FrameSession, FrameSource, KillHook};

/// Lifecycle of a stream worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Idle,
    Initializing,
    Streaming,
    Error,
    Stopping,
    Stopped,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Idle => "idle",
            StreamStatus::Initializing => "initializing",
            StreamStatus::Streaming => "streaming",
            StreamStatus::Error => "error",
            StreamStatus::Stopping => "stopping",
            StreamStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status message sent from a worker to its manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub stream_id: i64,
    /// Distinguishes successive workers of the same stream
    pub generation: u64,
    pub status: StreamStatus,
}

/// Worker timing
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Pause after each published frame
    pub frame_interval: Duration,
    /// Pause before retrying a failed read
    pub read_retry_delay: Duration,
    /// Granularity at which sleeps check for cancellation
    pub cancel_poll: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(10),
            read_retry_delay: Duration::from_secs(1),
            cancel_poll: Duration::from_millis(50),
        }
    }
}

#[derive(Default)]
struct KillState {
    fired: bool,
    hook: Option<KillHook>,
}

/// Forced-termination switch shared between a worker and its owner.
///
/// The worker arms it with the session's kill hook once the session is
/// open; firing it runs the hook (immediately, or at arm time if fired
/// earlier) and tells the worker to exit.
#[derive(Clone, Default)]
pub struct KillSwitch {
    inner: Arc<Mutex<KillState>>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, mut hook: KillHook) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if state.fired {
            hook();
        }
        state.hook = Some(hook);
    }

    pub fn fire(&self) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.fired = true;
        if let Some(hook) = state.hook.as_mut() {
            hook();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fired
    }
}

/// Why a stream loop ended
enum LoopExit {
    Stopped,
    SessionClosed,
}

struct WorkerContext {
    stream_id: i64,
    generation: u64,
    url: String,
    source: Arc<dyn FrameSource>,
    queue: Arc<FrameQueue>,
    cancel: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    kill: KillSwitch,
    reports: Sender<StatusReport>,
    config: WorkerConfig,
}

impl WorkerContext {
    fn report(&self, status: StreamStatus) {
        let report = StatusReport {
            stream_id: self.stream_id,
            generation: self.generation,
            status,
        };
        if self.reports.send(report).is_err() {
            debug!("status receiver gone for stream {}", self.stream_id);
        }
    }

    fn should_stop(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.stop.load(Ordering::SeqCst) || self.kill.is_fired()
    }

    /// Sleep up to `duration`, returning early once a stop is requested
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.should_stop() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(self.config.cancel_poll));
        }
    }

    fn run(&self) {
        self.report(StreamStatus::Initializing);

        let mut session = match self.source.open(&self.url) {
            Ok(session) => session,
            Err(e) => {
                error!("failed to open stream {} ({}): {}", self.stream_id, self.url, e);
                self.report(StreamStatus::Error);
                return;
            }
        };

        if let Some(hook) = session.kill_hook() {
            self.kill.arm(hook);
        }

        match self.stream_loop(session.as_mut()) {
            LoopExit::Stopped => {
                self.report(StreamStatus::Stopping);
                drop(session);
                self.report(StreamStatus::Stopped);
                info!("stream worker {} stopped", self.stream_id);
            }
            // Error was the last report
            LoopExit::SessionClosed => {
                drop(session);
                error!("stream worker {} exited, decode session closed", self.stream_id);
            }
        }
    }

    fn stream_loop(&self, session: &mut dyn FrameSession) -> LoopExit {
        let mut status = StreamStatus::Initializing;

        while !self.should_stop() {
            let failure = match session.read_frame() {
                Ok(Some(frame)) => {
                    if status != StreamStatus::Streaming {
                        status = StreamStatus::Streaming;
                        self.report(status);
                        info!("stream {} streaming from {}", self.stream_id, self.url);
                    }
                    self.queue.put(frame);
                    self.pause(self.config.frame_interval);
                    continue;
                }
                Ok(None) => "end of stream".to_string(),
                Err(e) => e.to_string(),
            };

            if self.should_stop() {
                break;
            }

            if status != StreamStatus::Error {
                status = StreamStatus::Error;
                self.report(status);
            }
            warn!("failed to read frame from stream {} ({}): {}", self.stream_id, self.url, failure);

            if !session.is_open() {
                warn!("decode session for stream {} ({}) is closed", self.stream_id, self.url);
                return LoopExit::SessionClosed;
            }

            self.pause(self.config.read_retry_delay);
        }

        LoopExit::Stopped
    }
}

/// Handle to a running worker thread
pub struct StreamWorker {
    stream_id: i64,
    generation: u64,
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    kill: KillSwitch,
}

impl StreamWorker {
    /// Spawn a worker thread for one stream.
    ///
    /// The worker exits when either the shared `cancel` flag or its own stop
    /// request is observed, at the latest one loop iteration later.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        stream_id: i64,
        generation: u64,
        url: &str,
        source: Arc<dyn FrameSource>,
        queue: Arc<FrameQueue>,
        cancel: Arc<AtomicBool>,
        reports: Sender<StatusReport>,
        config: WorkerConfig,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let kill = KillSwitch::new();

        let ctx = WorkerContext {
            stream_id,
            generation,
            url: url.to_string(),
            source,
            queue,
            cancel,
            stop: stop.clone(),
            kill: kill.clone(),
            reports,
            config,
        };

        let handle = thread::Builder::new()
            .name(format!("stream-{}", stream_id))
            .spawn(move || {
                if panic::catch_unwind(AssertUnwindSafe(|| ctx.run())).is_err() {
                    error!("stream worker {} panicked", ctx.stream_id);
                    ctx.report(StreamStatus::Error);
                }
            })?;

        Ok(Self {
            stream_id,
            generation,
            handle: Some(handle),
            stop,
            kill,
        })
    }

    pub fn stream_id(&self) -> i64 {
        self.stream_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Ask this worker alone to stop cooperatively
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Force the decode session down
    pub fn kill(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.kill.fire();
    }

    /// Wait up to `timeout` for the thread to exit; joins it if it did
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        self.reap();
        true
    }

    fn reap(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("stream worker {} thread panicked", self.stream_id);
            }
        }
    }

    /// Give up on a worker that ignored both stop and kill
    pub fn detach(mut self) {
        if self.handle.take().is_some() {
            error!("abandoning unresponsive worker for stream {}", self.stream_id);
        }
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.request_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CaptureError, Result};
    use crate::frame::{Frame, PixelLayout};
    use chrono::Utc;
    use std::sync::mpsc::{self, Receiver};

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            frame_interval: Duration::from_millis(1),
            read_retry_delay: Duration::from_millis(5),
            cancel_poll: Duration::from_millis(1),
        }
    }

    /// Endless source of 1x1 frames
    struct Endless;

    struct EndlessSession(u8);

    impl FrameSession for EndlessSession {
        fn read_frame(&mut self) -> Result<Option<Frame>> {
            self.0 = self.0.wrapping_add(1);
            Frame::new(vec![self.0; 3], 1, 1, PixelLayout::Rgb8, Utc::now()).map(Some)
        }
    }

    impl FrameSource for Endless {
        fn open(&self, _url: &str) -> Result<Box<dyn FrameSession>> {
            Ok(Box::new(EndlessSession(0)))
        }
    }

    struct Unreachable;

    impl FrameSource for Unreachable {
        fn open(&self, url: &str) -> Result<Box<dyn FrameSession>> {
            Err(CaptureError::Connect {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            })
        }
    }

    /// Session that fails reads a few times, then recovers
    struct Flaky;

    struct FlakySession {
        failures_left: u32,
    }

    impl FrameSession for FlakySession {
        fn read_frame(&mut self) -> Result<Option<Frame>> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(CaptureError::Decode("corrupt packet".to_string()));
            }
            Frame::new(vec![1; 3], 1, 1, PixelLayout::Rgb8, Utc::now()).map(Some)
        }
    }

    impl FrameSource for Flaky {
        fn open(&self, _url: &str) -> Result<Box<dyn FrameSession>> {
            Ok(Box::new(FlakySession { failures_left: 3 }))
        }
    }

    /// Decoder process that has exited: reads fail and the session is closed
    struct Exited;

    struct ExitedSession;

    impl FrameSession for ExitedSession {
        fn read_frame(&mut self) -> Result<Option<Frame>> {
            Err(CaptureError::Decode("broken pipe".to_string()))
        }

        fn is_open(&self) -> bool {
            false
        }
    }

    impl FrameSource for Exited {
        fn open(&self, _url: &str) -> Result<Box<dyn FrameSession>> {
            Ok(Box::new(ExitedSession))
        }
    }

    fn spawn(source: Arc<dyn FrameSource>) -> (StreamWorker, Arc<FrameQueue>, Arc<AtomicBool>, Receiver<StatusReport>) {
        let (tx, rx) = mpsc::channel();
        let queue = Arc::new(FrameQueue::new(1));
        let cancel = Arc::new(AtomicBool::new(false));
        let worker = StreamWorker::spawn(
            7,
            1,
            "rtsp://cam/7",
            source,
            queue.clone(),
            cancel.clone(),
            tx,
            fast_config(),
        )
        .unwrap();
        (worker, queue, cancel, rx)
    }

    fn statuses(rx: &Receiver<StatusReport>) -> Vec<StreamStatus> {
        rx.try_iter().map(|r| r.status).collect()
    }

    #[test]
    fn test_worker_publishes_frames_and_stops_on_cancel() {
        let (mut worker, queue, cancel, rx) = spawn(Arc::new(Endless));

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(queue.get().is_some());

        cancel.store(true, Ordering::SeqCst);
        assert!(worker.join_timeout(Duration::from_secs(2)));

        let seen = statuses(&rx);
        assert_eq!(seen.first(), Some(&StreamStatus::Initializing));
        assert!(seen.contains(&StreamStatus::Streaming));
        assert_eq!(seen.last(), Some(&StreamStatus::Stopped));
    }

    #[test]
    fn test_open_failure_reports_error_and_exits() {
        let (mut worker, queue, _cancel, rx) = spawn(Arc::new(Unreachable));

        assert!(worker.join_timeout(Duration::from_secs(2)));
        assert!(queue.is_empty());
        assert_eq!(statuses(&rx), vec![StreamStatus::Initializing, StreamStatus::Error]);
    }

    #[test]
    fn test_read_failures_are_retried_in_place() {
        let (mut worker, queue, _cancel, rx) = spawn(Arc::new(Flaky));

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!queue.is_empty());

        worker.request_stop();
        assert!(worker.join_timeout(Duration::from_secs(2)));

        let seen = statuses(&rx);
        let error_at = seen.iter().position(|s| *s == StreamStatus::Error).unwrap();
        let streaming_at = seen.iter().position(|s| *s == StreamStatus::Streaming).unwrap();
        assert!(error_at < streaming_at);
    }

    #[test]
    fn test_closed_session_ends_in_error() {
        let (mut worker, queue, cancel, rx) = spawn(Arc::new(Exited));

        assert!(worker.join_timeout(Duration::from_secs(2)));
        assert!(!cancel.load(Ordering::SeqCst));
        assert!(queue.is_empty());
        assert_eq!(statuses(&rx), vec![StreamStatus::Initializing, StreamStatus::Error]);
    }

    #[test]
    fn test_kill_switch_runs_hook_armed_after_fire() {
        let switch = KillSwitch::new();
        let hits = Arc::new(Mutex::new(0));
        switch.fire();

        let counter = hits.clone();
        switch.arm(Box::new(move || *counter.lock().unwrap() += 1));

        assert!(switch.is_fired());
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(StreamStatus::Streaming.to_string(), "streaming");
        assert_eq!(StreamStatus::Stopped.as_str(), "stopped");
    }
}
