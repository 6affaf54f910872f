//! Stream manager
//!
//! Owns the configured streams, one worker thread and one frame queue per
//! running stream, and the analysis settings read by the scheduler. Workers
//! report status over a channel; the manager is the only writer of the
//! per-stream state.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use vigil_ai::{AiConfig, GENERAL_ANALYSIS_PROMPT};
use vigil_capture::{
    Frame, FrameQueue, FrameSource, SourceLocator, StatusReport, StreamStatus, StreamWorker,
    WorkerConfig,
};
use vigil_db::StreamRecord;
use vigil_web::{StreamDirectory, StreamView};

/// Shutdown deadlines
#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    /// Cooperative wait when removing a single stream
    pub remove_grace: Duration,
    /// Cooperative wait shared by all workers on stop-all
    pub stop_grace: Duration,
    /// Wait after killing workers that ignored the grace period
    pub stop_escalation: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            remove_grace: Duration::from_secs(5),
            stop_grace: Duration::from_secs(10),
            stop_escalation: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    pub queue_capacity: usize,
    pub worker: WorkerConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1,
            worker: WorkerConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

/// Settings consumed by the analysis scheduler on each cycle
#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub interval: Duration,
    /// Template used when a stream's own template is unknown
    pub default_prompt: String,
    pub ai: AiConfig,
    /// Bumped whenever `ai` changes
    pub revision: u64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            default_prompt: GENERAL_ANALYSIS_PROMPT.to_string(),
            ai: AiConfig::default(),
            revision: 0,
        }
    }
}

/// Configuration of one stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub id: i64,
    pub url: String,
    pub prompt_template: String,
    pub added_time: DateTime<Utc>,
}

impl From<StreamRecord> for StreamConfig {
    fn from(record: StreamRecord) -> Self {
        Self {
            id: record.id,
            url: record.url,
            prompt_template: record.prompt_template,
            added_time: record.added_time,
        }
    }
}

/// Stream configuration with its current status
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub status: StreamStatus,
}

/// Outcome of a stop-all
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopSummary {
    /// Exited within the grace period
    pub graceful: usize,
    /// Exited after being killed
    pub forced: usize,
    /// Ignored both; left running detached
    pub abandoned: usize,
}

/// Waitable result of `stop_all_streams`
pub struct StopHandle {
    handle: Option<JoinHandle<StopSummary>>,
}

impl StopHandle {
    /// Block until every worker has been joined, killed or abandoned
    pub fn wait(mut self) -> StopSummary {
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                error!("stream shutdown thread panicked");
                StopSummary::default()
            }),
            None => StopSummary::default(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

struct StreamEntry {
    config: StreamConfig,
    queue: Arc<FrameQueue>,
    worker: Option<StreamWorker>,
    status: StreamStatus,
    generation: u64,
}

struct ManagerState {
    streams: BTreeMap<i64, StreamEntry>,
    reports: Receiver<StatusReport>,
    reports_tx: Sender<StatusReport>,
    next_generation: u64,
}

impl ManagerState {
    fn drain_reports(&mut self) {
        while let Ok(report) = self.reports.try_recv() {
            let Some(entry) = self.streams.get_mut(&report.stream_id) else {
                continue;
            };
            // stale generations and anything after Stopped are ignored
            if entry.generation != report.generation || entry.status == StreamStatus::Stopped {
                continue;
            }
            if entry.status != report.status {
                debug!(
                    "stream {} status {} -> {}",
                    report.stream_id, entry.status, report.status
                );
                entry.status = report.status;
            }
        }
    }
}

pub struct StreamManager {
    source: Arc<dyn FrameSource>,
    config: ManagerConfig,
    cancel: Arc<AtomicBool>,
    stops_in_flight: Arc<AtomicUsize>,
    state: Mutex<ManagerState>,
    settings: RwLock<AnalysisSettings>,
}

impl StreamManager {
    pub fn new(source: Arc<dyn FrameSource>, config: ManagerConfig, settings: AnalysisSettings) -> Self {
        let (reports_tx, reports) = mpsc::channel();
        Self {
            source,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            stops_in_flight: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(ManagerState {
                streams: BTreeMap::new(),
                reports,
                reports_tx,
                next_generation: 0,
            }),
            settings: RwLock::new(settings),
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a stream; false if the id is taken or the url is invalid
    pub fn add_stream(&self, id: i64, url: &str, prompt_template: &str) -> bool {
        self.add_stream_config(StreamConfig {
            id,
            url: url.to_string(),
            prompt_template: prompt_template.to_string(),
            added_time: Utc::now(),
        })
    }

    pub fn add_stream_config(&self, config: StreamConfig) -> bool {
        if let Err(e) = SourceLocator::parse(&config.url) {
            error!("rejecting stream {}: {}", config.id, e);
            return false;
        }

        let mut state = self.state();
        if state.streams.contains_key(&config.id) {
            warn!("stream {} already registered", config.id);
            return false;
        }

        info!("added stream {} ({})", config.id, config.url);
        state.streams.insert(
            config.id,
            StreamEntry {
                config,
                queue: Arc::new(FrameQueue::new(self.config.queue_capacity)),
                worker: None,
                status: StreamStatus::Idle,
                generation: 0,
            },
        );
        true
    }

    /// Stop the stream's worker (graceful, then forced) and forget the stream.
    ///
    /// Unknown ids are a logged no-op.
    pub fn remove_stream(&self, id: i64) {
        let entry = self.state().streams.remove(&id);

        let Some(entry) = entry else {
            warn!("remove requested for unknown stream {}", id);
            return;
        };

        if let Some(worker) = entry.worker {
            self.retire(worker);
        }
        entry.queue.clear();
        info!(
            "removed stream {} ({}), {} stale frame(s) dropped",
            id,
            entry.config.url,
            entry.queue.dropped_count()
        );
    }

    fn retire(&self, mut worker: StreamWorker) {
        let id = worker.stream_id();
        let shutdown = self.config.shutdown;

        worker.request_stop();
        if worker.join_timeout(shutdown.remove_grace) {
            return;
        }

        warn!(
            "stream {} did not stop within {}s, terminating",
            id,
            shutdown.remove_grace.as_secs_f64()
        );
        worker.kill();
        if !worker.join_timeout(shutdown.stop_escalation) {
            worker.detach();
        }
    }

    /// Start a worker for every stream without a live one.
    ///
    /// Returns how many workers were started. Does nothing while a
    /// stop-all is still shutting workers down.
    pub fn start_all_streams(&self) -> usize {
        if self.stops_in_flight.load(Ordering::SeqCst) > 0 {
            warn!("stop in progress, not starting streams");
            return 0;
        }
        self.cancel.store(false, Ordering::SeqCst);

        let mut state = self.state();
        state.drain_reports();
        let ManagerState {
            streams,
            reports_tx,
            next_generation,
            ..
        } = &mut *state;

        let mut started = 0;
        for (id, entry) in streams.iter_mut() {
            if entry.worker.as_ref().map_or(false, |w| !w.is_finished()) {
                continue;
            }
            if let Some(mut finished) = entry.worker.take() {
                finished.join_timeout(Duration::ZERO);
            }

            *next_generation += 1;
            entry.generation = *next_generation;
            entry.queue = Arc::new(FrameQueue::new(self.config.queue_capacity));

            match StreamWorker::spawn(
                *id,
                entry.generation,
                &entry.config.url,
                self.source.clone(),
                entry.queue.clone(),
                self.cancel.clone(),
                reports_tx.clone(),
                self.config.worker,
            ) {
                Ok(worker) => {
                    entry.worker = Some(worker);
                    entry.status = StreamStatus::Initializing;
                    started += 1;
                }
                Err(e) => {
                    error!("failed to spawn worker for stream {}: {}", id, e);
                    entry.status = StreamStatus::Error;
                }
            }
        }

        if started > 0 {
            info!("started {} stream worker(s)", started);
        }
        started
    }

    /// Signal every worker to stop and shut them down in the background.
    ///
    /// Workers get a shared grace period, then are killed, then abandoned
    /// with an error log. Queues are cleared and the cancellation flag is
    /// reset once all are dealt with.
    pub fn stop_all_streams(&self) -> StopHandle {
        self.cancel.store(true, Ordering::SeqCst);
        self.stops_in_flight.fetch_add(1, Ordering::SeqCst);

        let (workers, queues, reports) = {
            let mut state = self.state();
            state.drain_reports();
            let mut workers = Vec::new();
            let mut queues = Vec::new();
            for entry in state.streams.values_mut() {
                if let Some(worker) = entry.worker.take() {
                    worker.request_stop();
                    workers.push(worker);
                    entry.status = StreamStatus::Stopping;
                }
                queues.push(entry.queue.clone());
            }
            (workers, queues, state.reports_tx.clone())
        };

        info!("stopping {} stream worker(s)", workers.len());

        let shutdown = self.config.shutdown;
        let cancel = self.cancel.clone();
        let in_flight = self.stops_in_flight.clone();

        let spawned = thread::Builder::new()
            .name("stream-shutdown".to_string())
            .spawn(move || {
                let summary = shutdown_workers(workers, &reports, shutdown);
                for queue in &queues {
                    queue.clear();
                }
                if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                    cancel.store(false, Ordering::SeqCst);
                }
                info!(
                    "streams stopped: {} graceful, {} forced, {} abandoned",
                    summary.graceful, summary.forced, summary.abandoned
                );
                summary
            });

        match spawned {
            Ok(handle) => StopHandle {
                handle: Some(handle),
            },
            Err(e) => {
                error!("failed to spawn stream shutdown thread: {}", e);
                self.stops_in_flight.fetch_sub(1, Ordering::SeqCst);
                StopHandle { handle: None }
            }
        }
    }

    /// Latest queued frame; `None` for unknown streams and empty queues alike
    pub fn get_latest_frame(&self, id: i64) -> Option<Frame> {
        let queue = self.state().streams.get(&id).map(|e| e.queue.clone())?;
        queue.get()
    }

    /// Frames waiting in a stream's queue
    pub fn queued_frames(&self, id: i64) -> Option<usize> {
        self.state().streams.get(&id).map(|e| e.queue.len())
    }

    pub fn has_stream(&self, id: i64) -> bool {
        self.state().streams.contains_key(&id)
    }

    pub fn stream_ids(&self) -> Vec<i64> {
        self.state().streams.keys().copied().collect()
    }

    pub fn stream_status(&self, id: i64) -> Option<StreamStatus> {
        let mut state = self.state();
        state.drain_reports();
        state.streams.get(&id).map(|e| e.status)
    }

    pub fn stream_statuses(&self) -> Vec<(i64, StreamStatus)> {
        let mut state = self.state();
        state.drain_reports();
        state.streams.iter().map(|(id, e)| (*id, e.status)).collect()
    }

    pub fn stream_info(&self, id: i64) -> Option<StreamInfo> {
        let mut state = self.state();
        state.drain_reports();
        state.streams.get(&id).map(|e| StreamInfo {
            config: e.config.clone(),
            status: e.status,
        })
    }

    /// All streams in id order
    pub fn streams(&self) -> Vec<StreamInfo> {
        let mut state = self.state();
        state.drain_reports();
        state
            .streams
            .values()
            .map(|e| StreamInfo {
                config: e.config.clone(),
                status: e.status,
            })
            .collect()
    }

    pub fn set_stream_prompt_template(&self, id: i64, template: &str) -> bool {
        match self.state().streams.get_mut(&id) {
            Some(entry) => {
                entry.config.prompt_template = template.to_string();
                true
            }
            None => false,
        }
    }

    fn settings_mut(&self) -> std::sync::RwLockWriteGuard<'_, AnalysisSettings> {
        self.settings.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn analysis_settings(&self) -> AnalysisSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_analysis_interval(&self, interval: Duration) {
        self.settings_mut().interval = interval;
        info!("analysis interval set to {}s", interval.as_secs_f64());
    }

    /// Template used for streams whose own template cannot be resolved
    pub fn set_prompt_template(&self, name: &str) {
        self.settings_mut().default_prompt = name.to_string();
        info!("default prompt template set to {}", name);
    }

    pub fn set_ai_config(&self, model: &str, api_key: &str, api_base: &str) {
        let mut settings = self.settings_mut();
        settings.ai.model = model.to_string();
        settings.ai.api_key = api_key.to_string();
        settings.ai.api_base = api_base.to_string();
        settings.revision += 1;
        info!("ai configuration updated (model {}, base {})", model, api_base);
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

impl StreamDirectory for StreamManager {
    fn streams(&self) -> Vec<StreamView> {
        StreamManager::streams(self)
            .into_iter()
            .map(|info| StreamView {
                id: info.config.id,
                url: info.config.url,
                prompt_template: info.config.prompt_template,
                added_time: info.config.added_time.to_rfc3339(),
                status: info.status.to_string(),
            })
            .collect()
    }
}

/// Join, then kill, then abandon; every handled worker ends up reported Stopped
fn shutdown_workers(
    workers: Vec<StreamWorker>,
    reports: &Sender<StatusReport>,
    shutdown: ShutdownConfig,
) -> StopSummary {
    let mut summary = StopSummary::default();
    let mut handled = Vec::with_capacity(workers.len());
    let mut lingering = Vec::new();

    let deadline = Instant::now() + shutdown.stop_grace;
    for mut worker in workers {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if worker.join_timeout(remaining) {
            summary.graceful += 1;
            handled.push((worker.stream_id(), worker.generation()));
        } else {
            lingering.push(worker);
        }
    }

    if !lingering.is_empty() {
        warn!(
            "{} worker(s) still running after {}s, terminating",
            lingering.len(),
            shutdown.stop_grace.as_secs_f64()
        );
        for worker in &lingering {
            worker.kill();
        }

        let deadline = Instant::now() + shutdown.stop_escalation;
        for mut worker in lingering {
            let remaining = deadline.saturating_duration_since(Instant::now());
            handled.push((worker.stream_id(), worker.generation()));
            if worker.join_timeout(remaining) {
                summary.forced += 1;
            } else {
                summary.abandoned += 1;
                worker.detach();
            }
        }
    }

    for (stream_id, generation) in handled {
        let _ = reports.send(StatusReport {
            stream_id,
            generation,
            status: StreamStatus::Stopped,
        });
    }

    summary
}
