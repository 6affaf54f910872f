//! Periodic frame analysis
//!
//! Every tick pulls the latest frame of each stream and analyses it in its
//! own task: JPEG encode, prompt with ReID context, AI request with a fixed
//! retry budget, then ReID merge, persistence and broadcast to subscribers.

use base64::Engine;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vigil_ai::{AiClient, AnalysisResult, PromptLibrary};
use vigil_capture::{snapshot_filename, Frame};
use vigil_db::NewAnalysisResult;

use crate::manager::{AnalysisSettings, StreamConfig, StreamManager};
use crate::reid::{PersonObservation, ReidStore};

const EVENT_CAPACITY: usize = 64;

/// Longest uninterrupted sleep of the tick loop
const STOP_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// AI attempts per frame, including the first
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    /// Write every analysed frame here when set
    pub snapshot_dir: Option<PathBuf>,
    pub jpeg_quality: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_secs(5),
            snapshot_dir: None,
            jpeg_quality: 85,
        }
    }
}

/// A completed analysis, delivered to subscribers
#[derive(Debug, Clone)]
pub struct AnalysisEvent {
    pub stream_id: i64,
    pub source_url: String,
    pub frame_name: String,
    pub analyzed_at: DateTime<Utc>,
    pub result: AnalysisResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Completed(AnalysisResult),
    /// Every attempt failed
    Abandoned { attempts: u32 },
    EncodeFailed,
}

#[derive(Default)]
struct ClientPool {
    revision: u64,
    clients: HashMap<i64, Arc<AiClient>>,
}

struct Shared {
    manager: Arc<StreamManager>,
    reid: Arc<ReidStore>,
    db: Arc<Mutex<Connection>>,
    prompts: PromptLibrary,
    config: SchedulerConfig,
    clients: Mutex<ClientPool>,
    events: broadcast::Sender<AnalysisEvent>,
    processing: AtomicBool,
}

/// Drives analysis of every managed stream; cheap to clone
#[derive(Clone)]
pub struct AnalysisScheduler {
    shared: Arc<Shared>,
}

impl AnalysisScheduler {
    pub fn new(
        manager: Arc<StreamManager>,
        reid: Arc<ReidStore>,
        db: Arc<Mutex<Connection>>,
        prompts: PromptLibrary,
        config: SchedulerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                manager,
                reid,
                db,
                prompts,
                config,
                clients: Mutex::new(ClientPool::default()),
                events,
                processing: AtomicBool::new(false),
            }),
        }
    }

    /// Receive every completed analysis from now on
    pub fn subscribe(&self) -> broadcast::Receiver<AnalysisEvent> {
        self.shared.events.subscribe()
    }

    pub fn start_processing(&self) {
        self.shared.processing.store(true, Ordering::SeqCst);
    }

    pub fn stop_processing(&self) {
        self.shared.processing.store(false, Ordering::SeqCst);
    }

    pub fn is_processing(&self) -> bool {
        self.shared.processing.load(Ordering::SeqCst)
    }

    /// Tick at the configured interval until processing is stopped.
    ///
    /// Analyses started by a tick are not awaited; they finish on their own.
    pub async fn run(&self) {
        info!("analysis scheduler started");

        while self.is_processing() {
            let started = tokio::time::Instant::now();
            let dispatched = self.tick();
            debug!("dispatched {} analysis task(s)", dispatched.len());

            // interval is re-read so setter changes apply to the next cycle
            let interval = self.shared.manager.analysis_settings().interval;
            while self.is_processing() {
                let remaining = interval.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    break;
                }
                tokio::time::sleep(remaining.min(STOP_POLL)).await;
            }
        }

        info!("analysis scheduler stopped");
    }

    /// Dispatch one analysis per stream that currently has a frame.
    ///
    /// Must be called from within a tokio runtime.
    pub fn tick(&self) -> Vec<JoinHandle<AnalysisOutcome>> {
        let shared = &self.shared;
        let settings = shared.manager.analysis_settings();
        let streams = shared.manager.streams();

        self.prune_clients(&streams.iter().map(|s| s.config.id).collect::<Vec<_>>());

        let mut handles = Vec::new();
        for info in streams {
            let stream = info.config;
            let Some(frame) = shared.manager.get_latest_frame(stream.id) else {
                warn!(
                    "no frame available for stream {} ({}), status {}",
                    stream.id, stream.url, info.status
                );
                continue;
            };

            let Some(client) = self.client_for(stream.id, &settings) else {
                continue;
            };

            let shared = shared.clone();
            let default_prompt = settings.default_prompt.clone();
            handles.push(tokio::spawn(async move {
                analyze(shared, client, stream, frame, default_prompt).await
            }));
        }
        handles
    }

    fn clients(&self) -> MutexGuard<'_, ClientPool> {
        self.shared
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// One client per stream; all are rebuilt when the AI settings change
    fn client_for(&self, stream_id: i64, settings: &AnalysisSettings) -> Option<Arc<AiClient>> {
        let mut pool = self.clients();
        if pool.revision != settings.revision {
            if !pool.clients.is_empty() {
                info!("ai configuration changed, recreating {} client(s)", pool.clients.len());
            }
            pool.clients.clear();
            pool.revision = settings.revision;
        }

        if let Some(client) = pool.clients.get(&stream_id) {
            return Some(client.clone());
        }

        match AiClient::new(settings.ai.clone()) {
            Ok(client) => {
                let client = Arc::new(client);
                debug!("created ai client {} for stream {}", client.user_id(), stream_id);
                pool.clients.insert(stream_id, client.clone());
                Some(client)
            }
            Err(e) => {
                error!("failed to create ai client for stream {}: {}", stream_id, e);
                None
            }
        }
    }

    fn prune_clients(&self, live: &[i64]) {
        self.clients().clients.retain(|id, _| live.contains(id));
    }

    /// Forget the conversation of one stream's client
    pub fn clear_history(&self, stream_id: i64) -> bool {
        match self.clients().clients.get(&stream_id) {
            Some(client) => {
                client.clear_history();
                true
            }
            None => false,
        }
    }
}

async fn analyze(
    shared: Arc<Shared>,
    client: Arc<AiClient>,
    stream: StreamConfig,
    frame: Frame,
    default_prompt: String,
) -> AnalysisOutcome {
    let frame_name = snapshot_filename(frame.captured_at());
    let snapshot = shared.config.snapshot_dir.as_ref().map(|dir| dir.join(&frame_name));
    let quality = shared.config.jpeg_quality;

    let encoded =
        tokio::task::spawn_blocking(move || encode_frame(&frame, quality, snapshot.as_deref()))
            .await;
    let image = match encoded {
        Ok(Ok(image)) => image,
        Ok(Err(e)) => {
            error!("failed to encode {} from stream {} ({}): {}", frame_name, stream.id, stream.url, e);
            return AnalysisOutcome::EncodeFailed;
        }
        Err(e) => {
            error!("encoder task for {} failed: {}", frame_name, e);
            return AnalysisOutcome::EncodeFailed;
        }
    };

    let context = shared.reid.snapshot();
    let prompt = shared
        .prompts
        .compose(&stream.prompt_template, &default_prompt, &context);

    let max_attempts = shared.config.max_attempts.max(1);
    let mut attempt = 0;
    let reply = loop {
        attempt += 1;
        let failure = match client.send_request(&prompt, Some(&image)).await {
            Ok(text) if !text.trim().is_empty() => break text,
            Ok(_) => "empty reply".to_string(),
            Err(e) => e.to_string(),
        };

        warn!(
            "analysis attempt {}/{} for {} from stream {} ({}) failed: {}",
            attempt, max_attempts, frame_name, stream.id, stream.url, failure
        );
        if attempt >= max_attempts {
            error!(
                "giving up on {} from stream {} ({}) after {} attempts",
                frame_name, stream.id, stream.url, attempt
            );
            return AnalysisOutcome::Abandoned { attempts: attempt };
        }
        tokio::time::sleep(shared.config.retry_backoff).await;
    };

    let analyzed_at = Utc::now();
    let result = AnalysisResult::parse(&reply);

    let mut tracked = Vec::new();
    for person in result.people() {
        match PersonObservation::from_report(person, analyzed_at) {
            Some(observation) => tracked.push(shared.reid.upsert_at(observation, analyzed_at)),
            None => debug!("ignoring person without id in {}", frame_name),
        }
    }

    match result.violation() {
        Some(description) => warn!(
            "safety violation on stream {} ({}) in {}: {}",
            stream.id, stream.url, frame_name, description
        ),
        None if !result.is_structured() => info!(
            "unstructured analysis for {} from stream {} ({})",
            frame_name, stream.id, stream.url
        ),
        None => info!(
            "no violation in {} from stream {} ({})",
            frame_name, stream.id, stream.url
        ),
    }

    let db = shared.db.clone();
    let stored = result.clone();
    let stream_id = stream.id;
    let persisted =
        tokio::task::spawn_blocking(move || persist(&db, stream_id, analyzed_at, &stored, &tracked))
            .await;
    match persisted {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(
            "failed to persist analysis of {} for stream {}: {:#}",
            frame_name, stream.id, e
        ),
        Err(e) => error!("persist task for {} failed: {}", frame_name, e),
    }

    // no subscribers is fine
    let _ = shared.events.send(AnalysisEvent {
        stream_id: stream.id,
        source_url: stream.url,
        frame_name,
        analyzed_at,
        result: result.clone(),
    });

    AnalysisOutcome::Completed(result)
}

/// JPEG encode once, optionally keep a copy on disk, return base64
fn encode_frame(frame: &Frame, quality: u8, snapshot: Option<&Path>) -> vigil_capture::Result<String> {
    let jpeg = frame.encode_jpeg(quality)?;

    if let Some(path) = snapshot {
        let written = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|_| std::fs::write(path, &jpeg));
        if let Err(e) = written {
            warn!("failed to write snapshot {:?}: {}", path, e);
        }
    }

    Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
}

fn persist(
    db: &Mutex<Connection>,
    stream_id: i64,
    analyzed_at: DateTime<Utc>,
    result: &AnalysisResult,
    people: &[PersonObservation],
) -> anyhow::Result<()> {
    let conn = db.lock().unwrap_or_else(PoisonError::into_inner);

    vigil_db::save_analysis_result(
        &conn,
        &NewAnalysisResult {
            stream_id,
            timestamp: analyzed_at,
            result: result.to_json(),
        },
    )?;

    for person in people {
        vigil_db::save_person_features(&conn, &person.to_record(analyzed_at))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use vigil_ai::DEFAULT_PROMPT_TEMPLATE;
    use vigil_capture::{CaptureError, FrameSession, FrameSource, PixelLayout};
    use vigil_db::Database;

    struct Offline;

    impl FrameSource for Offline {
        fn open(&self, url: &str) -> vigil_capture::Result<Box<dyn FrameSession>> {
            Err(CaptureError::Connect {
                url: url.to_string(),
                reason: "offline".to_string(),
            })
        }
    }

    fn scheduler() -> (AnalysisScheduler, Arc<StreamManager>) {
        let manager = Arc::new(StreamManager::new(
            Arc::new(Offline),
            ManagerConfig::default(),
            AnalysisSettings::default(),
        ));
        let db = Database::open_in_memory().unwrap().into_connection();
        let scheduler = AnalysisScheduler::new(
            manager.clone(),
            Arc::new(ReidStore::new()),
            Arc::new(Mutex::new(db)),
            PromptLibrary::default(),
            SchedulerConfig::default(),
        );
        (scheduler, manager)
    }

    #[test]
    fn test_encode_frame_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let frame = Frame::new(vec![120; 4 * 4 * 3], 4, 4, PixelLayout::Rgb8, Utc::now()).unwrap();
        let path = dir.path().join("snaps").join(snapshot_filename(frame.captured_at()));

        let encoded = encode_frame(&frame, 85, Some(&path)).unwrap();
        let jpeg = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();

        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(std::fs::read(&path).unwrap(), jpeg);
    }

    #[tokio::test]
    async fn test_tick_skips_streams_without_frames() {
        let (scheduler, manager) = scheduler();
        manager.add_stream(1, "rtsp://cam/1", DEFAULT_PROMPT_TEMPLATE);
        assert!(scheduler.tick().is_empty());
    }

    #[test]
    fn test_clients_follow_settings_revision() {
        let (scheduler, manager) = scheduler();

        let settings = manager.analysis_settings();
        let first = scheduler.client_for(1, &settings).unwrap();
        let again = scheduler.client_for(1, &settings).unwrap();
        let other = scheduler.client_for(2, &settings).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_ne!(first.user_id(), other.user_id());

        manager.set_ai_config("gpt-4o-mini", "key", "http://127.0.0.1:9/v1");
        let rebuilt = scheduler.client_for(1, &manager.analysis_settings()).unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
        assert_eq!(rebuilt.config().model, "gpt-4o-mini");

        scheduler.prune_clients(&[]);
        assert!(!scheduler.clear_history(1));
    }

    #[tokio::test]
    async fn test_run_returns_once_processing_stops() {
        let (scheduler, manager) = scheduler();
        manager.set_analysis_interval(Duration::from_secs(60));
        scheduler.start_processing();

        let runner = scheduler.clone();
        let task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop_processing();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
