//! Shared fixtures for pipeline tests: a local chat completions endpoint,
//! synthetic frame sources and an in-memory pipeline.

#![allow(dead_code)]

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vigil_ai::{AiConfig, PromptLibrary, DEFAULT_PROMPT_TEMPLATE};
use vigil_capture::{Frame, FrameSession, FrameSource, PixelLayout, WorkerConfig};
use vigil_core::{
    AnalysisScheduler, AnalysisSettings, ManagerConfig, ReidStore, SchedulerConfig,
    ShutdownConfig, StopSummary, StreamManager,
};
use vigil_db::Database;

/// What the endpoint answers to one request
#[derive(Debug, Clone)]
pub enum MockReply {
    Content(String),
    RateLimited { retry_after: u64 },
    Status(u16),
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub at: Instant,
    pub body: Value,
}

struct MockState {
    scripted: Mutex<VecDeque<MockReply>>,
    fallback: MockReply,
    requests: Mutex<Vec<RecordedRequest>>,
}

pub struct MockAi {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockAi {
    /// Answer with `scripted` in order, then `fallback` forever
    pub async fn start(scripted: Vec<MockReply>, fallback: MockReply) -> Self {
        let state = Arc::new(MockState {
            scripted: Mutex::new(scripted.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn api_base(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

async fn completions(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    state.requests.lock().unwrap().push(RecordedRequest {
        at: Instant::now(),
        body,
    });

    let reply = state
        .scripted
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| state.fallback.clone());

    match reply {
        MockReply::Content(content) => Json(json!({
            "id": "chatcmpl-test",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }]
        }))
        .into_response(),
        MockReply::RateLimited { retry_after } => (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", retry_after.to_string())],
            "rate limit exceeded",
        )
            .into_response(),
        MockReply::Status(code) => (
            StatusCode::from_u16(code).unwrap(),
            "upstream failure",
        )
            .into_response(),
    }
}

pub fn content(value: Value) -> MockReply {
    MockReply::Content(value.to_string())
}

/// Each session decodes `frames` solid-grey frames, then reports end of stream
pub struct SyntheticSource {
    pub frames: usize,
}

struct SyntheticSession {
    remaining: usize,
}

impl FrameSession for SyntheticSession {
    fn read_frame(&mut self) -> vigil_capture::Result<Option<Frame>> {
        if self.remaining == 0 {
            std::thread::sleep(Duration::from_millis(10));
            return Ok(None);
        }
        self.remaining -= 1;
        Frame::new(vec![128; 16 * 16 * 3], 16, 16, PixelLayout::Rgb8, Utc::now()).map(Some)
    }
}

impl FrameSource for SyntheticSource {
    fn open(&self, _url: &str) -> vigil_capture::Result<Box<dyn FrameSession>> {
        Ok(Box::new(SyntheticSession {
            remaining: self.frames,
        }))
    }
}

pub fn fast_scheduler(retry_backoff: Duration) -> SchedulerConfig {
    SchedulerConfig {
        max_attempts: 3,
        retry_backoff,
        snapshot_dir: None,
        jpeg_quality: 80,
    }
}

pub struct Pipeline {
    pub manager: Arc<StreamManager>,
    pub scheduler: AnalysisScheduler,
    pub reid: Arc<ReidStore>,
    pub db: Arc<Mutex<Connection>>,
}

impl Pipeline {
    pub fn new(source: SyntheticSource, api_base: &str, config: SchedulerConfig) -> Self {
        let mut ai = AiConfig::new("test-model", "sk-test", api_base);
        ai.min_request_interval = Duration::from_millis(10);
        ai.request_timeout = Duration::from_secs(10);

        let manager = Arc::new(StreamManager::new(
            Arc::new(source),
            ManagerConfig {
                queue_capacity: 1,
                worker: WorkerConfig {
                    frame_interval: Duration::from_millis(5),
                    read_retry_delay: Duration::from_millis(20),
                    cancel_poll: Duration::from_millis(5),
                },
                shutdown: ShutdownConfig {
                    remove_grace: Duration::from_secs(1),
                    stop_grace: Duration::from_secs(1),
                    stop_escalation: Duration::from_secs(1),
                },
            },
            AnalysisSettings {
                interval: Duration::from_secs(1),
                ai,
                ..AnalysisSettings::default()
            },
        ));

        let db = Arc::new(Mutex::new(
            Database::open_in_memory().unwrap().into_connection(),
        ));
        let reid = Arc::new(ReidStore::new());
        let scheduler = AnalysisScheduler::new(
            manager.clone(),
            reid.clone(),
            db.clone(),
            PromptLibrary::default(),
            config,
        );

        Self {
            manager,
            scheduler,
            reid,
            db,
        }
    }

    /// Register a stream in the database and the manager
    pub fn add_stream(&self, url: &str) -> i64 {
        let id = vigil_db::add_stream(&self.db.lock().unwrap(), url, DEFAULT_PROMPT_TEMPLATE).unwrap();
        assert!(self.manager.add_stream(id, url, DEFAULT_PROMPT_TEMPLATE));
        id
    }

    pub async fn wait_for_frame(&self, id: i64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.manager.queued_frames(id) != Some(1) {
            assert!(Instant::now() < deadline, "no frame from stream {}", id);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn result_count(&self, id: i64) -> i64 {
        vigil_db::count_analysis_results(&self.db.lock().unwrap(), id).unwrap()
    }

    pub async fn shutdown(&self) -> StopSummary {
        let stop = self.manager.stop_all_streams();
        tokio::task::spawn_blocking(move || stop.wait()).await.unwrap()
    }
}
