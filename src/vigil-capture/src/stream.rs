//! Reconnecting frame sequence
//!
//! `FrameStream` turns a `FrameSource` into a lazy iterator of frames that
//! reopens the source after decode failures. Consecutive failures are
//! bounded by a `RetryPolicy`; a successful read resets the count. Once the
//! budget is spent the iterator ends and stays ended until `restart`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::CaptureError;
use crate::frame::Frame;
use crate::source::{FrameSession, FrameSource};

/// Reconnection budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
    /// Pause before each reconnection attempt
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

pub struct FrameStream {
    source: Arc<dyn FrameSource>,
    url: String,
    policy: RetryPolicy,
    session: Option<Box<dyn FrameSession>>,
    failures: u32,
    exhausted: bool,
}

impl FrameStream {
    pub fn new(source: Arc<dyn FrameSource>, url: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            source,
            url: url.into(),
            policy,
            session: None,
            failures: 0,
            exhausted: false,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Consecutive failures since the last good frame
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// True once the retry budget has been spent
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Error describing why the stream ended, if it did
    pub fn exhaustion_error(&self) -> Option<CaptureError> {
        self.exhausted.then(|| CaptureError::RetriesExhausted {
            url: self.url.clone(),
            attempts: self.failures,
        })
    }

    /// Reset the retry budget so iteration can resume after exhaustion
    pub fn restart(&mut self) {
        self.session = None;
        self.failures = 0;
        self.exhausted = false;
    }

    fn record_failure(&mut self) {
        self.session = None;
        self.failures += 1;

        if self.failures >= self.policy.max_attempts {
            error!("max retries reached for stream: {}", self.url);
            self.exhausted = true;
        } else {
            info!(
                "attempting to reconnect to stream: {} ({}/{})",
                self.url, self.failures, self.policy.max_attempts
            );
            thread::sleep(self.policy.delay);
        }
    }
}

impl Iterator for FrameStream {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        while !self.exhausted {
            if self.session.is_none() {
                match self.source.open(&self.url) {
                    Ok(session) => self.session = Some(session),
                    Err(e) => {
                        error!("cannot open video stream {}: {}", self.url, e);
                        self.record_failure();
                        continue;
                    }
                }
            }

            let Some(session) = self.session.as_mut() else {
                continue;
            };

            match session.read_frame() {
                Ok(Some(frame)) => {
                    self.failures = 0;
                    return Some(frame);
                }
                Ok(None) => {
                    warn!("end of stream: {}", self.url);
                    self.record_failure();
                }
                Err(e) => {
                    warn!("failed to read frame from stream {}: {}", self.url, e);
                    self.record_failure();
                }
            }
        }

        None
    }
}
