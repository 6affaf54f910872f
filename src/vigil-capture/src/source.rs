//! Frame sources: network streams and local cameras decoded by FFmpeg
//!
//! A `FrameSource` opens decode sessions; a `FrameSession` yields frames
//! until the stream ends. The production implementation pipes raw RGB24
//! frames out of an `ffmpeg` child process, so a hung decode can always be
//! forced down by killing that process.

use chrono::Utc;
use std::fmt;
use std::io::{ErrorKind, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::error::{CaptureError, Result};
use crate::frame::{Frame, PixelLayout};

/// Accepted network schemes
const NETWORK_SCHEMES: &[&str] = &["rtsp", "rtmp", "http", "https"];

/// Callback that forcibly tears down a blocked session
pub type KillHook = Box<dyn FnMut() + Send>;

/// Where frames come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// rtsp://, rtmp://, http:// or https:// stream
    Network(String),
    /// Local camera by index
    Camera(u32),
}

impl SourceLocator {
    /// Validate a user supplied source string
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CaptureError::InvalidUrl("empty source".to_string()));
        }

        if raw.chars().all(|c| c.is_ascii_digit()) {
            return raw
                .parse::<u32>()
                .map(SourceLocator::Camera)
                .map_err(|e| CaptureError::InvalidUrl(format!("{}: {}", raw, e)));
        }

        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| CaptureError::InvalidUrl(format!("{}: missing scheme", raw)))?;

        if !NETWORK_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) {
            return Err(CaptureError::InvalidUrl(format!(
                "{}: unsupported scheme '{}'",
                raw, scheme
            )));
        }

        if rest.is_empty() {
            return Err(CaptureError::InvalidUrl(format!("{}: missing host", raw)));
        }

        Ok(SourceLocator::Network(raw.to_string()))
    }

    /// FFmpeg/FFprobe input arguments for this source
    fn input_args(&self) -> Result<Vec<String>> {
        match self {
            SourceLocator::Network(url) => {
                let mut args = Vec::new();
                if url.to_ascii_lowercase().starts_with("rtsp://") {
                    args.extend(["-rtsp_transport".to_string(), "tcp".to_string()]);
                }
                args.extend(["-i".to_string(), url.clone()]);
                Ok(args)
            }
            SourceLocator::Camera(index) => camera_input_args(*index),
        }
    }
}

#[cfg(target_os = "linux")]
fn camera_input_args(index: u32) -> Result<Vec<String>> {
    Ok(vec![
        "-f".to_string(),
        "v4l2".to_string(),
        "-i".to_string(),
        format!("/dev/video{}", index),
    ])
}

#[cfg(target_os = "macos")]
fn camera_input_args(index: u32) -> Result<Vec<String>> {
    Ok(vec![
        "-f".to_string(),
        "avfoundation".to_string(),
        "-i".to_string(),
        index.to_string(),
    ])
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn camera_input_args(index: u32) -> Result<Vec<String>> {
    Err(CaptureError::Connect {
        url: index.to_string(),
        reason: "camera capture by index is not supported on this platform".to_string(),
    })
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::Network(url) => write!(f, "{}", url),
            SourceLocator::Camera(index) => write!(f, "camera {}", index),
        }
    }
}

/// Opens decode sessions for a source url
pub trait FrameSource: Send + Sync + 'static {
    /// Open a session; failure here is a connect error and is not retried by workers
    fn open(&self, url: &str) -> Result<Box<dyn FrameSession>>;
}

/// One open decode session
pub trait FrameSession: Send {
    /// Read the next frame. `Ok(None)` signals end of stream.
    fn read_frame(&mut self) -> Result<Option<Frame>>;

    /// Whether the underlying session is still usable after a failed read
    fn is_open(&self) -> bool {
        true
    }

    /// Hook that unblocks a read stuck inside the decoder
    fn kill_hook(&self) -> Option<KillHook> {
        None
    }
}

/// FFmpeg command-line decoder
#[derive(Debug, Clone)]
pub struct FfmpegSource {
    ffmpeg: String,
    ffprobe: String,
}

impl Default for FfmpegSource {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }
}

impl FfmpegSource {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Query stream dimensions with ffprobe
    fn probe_dimensions(&self, url: &str, input: &[String]) -> Result<(u32, u32)> {
        let connect_err = |reason: String| CaptureError::Connect {
            url: url.to_string(),
            reason,
        };

        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "stream=width,height", "-of", "csv=p=0"])
            .args(input)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| connect_err(format!("failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(connect_err(stderr.trim().chars().take(300).collect()));
        }

        let dimensions = String::from_utf8_lossy(&output.stdout);
        let line = dimensions.lines().next().unwrap_or("").trim();
        let (w, h) = line
            .split_once(',')
            .ok_or_else(|| connect_err(format!("invalid ffprobe output: '{}'", line)))?;

        let width: u32 = w
            .trim()
            .parse()
            .map_err(|_| connect_err(format!("invalid width '{}'", w)))?;
        let height: u32 = h
            .trim()
            .trim_end_matches(',')
            .parse()
            .map_err(|_| connect_err(format!("invalid height '{}'", h)))?;

        if width == 0 || height == 0 {
            return Err(connect_err(format!("invalid dimensions {}x{}", width, height)));
        }

        Ok((width, height))
    }
}

impl FrameSource for FfmpegSource {
    fn open(&self, url: &str) -> Result<Box<dyn FrameSession>> {
        let locator = SourceLocator::parse(url)?;
        let input = locator.input_args()?;
        let (width, height) = self.probe_dimensions(url, &input)?;

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "error"])
            .args(&input)
            .args(["-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        debug!("spawning ffmpeg decoder: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| CaptureError::Connect {
            url: url.to_string(),
            reason: format!("failed to spawn ffmpeg: {}", e),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| CaptureError::Connect {
            url: url.to_string(),
            reason: "failed to capture ffmpeg stdout".to_string(),
        })?;

        info!("opened {} ({}x{})", locator, width, height);

        Ok(Box::new(FfmpegSession {
            child: Arc::new(Mutex::new(child)),
            stdout,
            width,
            height,
        }))
    }
}

/// Running ffmpeg decoder
struct FfmpegSession {
    child: Arc<Mutex<Child>>,
    stdout: ChildStdout,
    width: u32,
    height: u32,
}

impl FrameSession for FfmpegSession {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let size = self.width as usize * self.height as usize * PixelLayout::Rgb8.channels();
        let mut buf = vec![0u8; size];

        match self.stdout.read_exact(&mut buf) {
            Ok(()) => Frame::new(buf, self.width, self.height, PixelLayout::Rgb8, Utc::now()).map(Some),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(CaptureError::Decode(e.to_string())),
        }
    }

    fn is_open(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(child.try_wait(), Ok(None))
    }

    fn kill_hook(&self) -> Option<KillHook> {
        let child = self.child.clone();
        Some(Box::new(move || {
            let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = child.kill() {
                debug!("ffmpeg kill: {}", e);
            }
        }))
    }
}

impl Drop for FfmpegSession {
    fn drop(&mut self) {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(child.try_wait(), Ok(None)) {
            if let Err(e) = child.kill() {
                warn!("failed to stop ffmpeg decoder: {}", e);
            }
        }
        let _ = child.wait();
    }
}

/// Check if FFmpeg is available
pub fn check_ffmpeg() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check if FFprobe is available
pub fn check_ffprobe() -> bool {
    Command::new("ffprobe")
        .arg("-version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
