//! vigil-capture - Video stream capture for Vigil
//!
//! Decodes network streams and local cameras through FFmpeg, runs one
//! isolated worker thread per stream and hands the newest decoded frame
//! to consumers through a drop-oldest queue.

pub mod error;
pub mod frame;
pub mod queue;
pub mod source;
pub mod stream;
pub mod worker;

pub use error::{CaptureError, Result};
pub use frame::{snapshot_filename, Frame, PixelLayout};
pub use queue::FrameQueue;
pub use source::{
    check_ffmpeg, check_ffprobe, FfmpegSource, FrameSession, FrameSource, KillHook, SourceLocator,
};
pub use stream::{FrameStream, RetryPolicy};
pub use worker::{KillSwitch, StatusReport, StreamStatus, StreamWorker, WorkerConfig};
