//! Vigil Core Library
//!
//! Stream management, re-identification memory, the analysis scheduler and
//! settings shared by the `vigil` binary.

pub mod manager;
pub mod reid;
pub mod scheduler;
pub mod settings;

pub use manager::{
    AnalysisSettings, ManagerConfig, ShutdownConfig, StopHandle, StopSummary, StreamConfig,
    StreamInfo, StreamManager,
};
pub use reid::{PersonObservation, ReidStore};
pub use scheduler::{AnalysisEvent, AnalysisOutcome, AnalysisScheduler, SchedulerConfig};
pub use settings::Settings;
