//! Vigil web surface - JSON receiver and pipeline status API

pub mod error;
pub mod routes;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use server::{router, serve};
pub use state::{AppState, StreamDirectory, StreamView};
