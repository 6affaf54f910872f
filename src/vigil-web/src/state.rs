//! Shared application state

use rusqlite::Connection;
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Stream configuration joined with its live status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamView {
    pub id: i64,
    pub url: String,
    pub prompt_template: String,
    pub added_time: String,
    pub status: String,
}

/// Read-only view of the running streams
pub trait StreamDirectory: Send + Sync + 'static {
    fn streams(&self) -> Vec<StreamView>;
}

/// Shared state across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection shared with the analysis pipeline
    pub db: Arc<Mutex<Connection>>,

    pub directory: Arc<dyn StreamDirectory>,
}

impl AppState {
    pub fn new(db: Arc<Mutex<Connection>>, directory: Arc<dyn StreamDirectory>) -> Self {
        Self { db, directory }
    }
}
