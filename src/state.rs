//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use crate::config::Config;
use crate::db::sqlite::SqliteStore;
use crate::orchestrator::Orchestrator;

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<SqliteStore>,
    pub orchestrator: Orchestrator,
}
