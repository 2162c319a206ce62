//! Shared application state for web handlers

use std::collections::HashMap;
use std::sync::Arc;

use crate::agents::AgentSet;
use crate::db::Database;
use crate::orchestrator::{Engine, WorkflowSpec};
use crate::stream::GlassDoor;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub door: GlassDoor,
    pub engine: Engine,
    pub agents: AgentSet,
    pub workflows: Arc<HashMap<String, WorkflowSpec>>,
}

impl AppState {
    pub fn new(
        db: Database,
        door: GlassDoor,
        engine: Engine,
        agents: AgentSet,
        workflows: HashMap<String, WorkflowSpec>,
    ) -> Self {
        Self {
            db,
            door,
            engine,
            agents,
            workflows: Arc::new(workflows),
        }
    }
}
