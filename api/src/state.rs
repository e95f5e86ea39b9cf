use std::sync::Arc;

use crate::config::ServerConfig;
use crate::orchestrator::RequestOrchestrator;
use crate::store::SnapshotStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SnapshotStore>,
    pub jarvis: Arc<RequestOrchestrator>,
    pub config: Arc<ServerConfig>,
}
