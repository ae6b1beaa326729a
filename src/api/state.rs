use std::sync::Arc;
use std::time::Duration;

use crate::engine::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Backend URL with credentials redacted, echoed in `/health`.
    pub backend_url: String,
    /// Polling cadence advertised to clients in `/stats`.
    pub refresh_interval: Duration,
}
