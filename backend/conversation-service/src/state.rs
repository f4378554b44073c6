use crate::{config::Config, services::ConversationOrchestrator};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: ConversationOrchestrator,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(orchestrator: ConversationOrchestrator, config: Arc<Config>) -> Self {
        Self {
            orchestrator,
            config,
        }
    }
}
