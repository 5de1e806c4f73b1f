use std::sync::Arc;

use application::{GatewayContext, MessageHistoryService};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GatewayContext>,
    pub history: Arc<MessageHistoryService>,
}

impl AppState {
    pub fn new(gateway: Arc<GatewayContext>, history: Arc<MessageHistoryService>) -> Self {
        Self { gateway, history }
    }
}
