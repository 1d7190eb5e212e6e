use pulse_engine::AnomalyEngine;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AnomalyEngine>,
}

impl AppState {
    pub fn new(engine: Arc<AnomalyEngine>) -> Self {
        Self { engine }
    }
}
