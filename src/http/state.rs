use crate::session::SessionSupervisor;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub supervisor: SessionSupervisor,
}

impl AppState {
    pub fn new(supervisor: SessionSupervisor) -> Self {
        Self { supervisor }
    }
}
