use std::sync::Arc;

use agentdeck_pty::ProcessProxy;
use serde::Serialize;
use thiserror::Error;

/// A browser attached to the shared session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub addr: String,
    pub user_agent: String,
}

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("client not found: {0}")]
    ClientNotFound(String),

    #[error("terminal sharing is not available")]
    Unavailable,
}

/// Session sharing as seen by the passthrough controller.
///
/// The controller calls these on every agent switch and on shutdown; it
/// never looks at the transport behind them.
pub trait TerminalShare: Send + Sync {
    /// Follow `proxy`'s output (and send client input to it) from now on.
    fn set_proxy(&self, proxy: Option<Arc<ProcessProxy>>);
    fn set_agent_name(&self, name: &str);
    /// Tell clients to clear their screens.
    fn broadcast_reset(&self);
    fn list_clients(&self) -> Vec<ClientInfo>;
    fn disconnect_client(&self, id: &str) -> Result<(), ShareError>;
    fn stop(&self) -> Result<(), ShareError>;
}
