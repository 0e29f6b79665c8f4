use tokio::sync::broadcast;
use tracing::debug;

const LOGOUT_CHANNEL_CAPACITY: usize = 8;

/// Payload-less broadcast fired when the session can no longer be recovered.
///
/// The authenticated client publishes it after a failed refresh; whoever owns
/// the session subscribes and clears local state.
#[derive(Clone)]
pub struct LogoutBus {
    tx: broadcast::Sender<()>,
}

impl LogoutBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(LOGOUT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self) {
        // No receivers is fine: nobody owns a session yet.
        let receivers = self.tx.send(()).unwrap_or(0);
        debug!(receivers, "Logout event published");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

impl Default for LogoutBus {
    fn default() -> Self {
        Self::new()
    }
}
