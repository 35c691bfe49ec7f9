use tokio::sync::watch;

/// Connectivity as the Connection Manager sees it. Written only by the
/// manager, read by the Outbound Sender and anything that wants to wait for
/// a live socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ConnectionState {
    tx: watch::Sender<ConnectionStatus>,
}

impl ConnectionState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self { tx }
    }

    pub fn set(&self, status: ConnectionStatus) {
        // send_replace never fails; the sender keeps its own receiver alive.
        self.tx.send_replace(status);
    }

    pub fn get(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionStatus::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }

    /// Resolve once the status becomes `Connected`.
    pub async fn wait_connected(&self) {
        let mut rx = self.subscribe();
        // wait_for also checks the current value first.
        let _ = rx.wait_for(|s| *s == ConnectionStatus::Connected).await;
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_disconnected_and_flips() {
        let state = ConnectionState::new();
        assert!(!state.is_connected());
        state.set(ConnectionStatus::Connected);
        assert!(state.is_connected());
        state.wait_connected().await; // resolves immediately
    }
}
