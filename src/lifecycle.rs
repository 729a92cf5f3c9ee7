//! Host lifecycle signals.
//!
//! The host (a UI shell, a server process) reports focus and connectivity
//! changes through [`LifecycleSignals`]; coordinators that opted in via
//! `refetch_on_focus` / `refetch_on_reconnect` refetch when they arrive.

use tokio::sync::broadcast;

/// A host lifecycle event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The window or view regained focus.
    Focus,
    /// The network came back online.
    Reconnect,
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleEvent::Focus => write!(f, "Focus"),
            LifecycleEvent::Reconnect => write!(f, "Reconnect"),
        }
    }
}

/// Fan-out of lifecycle events to every listening coordinator.
#[derive(Clone)]
pub struct LifecycleSignals {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleSignals {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        LifecycleSignals { sender }
    }

    /// Deliver `event` to current listeners. Returns how many received it.
    pub fn notify(&self, event: LifecycleEvent) -> usize {
        let receivers = self.sender.send(event).unwrap_or(0);
        debug!("Lifecycle {} delivered to {} listeners", event, receivers);
        receivers
    }

    pub fn focus(&self) -> usize {
        self.notify(LifecycleEvent::Focus)
    }

    pub fn reconnect(&self) -> usize {
        self.notify(LifecycleEvent::Reconnect)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn listeners(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LifecycleSignals {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_without_listeners() {
        let signals = LifecycleSignals::new();
        assert_eq!(signals.focus(), 0);
    }

    #[tokio::test]
    async fn test_listeners_receive_events_in_order() {
        let signals = LifecycleSignals::new();
        let mut receiver = signals.subscribe();

        assert_eq!(signals.focus(), 1);
        assert_eq!(signals.reconnect(), 1);

        assert_eq!(receiver.recv().await, Ok(LifecycleEvent::Focus));
        assert_eq!(receiver.recv().await, Ok(LifecycleEvent::Reconnect));
    }
}
