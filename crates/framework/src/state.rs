//! Connection state ownership and listener notification.
//!
//! One dispatcher task owns the current [`ConnectionState`] and the listener
//! registry. Raw connectivity signals and listener registrations flow through
//! the same command channel, which serializes them: a listener registered
//! concurrently with a transition receives at least the state current at the
//! moment its registration completed, and every listener sees transitions in
//! chronological order.

use canopy_primitives::{ConnectionState, RawConnectionSignal};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

enum StateCommand {
    Signal(RawConnectionSignal),
    Subscribe {
        listener: mpsc::UnboundedSender<ConnectionState>,
        ack: oneshot::Sender<()>,
    },
    Close {
        ack: oneshot::Sender<()>,
    },
}

struct Dispatcher {
    state: ConnectionState,
    ever_connected: bool,
    has_transitioned: bool,
    listeners: Vec<mpsc::UnboundedSender<ConnectionState>>,
    current_tx: watch::Sender<ConnectionState>,
}

impl Dispatcher {
    /// Map a raw signal onto the state machine. A raw `Connected` means
    /// `Connected` the first time and `Reconnected` after any drop, including
    /// recovery from a read-only replica to a full session; a signal that
    /// would not change the current state is ignored.
    fn translate(&mut self, raw: RawConnectionSignal) -> Option<ConnectionState> {
        let next = match raw {
            RawConnectionSignal::Connected => {
                if matches!(
                    self.state,
                    ConnectionState::Connected | ConnectionState::Reconnected
                ) {
                    return None;
                }
                if self.ever_connected {
                    ConnectionState::Reconnected
                } else {
                    self.ever_connected = true;
                    ConnectionState::Connected
                }
            }
            RawConnectionSignal::Suspended => ConnectionState::Suspended,
            RawConnectionSignal::Lost => ConnectionState::Lost,
            RawConnectionSignal::ReadOnly => ConnectionState::ReadOnly,
        };
        (next != self.state || !self.has_transitioned).then_some(next)
    }

    fn apply(&mut self, raw: RawConnectionSignal) {
        let Some(next) = self.translate(raw) else {
            return;
        };
        debug!(from = %self.state, to = %next, "connection state transition");
        self.state = next;
        self.has_transitioned = true;
        let _ = self.current_tx.send_replace(next);
        // A listener whose receiver is gone is dropped; delivery failures
        // never affect the remaining listeners or the state machine.
        self.listeners.retain(|listener| listener.send(next).is_ok());
    }

    fn subscribe(&mut self, listener: mpsc::UnboundedSender<ConnectionState>) {
        // Snapshot delivery closes the race where a listener added just
        // before a transition would otherwise sit on a default value
        // forever. Before the first real transition there is nothing to
        // replay; the listener will see the first transition itself.
        if self.has_transitioned && listener.send(self.state).is_err() {
            return;
        }
        self.listeners.push(listener);
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<StateCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                StateCommand::Signal(raw) => self.apply(raw),
                StateCommand::Subscribe { listener, ack } => {
                    self.subscribe(listener);
                    let _ = ack.send(());
                }
                StateCommand::Close { ack } => {
                    commands.close();
                    // Acknowledge any close requests that raced in behind us.
                    while let Some(trailing) = commands.recv().await {
                        if let StateCommand::Close { ack } = trailing {
                            let _ = ack.send(());
                        }
                    }
                    self.listeners.clear();
                    let _ = ack.send(());
                    break;
                }
            }
        }
        debug!("connection state dispatcher stopped");
    }
}

/// Owner of the process-wide connection state.
///
/// Cheap to clone; all clones address the same dispatcher task.
#[derive(Clone, Debug)]
pub struct ConnectionStateManager {
    commands: mpsc::UnboundedSender<StateCommand>,
    current: watch::Receiver<ConnectionState>,
}

impl ConnectionStateManager {
    /// Spawn the dispatcher task. Initial state is [`ConnectionState::Lost`].
    #[must_use]
    pub fn start() -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (current_tx, current) = watch::channel(ConnectionState::Lost);
        let dispatcher = Dispatcher {
            state: ConnectionState::Lost,
            ever_connected: false,
            has_transitioned: false,
            listeners: Vec::new(),
            current_tx,
        };
        drop(tokio::spawn(dispatcher.run(commands_rx)));
        Self { commands, current }
    }

    /// Feed one raw connectivity signal into the state machine.
    ///
    /// Never blocks: delivery happens on the dispatcher task, so this is safe
    /// to call from the service's own notification context.
    pub fn signal(&self, raw: RawConnectionSignal) {
        if self.commands.send(StateCommand::Signal(raw)).is_err() {
            warn!(?raw, "connection signal dropped: state manager is closed");
        }
    }

    /// Register a listener. Completion of this call is the registration
    /// point: the listener observes every transition after it, plus the
    /// state current at that point if any transition has already happened.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionState> {
        let (listener, rx) = mpsc::unbounded_channel();
        let (ack, acked) = oneshot::channel();
        if self
            .commands
            .send(StateCommand::Subscribe { listener, ack })
            .is_ok()
        {
            let _ = acked.await;
        }
        rx
    }

    /// Snapshot of the state as of the last processed transition.
    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        *self.current.borrow()
    }

    /// Watch-channel mirror of the current state, for components that poll.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.current.clone()
    }

    /// Stop the dispatcher. Idempotent; no listener is notified after this
    /// returns.
    pub async fn close(&self) {
        let (ack, acked) = oneshot::channel();
        if self.commands.send(StateCommand::Close { ack }).is_ok() {
            let _ = acked.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_connected_is_connected_then_reconnected() {
        let manager = ConnectionStateManager::start();
        let mut listener = manager.subscribe().await;

        manager.signal(RawConnectionSignal::Connected);
        manager.signal(RawConnectionSignal::Suspended);
        manager.signal(RawConnectionSignal::Connected);

        assert_eq!(listener.recv().await, Some(ConnectionState::Connected));
        assert_eq!(listener.recv().await, Some(ConnectionState::Suspended));
        assert_eq!(listener.recv().await, Some(ConnectionState::Reconnected));
        manager.close().await;
    }

    #[tokio::test]
    async fn late_subscriber_receives_current_state_snapshot() {
        let manager = ConnectionStateManager::start();
        manager.signal(RawConnectionSignal::Connected);

        // Registration is serialized behind the signal: the snapshot must be
        // Connected, not the initial Lost.
        let mut listener = manager.subscribe().await;
        assert_eq!(listener.recv().await, Some(ConnectionState::Connected));
        manager.close().await;
    }

    #[tokio::test]
    async fn early_subscriber_sees_no_stale_default() {
        let manager = ConnectionStateManager::start();
        let mut listener = manager.subscribe().await;

        // Nothing has happened yet; nothing must have been delivered.
        assert!(listener.try_recv().is_err());

        manager.signal(RawConnectionSignal::Connected);
        assert_eq!(listener.recv().await, Some(ConnectionState::Connected));
        manager.close().await;
    }

    #[tokio::test]
    async fn read_only_recovery_surfaces_reconnected() {
        let manager = ConnectionStateManager::start();
        let mut listener = manager.subscribe().await;

        manager.signal(RawConnectionSignal::Connected);
        manager.signal(RawConnectionSignal::Suspended);
        manager.signal(RawConnectionSignal::ReadOnly);
        manager.signal(RawConnectionSignal::Connected);

        assert_eq!(listener.recv().await, Some(ConnectionState::Connected));
        assert_eq!(listener.recv().await, Some(ConnectionState::Suspended));
        assert_eq!(listener.recv().await, Some(ConnectionState::ReadOnly));
        assert_eq!(listener.recv().await, Some(ConnectionState::Reconnected));
        manager.close().await;
    }

    #[tokio::test]
    async fn duplicate_signals_are_suppressed() {
        let manager = ConnectionStateManager::start();
        let mut listener = manager.subscribe().await;

        manager.signal(RawConnectionSignal::Connected);
        manager.signal(RawConnectionSignal::Connected);
        manager.signal(RawConnectionSignal::Suspended);

        assert_eq!(listener.recv().await, Some(ConnectionState::Connected));
        assert_eq!(listener.recv().await, Some(ConnectionState::Suspended));
        assert!(listener.try_recv().is_err());
        manager.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let manager = ConnectionStateManager::start();
        let mut listener = manager.subscribe().await;
        manager.close().await;
        manager.close().await;

        manager.signal(RawConnectionSignal::Connected);
        assert_eq!(listener.recv().await, None);
    }
}
