use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::types::{RunEvent, RunId};

/// Fan-out of run events over a tokio broadcast channel.
///
/// Several runs may share one bus. [`subscribe`](Self::subscribe) sees every
/// event; [`subscribe_run`](Self::subscribe_run) sees a single run's.
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Events of `run_id` only, ending after its `RunHalted`.
    pub fn subscribe_run(&self, run_id: RunId) -> RunSubscription {
        RunSubscription {
            run_id,
            rx: self.tx.subscribe(),
            done: false,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Receiver filtered to one run.
pub struct RunSubscription {
    run_id: RunId,
    rx: broadcast::Receiver<RunEvent>,
    done: bool,
}

impl RunSubscription {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Next event of this run. `None` once the run has halted or the bus is
    /// gone. Events dropped because the subscriber lagged are skipped.
    pub async fn recv(&mut self) -> Option<RunEvent> {
        if self.done {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) if event.run_id() == &self.run_id => {
                    self.done = event.is_terminal();
                    return Some(event);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(run_id = %self.run_id, skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}
