//! Observation of the health of the tasks.
//!
//! Observers receive every [`HealthEvent`] on a dedicated thread. The scheduler never waits
//! for them: if they are too slow, the events that do not fit in the channel are dropped.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use crate::plugin::call::panic_message;
use crate::task::{HealthEvent, HealthEventKind, HealthState};

/// Receives the health events of the tasks.
pub trait HealthObserver: Send + 'static {
    fn on_event(&mut self, event: &HealthEvent);
}

impl<F: FnMut(&HealthEvent) + Send + 'static> HealthObserver for F {
    fn on_event(&mut self, event: &HealthEvent) {
        self(event)
    }
}

/// Logs the health events.
#[derive(Debug, Default)]
pub struct LogObserver;

impl HealthObserver for LogObserver {
    fn on_event(&mut self, event: &HealthEvent) {
        let task = &event.task;
        let detail = event.detail.as_deref().unwrap_or("no detail");
        match (&event.kind, &event.state) {
            (HealthEventKind::Transition, HealthState::Starting) => log::debug!("Task {task} is starting"),
            (HealthEventKind::Transition, HealthState::Quarantined { reason, .. }) => {
                log::error!("Task {task} quarantined: {reason}")
            }
            (HealthEventKind::Transition, HealthState::Degraded(n)) => {
                log::warn!("Task {task} degraded ({n} consecutive failures): {detail}")
            }
            (HealthEventKind::Transition, state) => log::info!("Task {task} is {state}"),
            (HealthEventKind::RetriesExhausted { writer }, _) => {
                log::warn!("Task {task}: {writer} exhausted its retries: {detail}")
            }
            (HealthEventKind::Restarting { restart, delay }, _) => {
                log::info!("Task {task} will be restarted in {delay:?} (restart {restart})")
            }
        }
    }
}

/// Forwards the events to the observers.
pub(crate) struct ObserverHub {
    tx: Option<mpsc::Sender<HealthEvent>>,
    thread: Option<JoinHandle<()>>,
}

impl ObserverHub {
    pub fn spawn(observers: Vec<Box<dyn HealthObserver>>, capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let thread = std::thread::Builder::new()
            .name(String::from("yamc-observers"))
            .spawn(move || drain(observers, rx))?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    /// Sends an event to the observers. Never blocks.
    pub fn notify(&self, event: HealthEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => (),
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::warn!(
                    "The health observers are too slow, event dropped: task {} is {}",
                    event.task,
                    event.state
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => (),
        }
    }

    /// Waits for the observers to process the remaining events.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("The observer thread panicked");
            }
        }
    }
}

impl Drop for ObserverHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain(mut observers: Vec<Box<dyn HealthObserver>>, mut rx: mpsc::Receiver<HealthEvent>) {
    while let Some(event) = rx.blocking_recv() {
        observers.retain_mut(|observer| match catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))) {
            Ok(()) => true,
            Err(payload) => {
                log::error!(
                    "A health observer panicked and has been removed: {}",
                    panic_message(payload.as_ref())
                );
                false
            }
        });
    }
}
