//! Delivery of finished events to the downstream consumer.
//!
//! Monitors only know about the [`EventHandler`] trait. The [`Bus`] is the
//! handler used by the daemon: a broadcast channel where every subscriber
//! receives every event.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::event::Event;

/// Downstream consumer of dispatched events (rule engine, logger, ...).
///
/// Must not block: it's called from the event dispatch loop.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: Event);
}

impl<F> EventHandler for F
where
    F: Fn(Event) + Send + Sync + 'static,
{
    fn handle(&self, event: Event) {
        self(event)
    }
}

#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Arc<Event>>,
}

/// Describes a bus error.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus is stopped")]
    Stopped,
}

const BUFFER_SIZE: usize = 1000;

impl Bus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUFFER_SIZE);
        Self { tx }
    }

    pub fn send(&self, event: Event) {
        log::trace!(
            target: &format!("event::{}", event.header.source),
            "{:?} [{}] {:?}",
            event.header.timestamp,
            event.header.pid,
            event.payload
        );

        // No subscribers is not an error: the event is simply not observed.
        let _ = self.tx.send(Arc::new(event));
    }

    pub fn get_receiver(&self) -> broadcast::Receiver<Arc<Event>> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for Bus {
    fn handle(&self, event: Event) {
        self.send(event)
    }
}

/// Receive an event from a [`broadcast::Receiver`]. Log a warning if we have lost messages
pub async fn receive_from_broadcast(
    rx: &mut broadcast::Receiver<Arc<Event>>,
    consumer: &str,
) -> Result<Arc<Event>, BusError> {
    let mut lost: u64 = 0;
    loop {
        match rx.recv().await {
            Ok(value) => {
                if lost > 0 {
                    log::warn!(target: consumer, "broadcast channel lagged {lost} messages");
                }
                return Ok(value);
            }
            Err(RecvError::Lagged(lagged)) => lost += lagged,
            Err(RecvError::Closed) => return Err(BusError::Stopped),
        }
    }
}
