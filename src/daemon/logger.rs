use std::sync::Arc;

use probe_core::{
    bus::receive_from_broadcast,
    event::Event,
    pdk::{CleanExit, ModuleError, ShutdownSignal},
};
use tokio::sync::broadcast::Receiver;

/// Print every event dispatched on the bus until `shutdown` fires.
pub async fn event_logger(
    mut rx: Receiver<Arc<Event>>,
    mut shutdown: ShutdownSignal,
) -> Result<CleanExit, ModuleError> {
    loop {
        tokio::select! {
            r = shutdown.recv() => return r,
            msg = receive_from_broadcast(&mut rx, "event-logger") => {
                let event = msg?;
                log::info!(target: "event", "{event}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use probe_core::bus::Bus;

    use super::*;

    #[tokio::test]
    async fn stops_on_shutdown() {
        let bus = Bus::new();
        let (tx, shutdown) = ShutdownSignal::new();
        let task = tokio::spawn(event_logger(bus.get_receiver(), shutdown));
        tx.send_signal();
        let exit = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("logger did not stop")
            .unwrap();
        assert!(exit.is_ok());
    }
}
