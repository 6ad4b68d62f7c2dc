//! Operator interrupt.
//!
//! A `watch` channel carries a single "stop" flag. The loop checks it at the
//! top of every cycle and races every timed wait against it.

use std::time::Duration;
use tokio::sync::watch;

/// Sending half, held by whoever listens for the signal.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // no receivers left means nobody is waiting anyway
        let _ = self.0.send(true);
    }
}

/// Receiving half, cloned into the loop.
#[derive(Debug, Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn new() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger(tx), Shutdown(rx))
    }

    pub fn is_requested(&self) -> bool {
        *self.0.borrow()
    }

    /// Sleep for `duration` unless interrupted first. Returns `false` when
    /// the sleep was cut short.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_requested() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            Ok(_) = self.0.wait_for(|stop| *stop) => false,
        }
    }
}

/// Forward Ctrl-C to the trigger.
pub fn listen_for_ctrl_c(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, shutting down");
                trigger.trigger();
            }
            Err(e) => tracing::warn!("Cannot listen for interrupt: {}", e),
        }
    });
}
