//! Async channel between the platform USB layer and the bridge engine
//!
//! Hot-plug notifications originate on a blocking OS thread (libusb event
//! loop) and are consumed by Tokio tasks, so the channel offers both blocking
//! and async ends.

use crate::usb_types::{AttachRequest, DeviceKey};
use async_channel::{Receiver, Sender, TrySendError, bounded};

/// Capacity of the platform event queue
pub const PLATFORM_CHANNEL_CAPACITY: usize = 256;

/// Events from the platform USB layer
#[derive(Debug)]
pub enum PlatformEvent {
    /// Device plugged in (or found during enumeration)
    Attached(AttachRequest),

    /// Device unplugged
    Detached(DeviceKey),
}

/// Producer side, held by the platform integration
#[derive(Clone)]
pub struct PlatformEventSender {
    tx: Sender<PlatformEvent>,
}

impl PlatformEventSender {
    /// Send an event from async context
    pub async fn send(&self, event: PlatformEvent) -> crate::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send an event without blocking
    ///
    /// Used from libusb callbacks, which must never block the event loop.
    pub fn try_send(&self, event: PlatformEvent) -> crate::Result<()> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => crate::Error::Channel("platform event queue full".into()),
            TrySendError::Closed(_) => crate::Error::Channel("platform event queue closed".into()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, held by the bridge engine
#[derive(Clone)]
pub struct PlatformEventReceiver {
    rx: Receiver<PlatformEvent>,
}

impl PlatformEventReceiver {
    /// Receive the next event
    pub async fn recv(&self) -> crate::Result<PlatformEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Discard every queued event, returning how many were dropped
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Create the platform event channel
///
/// Returns (sender for the platform, receiver for the engine)
pub fn create_platform_channel() -> (PlatformEventSender, PlatformEventReceiver) {
    let (tx, rx) = bounded(PLATFORM_CHANNEL_CAPACITY);
    (PlatformEventSender { tx }, PlatformEventReceiver { rx })
}
