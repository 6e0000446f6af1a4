//! Optional deferred-wake capability for work registered while offline.

use std::sync::Mutex;
use std::sync::PoisonError;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

pub const BACKGROUND_SYNC_TAG: &str = "background-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WakeMessage {
    BackgroundSync,
}

pub trait BackgroundWake: Send + Sync {
    /// Registers a named task. Returns whether the platform accepted it.
    fn register(&self, tag: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWake;

impl BackgroundWake for NoopWake {
    fn register(&self, _tag: &str) -> bool {
        false
    }
}

/// Wake capability backed by a channel: registrations are remembered until
/// the host calls [`ChannelWake::fire`], which posts one message per
/// pending tag.
#[derive(Debug)]
pub struct ChannelWake {
    tx: mpsc::UnboundedSender<WakeMessage>,
    pending: Mutex<Vec<String>>,
}

impl ChannelWake {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WakeMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|pending| pending == tag)
    }

    /// Returns how many messages were posted.
    pub fn fire(&self) -> usize {
        let pending =
            std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        let mut posted = 0;
        for tag in pending {
            if tag == BACKGROUND_SYNC_TAG && self.tx.send(WakeMessage::BackgroundSync).is_ok() {
                posted += 1;
            }
        }
        if posted > 0 {
            debug!(posted, "background wake fired");
        }
        posted
    }
}

impl BackgroundWake for ChannelWake {
    fn register(&self, tag: &str) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !pending.iter().any(|existing| existing == tag) {
            pending.push(tag.to_string());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_message_uses_wire_shape() {
        let value = serde_json::to_value(WakeMessage::BackgroundSync).unwrap();
        assert_eq!(value, serde_json::json!({"type": "BACKGROUND_SYNC"}));
    }

    #[test]
    fn noop_wake_declines_registration() {
        assert!(!NoopWake.register(BACKGROUND_SYNC_TAG));
    }

    #[tokio::test]
    async fn channel_wake_coalesces_registrations_until_fired() {
        let (wake, mut rx) = ChannelWake::new();
        assert!(wake.register(BACKGROUND_SYNC_TAG));
        assert!(wake.register(BACKGROUND_SYNC_TAG));
        assert!(wake.is_registered(BACKGROUND_SYNC_TAG));

        assert_eq!(wake.fire(), 1);
        assert_eq!(rx.recv().await, Some(WakeMessage::BackgroundSync));
        assert!(!wake.is_registered(BACKGROUND_SYNC_TAG));
        assert_eq!(wake.fire(), 0);
    }
}
