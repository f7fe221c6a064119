//! Encode-and-send helper shared by the key exchange and the coordinator.

use crate::error::Error;
use crate::message::Message;
use shroud_transport::Channel;
use std::sync::Arc;

/// Sending half of a connection.
#[derive(Clone)]
pub(crate) struct Outbox {
    channel: Arc<dyn Channel>,
}

impl Outbox {
    pub(crate) fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    /// Encode `message` and hand it to the channel.
    pub(crate) async fn send(&self, message: Message) -> Result<(), Error> {
        let kind = message.message_type();
        let frame = message.to_bytes()?;

        tracing::trace!("-> {} ({} bytes)", kind, frame.len());
        self.channel.send(frame).await.map_err(|e| {
            tracing::error!("Failed to send {}: {}", kind, e);
            Error::Channel(e)
        })
    }
}
