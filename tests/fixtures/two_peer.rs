//! Two connected engines over an in-memory channel.
//!
//! # Example
//!
//! ```no_run
//! use shroud_core::{FilePayload, TransferConfig};
//! use shroud_integration_tests::fixtures::TwoPeerFixture;
//!
//! # async fn example() {
//! let fixture = TwoPeerFixture::new(TransferConfig::default());
//! let payload = FilePayload::new("a.txt", "text/plain", b"hi".to_vec());
//! let id = fixture.sender.transfers().offer(payload).await.unwrap();
//! # }
//! ```

use shroud_core::{Connection, TransferConfig, TransferEvent};
use shroud_transport::MemoryChannel;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long a test waits for an expected event
pub const EVENT_WAIT: Duration = Duration::from_secs(10);

/// Sender and receiver connections wired to each other
pub struct TwoPeerFixture {
    pub sender: Arc<Connection>,
    pub receiver: Arc<Connection>,
    pub sender_events: mpsc::UnboundedReceiver<TransferEvent>,
    pub receiver_events: mpsc::UnboundedReceiver<TransferEvent>,
    readers: Vec<JoinHandle<()>>,
}

impl TwoPeerFixture {
    /// Both sides use `config`.
    pub fn new(config: TransferConfig) -> Self {
        Self::with_configs(config.clone(), config)
    }

    /// Separate configurations per side.
    pub fn with_configs(sender: TransferConfig, receiver: TransferConfig) -> Self {
        let ((a, a_rx), (b, b_rx)) = MemoryChannel::pair(1024);

        let (sender, sender_events) = Connection::new(a, sender).expect("sender config");
        let (receiver, receiver_events) = Connection::new(b, receiver).expect("receiver config");
        let readers = vec![sender.spawn(a_rx), receiver.spawn(b_rx)];

        Self {
            sender,
            receiver,
            sender_events,
            receiver_events,
            readers,
        }
    }

    /// Close the channel and wait for both readers to finish.
    pub async fn shutdown(self) {
        self.sender.close().await;
        for reader in self.readers {
            reader.await.expect("reader task panicked");
        }
    }
}

/// Wait for the first event matching `select`, skipping others.
///
/// Panics if none arrives within [`EVENT_WAIT`].
pub async fn next_event<T>(
    events: &mut mpsc::UnboundedReceiver<TransferEvent>,
    mut select: impl FnMut(TransferEvent) -> Option<T>,
) -> T {
    let wait = async {
        while let Some(event) = events.recv().await {
            if let Some(found) = select(event) {
                return found;
            }
        }
        panic!("event stream ended");
    };

    tokio::time::timeout(EVENT_WAIT, wait)
        .await
        .expect("timed out waiting for event")
}
