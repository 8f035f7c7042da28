use async_trait::async_trait;
use bytes::Bytes;
use std::{fmt, sync::Arc};

use crate::error::Result;

/// Callback invoked for every notification received on a subscribed channel
pub type Notifier = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Logical channels of the bed's radio peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Write-only command channel (Nordic UART RX)
    Command,
    /// Notify/read status channel (Nordic UART TX)
    Status,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::Status => write!(f, "status"),
        }
    }
}

/// Capability to open a physical link to the bed
///
/// Implementations own the retry and timeout policy of a single connect
/// attempt; the session only decides *when* to connect.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Connect, trying up to `retries` times before giving up
    ///
    /// # Errors
    ///
    /// Returns a transient error when every attempt failed.
    async fn connect(&self, retries: u32) -> Result<Arc<dyn LinkHandle>>;

    /// Peer address, used for display only
    fn address(&self) -> String;
}

/// An open link to the bed
#[async_trait]
pub trait LinkHandle: Send + Sync {
    /// Start delivering notifications of `channel` to `on_notify`
    ///
    /// # Errors
    ///
    /// Returns an error if the peripheral rejects the subscription.
    async fn subscribe(&self, channel: Channel, on_notify: Notifier) -> Result<()>;

    /// Stop delivering notifications of `channel`
    ///
    /// # Errors
    ///
    /// Returns an error if the peripheral rejects the request.
    async fn unsubscribe(&self, channel: Channel) -> Result<()>;

    /// Write a payload to `channel`
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the link is gone.
    async fn write(&self, channel: Channel, data: &[u8]) -> Result<()>;

    /// Read the current value of `channel`
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the link is gone.
    async fn read(&self, channel: Channel) -> Result<Bytes>;

    /// Close the link
    ///
    /// # Errors
    ///
    /// Returns an error if the peripheral fails to disconnect cleanly.
    async fn disconnect(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::error::ErgoError;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    pub(crate) const MOCK_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    #[derive(Default)]
    struct MockState {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        failures_left: AtomicUsize,
        write_delay: Mutex<Duration>,
        writes: Mutex<Vec<Vec<u8>>>,
        notifier: Mutex<Option<Notifier>>,
    }

    /// In-memory link recording writes and replaying notifications
    #[derive(Clone, Default)]
    pub(crate) struct MockLink {
        state: Arc<MockState>,
    }

    impl MockLink {
        pub(crate) fn failing(failures: usize) -> Self {
            let link = Self::default();
            link.state.failures_left.store(failures, Ordering::SeqCst);
            link
        }

        pub(crate) fn with_write_delay(self, delay: Duration) -> Self {
            *self.state.write_delay.lock().unwrap() = delay;
            self
        }

        pub(crate) fn connects(&self) -> usize {
            self.state.connects.load(Ordering::SeqCst)
        }

        pub(crate) fn disconnects(&self) -> usize {
            self.state.disconnects.load(Ordering::SeqCst)
        }

        pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
            self.state.writes.lock().unwrap().clone()
        }

        pub(crate) fn is_subscribed(&self) -> bool {
            self.state.notifier.lock().unwrap().is_some()
        }

        /// Deliver a notification as the peripheral would
        pub(crate) fn notify(&self, data: &[u8]) {
            let notifier = self.state.notifier.lock().unwrap().clone();
            if let Some(notifier) = notifier {
                notifier(Bytes::copy_from_slice(data));
            }
        }
    }

    #[async_trait]
    impl Link for MockLink {
        async fn connect(&self, _retries: u32) -> Result<Arc<dyn LinkHandle>> {
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            let failed = self
                .state
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(ErgoError::ConnectionFailed("mock refused".to_string()));
            }
            Ok(Arc::new(MockHandle {
                state: self.state.clone(),
            }))
        }

        fn address(&self) -> String {
            MOCK_ADDRESS.to_string()
        }
    }

    struct MockHandle {
        state: Arc<MockState>,
    }

    #[async_trait]
    impl LinkHandle for MockHandle {
        async fn subscribe(&self, _channel: Channel, on_notify: Notifier) -> Result<()> {
            *self.state.notifier.lock().unwrap() = Some(on_notify);
            Ok(())
        }

        async fn unsubscribe(&self, _channel: Channel) -> Result<()> {
            *self.state.notifier.lock().unwrap() = None;
            Ok(())
        }

        async fn write(&self, _channel: Channel, data: &[u8]) -> Result<()> {
            let delay = *self.state.write_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.state.writes.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn read(&self, _channel: Channel) -> Result<Bytes> {
            Ok(Bytes::new())
        }

        async fn disconnect(&self) -> Result<()> {
            self.state.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Poll `condition` on virtual time until it holds
    pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }
}
