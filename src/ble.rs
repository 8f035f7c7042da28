use async_trait::async_trait;
use btleplug::{
    api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{ErgoError, Result},
    link::{Channel, Link, LinkHandle, Notifier},
    session::AbortOnDrop,
    types::SessionConfig,
    ERGO_RX_CHAR_UUID, ERGO_SERVICE_UUID, ERGO_TX_CHAR_UUID,
};

/// Delay between two connect attempts of the same `connect` call
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// [`Link`] over a btleplug peripheral speaking Nordic UART
pub struct BleLink {
    peripheral: Peripheral,
    connect_timeout_ms: u64,
}

impl BleLink {
    /// Wrap an already discovered peripheral
    #[must_use]
    pub fn from_peripheral(peripheral: Peripheral, config: &SessionConfig) -> Self {
        Self {
            peripheral,
            connect_timeout_ms: config.connect_timeout_ms,
        }
    }

    /// Scan for the bed with the given Bluetooth address
    ///
    /// # Errors
    ///
    /// Returns [`ErgoError::DeviceNotFound`] if no adapter is available or the
    /// address was not seen during the scan, or [`ErgoError::Ble`] for other
    /// Bluetooth-related errors.
    pub async fn find(address: &str, config: &SessionConfig) -> Result<Self> {
        info!("Scanning for bed {}", address);

        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let central = adapters.first().ok_or(ErgoError::DeviceNotFound)?;

        central.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_millis(config.scan_timeout_ms)).await;
        central.stop_scan().await?;

        let peripheral = central
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
            .ok_or(ErgoError::DeviceNotFound)?;

        info!("Found bed {}", address);
        Ok(Self::from_peripheral(peripheral, config))
    }

    async fn try_connect(&self) -> Result<Arc<dyn LinkHandle>> {
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            timeout(
                Duration::from_millis(self.connect_timeout_ms),
                self.peripheral.connect(),
            )
            .await
            .map_err(|_| ErgoError::Timeout {
                timeout_ms: self.connect_timeout_ms,
            })?
            .map_err(|e| ErgoError::ConnectionFailed(e.to_string()))?;
        }

        release_on_error(self.open_uart().await, self.peripheral.disconnect()).await
    }

    async fn open_uart(&self) -> Result<Arc<dyn LinkHandle>> {
        self.peripheral.discover_services().await?;

        let service_uuid = parse_uuid(ERGO_SERVICE_UUID, "service")?;
        let rx_char_uuid = parse_uuid(ERGO_RX_CHAR_UUID, "RX characteristic")?;
        let tx_char_uuid = parse_uuid(ERGO_TX_CHAR_UUID, "TX characteristic")?;

        let services = self.peripheral.services();
        let service = services
            .iter()
            .find(|s| s.uuid == service_uuid)
            .ok_or_else(|| ErgoError::Protocol("UART service not found".to_string()))?;

        let find_char = |uuid: Uuid, label: &str| {
            service
                .characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| ErgoError::Protocol(format!("{label} characteristic not found")))
        };

        Ok(Arc::new(BleLinkHandle {
            peripheral: self.peripheral.clone(),
            command_char: find_char(rx_char_uuid, "RX")?,
            status_char: find_char(tx_char_uuid, "TX")?,
            forwarder: Mutex::new(None),
        }))
    }
}

/// Run `release` when a post-connect setup step failed, keeping the setup error
async fn release_on_error<T, F>(result: Result<T>, release: F) -> Result<T>
where
    F: Future<Output = std::result::Result<(), btleplug::Error>>,
{
    if let Err(e) = &result {
        debug!("Setup failed after connect, disconnecting: {}", e);
        if let Err(release_error) = release.await {
            debug!("Disconnect after failed setup failed: {}", release_error);
        }
    }
    result
}

#[async_trait]
impl Link for BleLink {
    async fn connect(&self, retries: u32) -> Result<Arc<dyn LinkHandle>> {
        let attempts = retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            debug!("Connecting to {} (attempt {}/{})", self.address(), attempt, attempts);
            match self.try_connect().await {
                Ok(handle) => {
                    info!("Connected to {}", self.address());
                    return Ok(handle);
                }
                Err(e) => {
                    debug!("Connect attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ErgoError::ConnectionFailed("no connect attempt made".to_string())))
    }

    fn address(&self) -> String {
        self.peripheral.address().to_string()
    }
}

/// Connected btleplug peripheral with resolved UART characteristics
struct BleLinkHandle {
    peripheral: Peripheral,
    command_char: Characteristic,
    status_char: Characteristic,
    forwarder: Mutex<Option<AbortOnDrop>>,
}

impl BleLinkHandle {
    const fn characteristic(&self, channel: Channel) -> &Characteristic {
        match channel {
            Channel::Command => &self.command_char,
            Channel::Status => &self.status_char,
        }
    }

    fn replace_forwarder(&self, task: Option<AbortOnDrop>) {
        *self.forwarder.lock().unwrap_or_else(PoisonError::into_inner) = task;
    }
}

#[async_trait]
impl LinkHandle for BleLinkHandle {
    async fn subscribe(&self, channel: Channel, on_notify: Notifier) -> Result<()> {
        let characteristic = self.characteristic(channel).clone();
        let mut notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&characteristic).await?;

        let task = tokio::spawn(async move {
            while let Some(data) = notifications.next().await {
                if data.uuid == characteristic.uuid {
                    on_notify(Bytes::from(data.value));
                }
            }
            debug!("Notification stream closed");
        });
        self.replace_forwarder(Some(AbortOnDrop::new(task)));

        Ok(())
    }

    async fn unsubscribe(&self, channel: Channel) -> Result<()> {
        self.replace_forwarder(None);
        self.peripheral
            .unsubscribe(self.characteristic(channel))
            .await?;
        Ok(())
    }

    async fn write(&self, channel: Channel, data: &[u8]) -> Result<()> {
        debug!("Writing to {} channel: {:02X?}", channel, data);
        self.peripheral
            .write(self.characteristic(channel), data, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn read(&self, channel: Channel) -> Result<Bytes> {
        let value = self.peripheral.read(self.characteristic(channel)).await?;
        Ok(Bytes::from(value))
    }

    async fn disconnect(&self) -> Result<()> {
        self.replace_forwarder(None);
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

fn parse_uuid(value: &str, label: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| ErgoError::Protocol(format!("Invalid {label} UUID: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_parsing() {
        assert!(parse_uuid(ERGO_SERVICE_UUID, "service").is_ok());
        assert!(parse_uuid(ERGO_RX_CHAR_UUID, "RX").is_ok());
        assert!(parse_uuid(ERGO_TX_CHAR_UUID, "TX").is_ok());
    }

    #[test]
    fn test_invalid_uuid() {
        let err = parse_uuid("not-a-uuid", "service").unwrap_err();
        assert!(format!("{err}").contains("Invalid service UUID"));
    }

    #[tokio::test]
    async fn test_failed_setup_releases_link() {
        let released = std::sync::atomic::AtomicBool::new(false);
        let result: Result<()> = Err(ErgoError::Protocol("UART service not found".to_string()));

        let err = release_on_error(result, async {
            released.store(true, std::sync::atomic::Ordering::SeqCst);
            Err(btleplug::Error::NotConnected)
        })
        .await
        .unwrap_err();

        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
        assert!(matches!(err, ErgoError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_successful_setup_keeps_link() {
        let released = std::sync::atomic::AtomicBool::new(false);

        let value = release_on_error(Ok(7), async {
            released.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert!(!released.load(std::sync::atomic::Ordering::SeqCst));
    }
}
