//! # Transport Module
//!
//! The capabilities the session needs from a BLE stack, independent of
//! platform. `BtleplugTransport` is the production implementation; tests
//! substitute a scripted one.
//!
//! Any operation may fail at any time. Callers treat a failure as "link is
//! suspect" and use `TransportError::is_link_loss` to decide whether the
//! connection should be torn down.

use crate::device_scanner::BluetoothDevice;
use crate::error::TransportError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

/// Non-owning reference to a connected peripheral.
///
/// The transport owns the peripheral itself. Once the link drops the
/// transport forgets the id, and operations on a stale handle fail with
/// `TransportError::NotConnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: String,
    pub name: String,
}

impl From<&BluetoothDevice> for DeviceHandle {
    fn from(device: &BluetoothDevice) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Start scanning and stream devices whose advertised name starts with
    /// `name_prefix`. The stream runs until dropped; pair it with `stop_scan`.
    async fn scan(&self, name_prefix: &str)
        -> Result<BoxStream<'static, BluetoothDevice>, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Connect and discover services. The handle is usable on success.
    async fn connect(&self, device: &BluetoothDevice) -> Result<DeviceHandle, TransportError>;

    /// Write with response.
    async fn write(&self, handle: &DeviceHandle, bytes: &[u8]) -> Result<(), TransportError>;

    /// Notification frames until unsubscribed or disconnected.
    async fn subscribe(&self, handle: &DeviceHandle)
        -> Result<BoxStream<'static, Vec<u8>>, TransportError>;

    /// Resolves once when this connection drops.
    async fn on_disconnect(&self, handle: &DeviceHandle)
        -> Result<BoxFuture<'static, ()>, TransportError>;

    /// Idempotent.
    async fn disconnect(&self, handle: &DeviceHandle) -> Result<(), TransportError>;
}
