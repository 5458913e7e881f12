//! Scripted `Transport` for session tests.
//!
//! Records every write, can fail upcoming connects or writes on demand and
//! lets a test drop the link or push notification frames.

use crate::device_scanner::BluetoothDevice;
use crate::error::TransportError;
use crate::protocol::Command;
use crate::transport::{DeviceHandle, Transport};
use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    writes: Vec<Vec<u8>>,
    write_failures: VecDeque<TransportError>,
    connect_failures: VecDeque<TransportError>,
    subscribe_failures: VecDeque<TransportError>,
    stall_connects: bool,
    hidden: bool,
    connected: HashSet<String>,
    scans: usize,
    connects: usize,
    notify: Option<mpsc::UnboundedSender<Vec<u8>>>,
    disconnect: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
pub struct MockTransport {
    devices: Vec<BluetoothDevice>,
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Nothing ever shows up in a scan
    pub fn empty() -> Self {
        Self::default()
    }

    /// One advertising device; its id equals its name
    pub fn with_device(name: &str) -> Self {
        Self {
            devices: vec![BluetoothDevice::new(name.to_string(), name.to_string())],
            ..Self::default()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    pub fn count(&self, command: Command) -> usize {
        let bytes = command.encode();
        self.state().writes.iter().filter(|w| **w == bytes).count()
    }

    pub fn scan_count(&self) -> usize {
        self.state().scans
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.state().connected.contains(id)
    }

    pub fn fail_next_writes(&self, count: usize, error: TransportError) {
        let mut state = self.state();
        for _ in 0..count {
            state.write_failures.push_back(error.clone());
        }
    }

    pub fn fail_next_connect(&self, error: TransportError) {
        self.state().connect_failures.push_back(error);
    }

    pub fn fail_next_subscribe(&self, error: TransportError) {
        self.state().subscribe_failures.push_back(error);
    }

    /// Connects never complete while set
    pub fn stall_connects(&self, stall: bool) {
        self.state().stall_connects = stall;
    }

    /// Whether scans see the device at all
    pub fn set_advertising(&self, advertising: bool) {
        self.state().hidden = !advertising;
    }

    /// The device goes away: the link is gone and the disconnect event fires.
    pub fn drop_link(&self) {
        let mut state = self.state();
        state.connected.clear();
        state.notify = None;
        if let Some(fire) = state.disconnect.take() {
            let _ = fire.send(());
        }
    }

    pub fn push_notification(&self, frame: &[u8]) {
        if let Some(notify) = &self.state().notify {
            let _ = notify.unbounded_send(frame.to_vec());
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn scan(
        &self,
        _name_prefix: &str,
    ) -> Result<BoxStream<'static, BluetoothDevice>, TransportError> {
        let mut state = self.state();
        state.scans += 1;
        let devices = if state.hidden { Vec::new() } else { self.devices.clone() };
        Ok(stream::iter(devices).chain(stream::pending()).boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn connect(&self, device: &BluetoothDevice) -> Result<DeviceHandle, TransportError> {
        let stalled = {
            let mut state = self.state();
            state.connects += 1;
            if let Some(error) = state.connect_failures.pop_front() {
                return Err(error);
            }
            if !state.stall_connects {
                state.connected.insert(device.id.clone());
            }
            state.stall_connects
        };
        if stalled {
            futures::future::pending::<()>().await;
        }
        Ok(DeviceHandle::from(device))
    }

    async fn write(&self, handle: &DeviceHandle, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.connected.contains(&handle.id) {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = state.write_failures.pop_front() {
            return Err(error);
        }
        state.writes.push(bytes.to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        handle: &DeviceHandle,
    ) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        let mut state = self.state();
        if !state.connected.contains(&handle.id) {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = state.subscribe_failures.pop_front() {
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded();
        state.notify = Some(tx);
        Ok(rx.boxed())
    }

    async fn on_disconnect(
        &self,
        handle: &DeviceHandle,
    ) -> Result<BoxFuture<'static, ()>, TransportError> {
        let mut state = self.state();
        if !state.connected.contains(&handle.id) {
            return Err(TransportError::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        state.disconnect = Some(tx);
        Ok(async move {
            // A dropped sender means the link was released deliberately
            if rx.await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
        .boxed())
    }

    async fn disconnect(&self, handle: &DeviceHandle) -> Result<(), TransportError> {
        let mut state = self.state();
        state.connected.remove(&handle.id);
        state.notify = None;
        state.disconnect = None;
        Ok(())
    }
}
