//! # btleplug Transport
//!
//! `Transport` implementation over the platform BLE stack via btleplug.
//!
//! One instance owns the BLE manager and the first adapter. Peripherals seen
//! during the current scan are remembered by id so `connect` can find them
//! again; the cache is emptied when a new scan starts and once a connect
//! claims an entry. Connected peripherals and their resolved characteristics
//! live in a separate map that is emptied on disconnect.

use crate::config::GattIds;
use crate::device_scanner::{discovered_devices, BluetoothDevice};
use crate::error::TransportError;
use crate::transport::{DeviceHandle, Transport};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Peripherals seen by the scan in progress, keyed by device id
struct DiscoveryCache<P> {
    entries: HashMap<String, P>,
}

impl<P> DiscoveryCache<P> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn remember(&mut self, id: String, peripheral: P) {
        self.entries.insert(id, peripheral);
    }

    /// Take `id` out and forget everything else seen alongside it.
    fn claim(&mut self, id: &str) -> Option<P> {
        let peripheral = self.entries.remove(id);
        self.entries.clear();
        peripheral
    }

    fn forget_all(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct Link {
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_char: Characteristic,
}

pub struct BtleplugTransport {
    // Dropping the manager tears down the platform session
    _manager: Manager,
    adapter: Adapter,
    gatt: GattIds,
    discovered: Arc<Mutex<DiscoveryCache<Peripheral>>>,
    links: Mutex<HashMap<String, Arc<Link>>>,
}

impl BtleplugTransport {
    pub async fn new(gatt: GattIds) -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::ManagerInit(e.to_string()))?;

        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        match adapter.adapter_info().await {
            Ok(info) => log::info!("Using Bluetooth adapter: {}", info),
            Err(e) => log::debug!("Could not read adapter info: {}", e),
        }

        Ok(Self {
            _manager: manager,
            adapter,
            gatt,
            discovered: Arc::new(Mutex::new(DiscoveryCache::new())),
            links: Mutex::new(HashMap::new()),
        })
    }

    fn link(&self, handle: &DeviceHandle) -> Result<Arc<Link>, TransportError> {
        self.links
            .lock()
            .map_err(|_| TransportError::Ble("link table poisoned".to_string()))?
            .get(&handle.id)
            .cloned()
            .ok_or(TransportError::NotConnected)
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        uuid: uuid::Uuid,
    ) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::MissingCharacteristic(uuid))
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn scan(
        &self,
        name_prefix: &str,
    ) -> Result<BoxStream<'static, BluetoothDevice>, TransportError> {
        if let Ok(mut known) = self.discovered.lock() {
            if !known.entries.is_empty() {
                log::debug!("Forgetting {} peripheral(s) from the last scan", known.len());
            }
            known.forget_all();
        }

        let devices = discovered_devices(&self.adapter, name_prefix).await?;
        let discovered = Arc::clone(&self.discovered);

        Ok(devices
            .map(move |(device, peripheral)| {
                if let Ok(mut known) = discovered.lock() {
                    known.remember(device.id.clone(), peripheral);
                }
                device
            })
            .boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, device: &BluetoothDevice) -> Result<DeviceHandle, TransportError> {
        let peripheral = self
            .discovered
            .lock()
            .map_err(|_| TransportError::Ble("discovery table poisoned".to_string()))?
            .claim(&device.id)
            .ok_or(TransportError::DeviceNotFound)?;

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;

        if !peripheral.services().iter().any(|s| s.uuid == self.gatt.service) {
            log::warn!("{} does not list service {}", device.name, self.gatt.service);
        }
        let write_char = Self::find_characteristic(&peripheral, self.gatt.write)?;
        let notify_char = Self::find_characteristic(&peripheral, self.gatt.notify)?;

        let handle = DeviceHandle::from(device);
        self.links
            .lock()
            .map_err(|_| TransportError::Ble("link table poisoned".to_string()))?
            .insert(
                handle.id.clone(),
                Arc::new(Link {
                    peripheral,
                    write_char,
                    notify_char,
                }),
            );

        log::info!("Connected to {} ({})", handle.name, handle.id);
        Ok(handle)
    }

    async fn write(&self, handle: &DeviceHandle, bytes: &[u8]) -> Result<(), TransportError> {
        let link = self.link(handle)?;
        link.peripheral
            .write(&link.write_char, bytes, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        handle: &DeviceHandle,
    ) -> Result<BoxStream<'static, Vec<u8>>, TransportError> {
        let link = self.link(handle)?;
        link.peripheral.subscribe(&link.notify_char).await?;

        let notify_uuid = link.notify_char.uuid;
        let stream = link.peripheral.notifications().await?;
        Ok(stream
            .filter_map(move |n| async move { (n.uuid == notify_uuid).then_some(n.value) })
            .boxed())
    }

    async fn on_disconnect(
        &self,
        handle: &DeviceHandle,
    ) -> Result<BoxFuture<'static, ()>, TransportError> {
        let link = self.link(handle)?;
        let peripheral_id = link.peripheral.id();
        let mut events = self.adapter.events().await?;

        Ok(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        return;
                    }
                }
            }
            // Event stream ended: the adapter is gone, so is the link
        }
        .boxed())
    }

    async fn disconnect(&self, handle: &DeviceHandle) -> Result<(), TransportError> {
        let link = self
            .links
            .lock()
            .map_err(|_| TransportError::Ble("link table poisoned".to_string()))?
            .remove(&handle.id);

        if let Some(link) = link {
            if link.peripheral.is_connected().await.unwrap_or(false) {
                link.peripheral.disconnect().await?;
            }
            log::info!("Disconnected from {}", handle.name);
        }
        Ok(())
    }
}
