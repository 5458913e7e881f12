use crate::error::TransportError;
use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::{self, BoxStream, StreamExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BluetoothDevice {
    pub id: String,
    pub name: String,
}

impl BluetoothDevice {
    pub fn new(id: String, name: String) -> Self {
        Self { id, name }
    }
}

/// Whether an advertised name belongs to a supported stimulator
pub fn matches_name_prefix(local_name: &str, prefix: &str) -> bool {
    local_name.trim().starts_with(prefix)
}

async fn matching_device(
    peripheral: &Peripheral,
    prefix: &str,
) -> Option<BluetoothDevice> {
    let name = peripheral.properties().await.ok()??.local_name?;
    if !matches_name_prefix(&name, prefix) {
        return None;
    }
    Some(BluetoothDevice::new(peripheral.id().to_string(), name))
}

/// Starts scanning and yields every stimulator the adapter sees.
///
/// Peripherals the adapter already knows about come first, followed by live
/// discovery events. The stream never ends on its own; the caller bounds it
/// with a timeout and calls `stop_scan` on the adapter.
pub async fn discovered_devices(
    adapter: &Adapter,
    name_prefix: &str,
) -> Result<BoxStream<'static, (BluetoothDevice, Peripheral)>, TransportError> {
    let events = adapter.events().await?;
    adapter.start_scan(ScanFilter::default()).await?;

    let mut known = Vec::new();
    for peripheral in adapter.peripherals().await? {
        if let Some(device) = matching_device(&peripheral, name_prefix).await {
            known.push((device, peripheral));
        }
    }
    log::debug!("{} matching peripheral(s) already known to the adapter", known.len());

    let adapter = adapter.clone();
    let prefix = name_prefix.to_string();
    let live = events.filter_map(move |event| {
        let adapter = adapter.clone();
        let prefix = prefix.clone();
        async move {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => return None,
            };
            let peripheral = adapter.peripheral(&id).await.ok()?;
            let device = matching_device(&peripheral, &prefix).await?;
            Some((device, peripheral))
        }
    });

    Ok(stream::iter(known).chain(live).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_prefix_matching() {
        assert!(matches_name_prefix("VNS-0042", "VNS"));
        assert!(matches_name_prefix(" VNS", "VNS"));
        assert!(!matches_name_prefix("Polar H10 1234", "VNS"));
        assert!(!matches_name_prefix("vns-0042", "VNS"));
    }
}
