//! BLE client for driving a LoRaWAN node over its GATT control service.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::timeout;
use uuid::Uuid;

use crate::protocol::{LOG_MESSAGE, STATUS, TX_RESULT};

/// Notifications received per characteristic, oldest first
type NotificationQueues = Arc<Mutex<HashMap<Uuid, VecDeque<Vec<u8>>>>>;

/// BLE client for a LoRaWAN node.
pub struct BleClient {
    peripheral: Peripheral,
    characteristics: Vec<Characteristic>,
    notifications: NotificationQueues,
}

impl BleClient {
    /// Scan for a device by name and connect.
    pub async fn connect_by_name(name: &str, scan_timeout: Duration) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapters found"))?;

        adapter.start_scan(ScanFilter::default()).await?;
        let peripheral = Self::find_device_by_name(&adapter, name, scan_timeout).await?;
        adapter.stop_scan().await?;

        peripheral.connect().await?;
        peripheral.discover_services().await?;
        let characteristics: Vec<Characteristic> = peripheral.characteristics().into_iter().collect();

        let client = Self {
            peripheral,
            characteristics,
            notifications: Arc::new(Mutex::new(HashMap::new())),
        };

        for uuid in [TX_RESULT, STATUS, LOG_MESSAGE] {
            let characteristic = client.characteristic(uuid)?;
            client.peripheral.subscribe(&characteristic).await?;
        }

        // Spawn notification handler
        let queues = client.notifications.clone();
        let peripheral = client.peripheral.clone();
        tokio::spawn(async move {
            let mut stream = match peripheral.notifications().await {
                Ok(s) => s,
                Err(_) => return,
            };

            while let Some(data) = stream.next().await {
                let mut queues = queues.lock().await;
                queues.entry(data.uuid).or_default().push_back(data.value);
            }
        });

        Ok(client)
    }

    /// Find a device by name within the scan timeout.
    async fn find_device_by_name(adapter: &Adapter, name: &str, scan_timeout: Duration) -> Result<Peripheral> {
        let start = std::time::Instant::now();

        while start.elapsed() < scan_timeout {
            for peripheral in adapter.peripherals().await? {
                if let Some(props) = peripheral.properties().await? {
                    if props.local_name.as_deref() == Some(name) {
                        return Ok(peripheral);
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Err(anyhow!("Device '{}' not found within timeout", name))
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or_else(|| anyhow!("Characteristic {} not found", uuid))
    }

    /// Write a value, waiting for the write response.
    pub async fn write(&self, uuid: Uuid, data: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;
        self.peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    pub async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(uuid)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    /// Wait for the next notification on `uuid`.
    pub async fn wait_for_notification(&self, uuid: Uuid, wait: Duration) -> Result<Vec<u8>> {
        let result = timeout(wait, async {
            loop {
                if let Some(value) = self.notifications.lock().await.get_mut(&uuid).and_then(|q| q.pop_front()) {
                    return value;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        result.map_err(|_| anyhow!("Timeout waiting for notification on {}", uuid))
    }

    /// Drain every notification received so far on `uuid`.
    pub async fn take_notifications(&self, uuid: Uuid) -> Vec<Vec<u8>> {
        self.notifications
            .lock()
            .await
            .get_mut(&uuid)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Clear any pending notifications.
    pub async fn clear_notifications(&self) {
        self.notifications.lock().await.clear();
    }

    /// Disconnect from the device.
    pub async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
