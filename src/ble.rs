use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    adapter::{AdapterState, Advertisement, RadioAdapter, RadioEvent},
    error::{ErgError, Result},
};

/// Interval between adapter power state polls
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(500);

type EventSender = Arc<Mutex<Option<mpsc::UnboundedSender<RadioEvent>>>>;

/// [`RadioAdapter`] backed by the host Bluetooth stack through `btleplug`
pub struct BtleplugAdapter {
    _manager: Manager,
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    sender: EventSender,
    event_tasks: Mutex<Vec<JoinHandle<()>>>,
    notification_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BtleplugAdapter {
    /// Open the first Bluetooth adapter of the host
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::AdapterUnavailable`] if the host has no adapter,
    /// or [`ErgError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ErgError::AdapterUnavailable {
                reason: "no Bluetooth adapter found".to_string(),
            })?;

        info!("Using Bluetooth adapter: {}", adapter.adapter_info().await?);

        Ok(Self {
            _manager: manager,
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            sender: Arc::new(Mutex::new(None)),
            event_tasks: Mutex::new(Vec::new()),
            notification_tasks: Mutex::new(HashMap::new()),
        })
    }

    async fn peripheral(&self, id: &str) -> Result<Peripheral> {
        self.peripherals
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ErgError::ConnectionFailed(format!("unknown peripheral {id}")))
    }

    fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| ErgError::ProtocolMismatch(format!("characteristic {uuid} not found")))
    }

    /// Spawn the task forwarding value notifications of `peripheral`
    async fn ensure_notification_task(&self, id: &str, peripheral: &Peripheral) -> Result<()> {
        let mut tasks = self.notification_tasks.lock().await;
        if tasks.get(id).is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        let Some(sender) = self.sender.lock().await.clone() else {
            warn!("Subscribed to {id} before the event stream was opened");
            return Ok(());
        };

        let mut notifications = peripheral.notifications().await?;
        let key = id.to_string();
        let task = tokio::spawn(async move {
            while let Some(data) = notifications.next().await {
                let event = RadioEvent::Notification {
                    peripheral: key.clone(),
                    characteristic: data.uuid,
                    value: data.value,
                };
                if sender.send(event).is_err() {
                    break;
                }
            }
            debug!("Notification stream for {key} ended");
        });
        tasks.insert(id.to_string(), task);

        Ok(())
    }
}

#[async_trait]
impl RadioAdapter for BtleplugAdapter {
    async fn state(&self) -> Result<AdapterState> {
        Ok(map_state(self.adapter.adapter_state().await?))
    }

    async fn events(&self) -> Result<mpsc::UnboundedReceiver<RadioEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().await = Some(tx.clone());

        let mut tasks = self.event_tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }

        let mut central_events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let event_tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                let forwarded = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        advertisement(&adapter, &peripherals, &id).await
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        Some(RadioEvent::Disconnected(id.to_string()))
                    }
                    _ => None,
                };
                if let Some(event) = forwarded {
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
            }
        }));

        // btleplug reports power changes only through polling on some platforms
        let adapter = self.adapter.clone();
        tasks.push(tokio::spawn(async move {
            let mut last = None;
            loop {
                let state = adapter
                    .adapter_state()
                    .await
                    .map_or(AdapterState::Unknown, map_state);
                if last != Some(state) {
                    last = Some(state);
                    if tx.send(RadioEvent::StateChanged(state)).is_err() {
                        break;
                    }
                }
                tokio::time::sleep(STATE_POLL_INTERVAL).await;
            }
        }));

        Ok(rx)
    }

    async fn start_scan(&self) -> Result<()> {
        info!("Starting BLE scan");
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        info!("Stopping BLE scan");
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, peripheral: &str) -> Result<()> {
        let device = self.peripheral(peripheral).await?;
        if device.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        device
            .connect()
            .await
            .map_err(|e| ErgError::ConnectionFailed(e.to_string()))
    }

    async fn disconnect(&self, peripheral: &str) -> Result<()> {
        if let Some(task) = self.notification_tasks.lock().await.remove(peripheral) {
            task.abort();
        }
        let device = self.peripheral(peripheral).await?;
        device.disconnect().await?;
        Ok(())
    }

    async fn discover(&self, peripheral: &str, service: Uuid) -> Result<Vec<Uuid>> {
        let device = self.peripheral(peripheral).await?;
        device.discover_services().await?;

        let characteristics = device
            .services()
            .iter()
            .find(|s| s.uuid == service)
            .map(|s| s.characteristics.iter().map(|c| c.uuid).collect())
            .unwrap_or_default();
        Ok(characteristics)
    }

    async fn subscribe(&self, peripheral: &str, characteristic: Uuid) -> Result<()> {
        let device = self.peripheral(peripheral).await?;
        let target = Self::characteristic(&device, characteristic)?;
        device.subscribe(&target).await?;
        self.ensure_notification_task(peripheral, &device).await
    }

    async fn write(&self, peripheral: &str, characteristic: Uuid, value: &[u8]) -> Result<()> {
        let device = self.peripheral(peripheral).await?;
        let target = Self::characteristic(&device, characteristic)?;
        debug!("Writing to {characteristic}: {:02X?}", value);
        device.write(&target, value, WriteType::WithResponse).await?;
        Ok(())
    }
}

impl Drop for BtleplugAdapter {
    fn drop(&mut self) {
        for task in self.event_tasks.get_mut().drain(..) {
            task.abort();
        }
        for (_, task) in self.notification_tasks.get_mut().drain() {
            task.abort();
        }
    }
}

/// Build an advertisement report from the cached peripheral properties
async fn advertisement(
    adapter: &Adapter,
    peripherals: &Mutex<HashMap<String, Peripheral>>,
    id: &PeripheralId,
) -> Option<RadioEvent> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let key = id.to_string();

    peripherals.lock().await.insert(key.clone(), peripheral);

    Some(RadioEvent::Advertisement(Advertisement {
        id: key,
        name: properties.local_name,
        services: properties.services,
        rssi: properties.rssi,
        // btleplug does not expose the connectable bit
        connectable: true,
    }))
}

const fn map_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        CentralState::Unknown => AdapterState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(map_state(CentralState::PoweredOn), AdapterState::PoweredOn);
        assert_eq!(map_state(CentralState::PoweredOff), AdapterState::PoweredOff);
        assert_eq!(map_state(CentralState::Unknown), AdapterState::Unknown);
        assert!(!map_state(CentralState::PoweredOff).is_fatal());
    }
}
