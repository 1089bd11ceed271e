//! Scripted in-memory radio for tests.

use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    adapter::{AdapterState, Advertisement, RadioAdapter, RadioEvent},
    error::{ErgError, Result},
    FTMS_CONTROL_POINT_UUID, FTMS_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID,
    HEART_RATE_SERVICE_UUID, INDOOR_BIKE_DATA_UUID, MACHINE_STATUS_UUID,
};

#[derive(Debug, Default)]
struct Inner {
    state: AdapterState,
    services: HashMap<String, HashMap<Uuid, Vec<Uuid>>>,
    connected: HashSet<String>,
    subscriptions: Vec<(String, Uuid)>,
    writes: Vec<(String, Uuid, Vec<u8>)>,
    disconnects: Vec<String>,
    scanning: bool,
    scan_starts: usize,
    fail_writes: bool,
    hang_connect: bool,
    events: Option<mpsc::UnboundedSender<RadioEvent>>,
}

/// Radio whose peripherals, events and failures are scripted by the test
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeAdapter {
    inner: Arc<Mutex<Inner>>,
}

impl FakeAdapter {
    pub(crate) fn powered_on() -> Self {
        let fake = Self::default();
        fake.lock().state = AdapterState::PoweredOn;
        fake
    }

    pub(crate) fn with_state(state: AdapterState) -> Self {
        let fake = Self::default();
        fake.lock().state = state;
        fake
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn emit(&self, event: RadioEvent) {
        if let Some(tx) = &self.lock().events {
            let _ = tx.send(event);
        }
    }

    /// Register a trainer exposing the fitness machine service
    pub(crate) fn add_trainer(&self, id: &str, with_status: bool) {
        let mut characteristics = vec![FTMS_CONTROL_POINT_UUID, INDOOR_BIKE_DATA_UUID];
        if with_status {
            characteristics.push(MACHINE_STATUS_UUID);
        }
        self.add_service(id, FTMS_SERVICE_UUID, characteristics);
    }

    /// Register a heart rate strap
    pub(crate) fn add_heart_rate(&self, id: &str) {
        self.add_service(id, HEART_RATE_SERVICE_UUID, vec![HEART_RATE_MEASUREMENT_UUID]);
    }

    pub(crate) fn add_service(&self, id: &str, service: Uuid, characteristics: Vec<Uuid>) {
        self.lock()
            .services
            .entry(id.to_string())
            .or_default()
            .insert(service, characteristics);
    }

    pub(crate) fn advertise(&self, id: &str, name: &str, services: Vec<Uuid>) {
        self.emit(RadioEvent::Advertisement(Advertisement {
            id: id.to_string(),
            name: Some(name.to_string()),
            services,
            rssi: Some(-60),
            connectable: true,
        }));
    }

    pub(crate) fn notify(&self, id: &str, characteristic: Uuid, value: &[u8]) {
        self.emit(RadioEvent::Notification {
            peripheral: id.to_string(),
            characteristic,
            value: value.to_vec(),
        });
    }

    /// Simulate the peripheral dropping the link
    pub(crate) fn drop_link(&self, id: &str) {
        self.lock().connected.remove(id);
        self.emit(RadioEvent::Disconnected(id.to_string()));
    }

    pub(crate) fn set_state(&self, state: AdapterState) {
        self.lock().state = state;
        self.emit(RadioEvent::StateChanged(state));
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub(crate) fn hang_connect(&self, hang: bool) {
        self.lock().hang_connect = hang;
    }

    /// Bytes written to the control point of `id`
    pub(crate) fn commands(&self, id: &str) -> Vec<Vec<u8>> {
        self.lock()
            .writes
            .iter()
            .filter(|(peripheral, characteristic, _)| {
                peripheral == id && *characteristic == FTMS_CONTROL_POINT_UUID
            })
            .map(|(_, _, value)| value.clone())
            .collect()
    }

    /// First byte of every control point write to `id`
    pub(crate) fn opcodes(&self, id: &str) -> Vec<u8> {
        self.commands(id).iter().filter_map(|c| c.first().copied()).collect()
    }

    pub(crate) fn subscriptions(&self, id: &str) -> Vec<Uuid> {
        self.lock()
            .subscriptions
            .iter()
            .filter(|(peripheral, _)| peripheral == id)
            .map(|(_, characteristic)| *characteristic)
            .collect()
    }

    pub(crate) fn is_connected(&self, id: &str) -> bool {
        self.lock().connected.contains(id)
    }

    pub(crate) fn disconnect_count(&self, id: &str) -> usize {
        self.lock().disconnects.iter().filter(|d| *d == id).count()
    }

    pub(crate) fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    pub(crate) fn scan_starts(&self) -> usize {
        self.lock().scan_starts
    }
}

#[async_trait]
impl RadioAdapter for FakeAdapter {
    async fn state(&self) -> Result<AdapterState> {
        Ok(self.lock().state)
    }

    async fn events(&self) -> Result<mpsc::UnboundedReceiver<RadioEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().events = Some(tx);
        Ok(rx)
    }

    async fn start_scan(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.scanning = true;
        inner.scan_starts += 1;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.lock().scanning = false;
        Ok(())
    }

    async fn connect(&self, peripheral: &str) -> Result<()> {
        let hang = {
            let inner = self.lock();
            if !inner.services.contains_key(peripheral) {
                return Err(ErgError::ConnectionFailed(format!(
                    "unknown peripheral {peripheral}"
                )));
            }
            inner.hang_connect
        };
        if hang {
            std::future::pending::<()>().await;
        }
        self.lock().connected.insert(peripheral.to_string());
        Ok(())
    }

    async fn disconnect(&self, peripheral: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.connected.remove(peripheral);
        inner.disconnects.push(peripheral.to_string());
        Ok(())
    }

    async fn discover(&self, peripheral: &str, service: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .lock()
            .services
            .get(peripheral)
            .and_then(|services| services.get(&service))
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe(&self, peripheral: &str, characteristic: Uuid) -> Result<()> {
        self.lock()
            .subscriptions
            .push((peripheral.to_string(), characteristic));
        Ok(())
    }

    async fn write(&self, peripheral: &str, characteristic: Uuid, value: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(ErgError::ConnectionFailed("write failed".to_string()));
        }
        inner
            .writes
            .push((peripheral.to_string(), characteristic, value.to_vec()));
        Ok(())
    }
}
