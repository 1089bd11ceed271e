use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    adapter::RadioAdapter,
    error::{ErgError, Result},
    protocol::ControlCommand,
    types::{DeviceRole, DiscoveredPeripheral, Selector},
    FTMS_CONTROL_POINT_UUID, FTMS_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID,
    HEART_RATE_SERVICE_UUID, INDOOR_BIKE_DATA_UUID, MACHINE_STATUS_UUID,
};

/// The bound control device and its channel handles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundDevice {
    /// Peripheral identifier
    pub id: String,
    /// Label at bind time
    pub label: String,
    /// Command channel (control point)
    pub command: Uuid,
    /// Data channel (indoor bike data)
    pub data: Uuid,
    /// Optional status channel (machine status)
    pub status: Option<Uuid>,
    /// Control has been acquired
    pub controlling: bool,
}

/// The bound heart rate broadcaster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundHeartRateDevice {
    /// Peripheral identifier
    pub id: String,
    /// Label at bind time
    pub label: String,
    /// Measurement channel
    pub measurement: Uuid,
}

/// Which bound channel a notification arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Control point responses
    Command,
    /// Indoor bike data
    Data,
    /// Machine status events
    Status,
    /// Heart rate measurements
    HeartRate,
}

/// Binding that was torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unbound {
    /// The control device went away
    Control(BoundDevice),
    /// The heart rate device went away
    HeartRate(BoundHeartRateDevice),
}

/// Owns the control and heart rate bindings
#[derive(Debug)]
pub struct ConnectionManager {
    control: Option<BoundDevice>,
    heart_rate: Option<BoundHeartRateDevice>,
    last_label: Option<String>,
    connect_timeout: Duration,
}

impl ConnectionManager {
    /// Create a manager with no bindings
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self {
            control: None,
            heart_rate: None,
            last_label: None,
            connect_timeout,
        }
    }

    /// Bound control device
    #[must_use]
    pub const fn control(&self) -> Option<&BoundDevice> {
        self.control.as_ref()
    }

    /// Bound heart rate device
    #[must_use]
    pub const fn heart_rate(&self) -> Option<&BoundHeartRateDevice> {
        self.heart_rate.as_ref()
    }

    /// Label of the bound, or most recently bound, control device
    #[must_use]
    pub fn last_label(&self) -> Option<&str> {
        self.last_label.as_deref()
    }

    /// Label of the binding for `role`
    #[must_use]
    pub fn bound_label(&self, role: DeviceRole) -> Option<&str> {
        match role {
            DeviceRole::Control => self.control.as_ref().map(|d| d.label.as_str()),
            DeviceRole::HeartRate => self.heart_rate.as_ref().map(|d| d.label.as_str()),
        }
    }

    /// Whether the binding for `role` satisfies `selector`
    #[must_use]
    pub fn bound_matches(&self, role: DeviceRole, selector: &Selector) -> bool {
        let bound = match role {
            DeviceRole::Control => self.control.as_ref().map(|d| (&d.id, &d.label)),
            DeviceRole::HeartRate => self.heart_rate.as_ref().map(|d| (&d.id, &d.label)),
        };
        bound.is_some_and(|(id, label)| match selector {
            Selector::Id(wanted) => id == wanted,
            Selector::Name(filter) => label.to_lowercase().contains(&filter.to_lowercase()),
            Selector::Any => true,
        })
    }

    /// Whether either slot holds `peripheral`
    #[must_use]
    pub fn is_bound(&self, peripheral: &str) -> bool {
        self.control.as_ref().is_some_and(|d| d.id == peripheral)
            || self.heart_rate.as_ref().is_some_and(|d| d.id == peripheral)
    }

    /// Connect, discover and subscribe to a fitness machine, then request control
    ///
    /// Connect and discovery run under `timeout`, or the default connect
    /// timeout when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::Timeout`] if connect and discovery exceed the connect
    /// timeout, [`ErgError::ProtocolMismatch`] if the command or data channel is
    /// missing, or the adapter error of a failed subscribe or write.
    pub async fn bind_control_device<A: RadioAdapter + ?Sized>(
        &mut self,
        adapter: &A,
        peripheral: &DiscoveredPeripheral,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let id = peripheral.id.as_str();
        let label = peripheral.label().to_string();
        info!("Binding control device: {label}");

        let characteristics = self.link(adapter, id, FTMS_SERVICE_UUID, timeout).await?;

        let command = characteristics.contains(&FTMS_CONTROL_POINT_UUID);
        let data = characteristics.contains(&INDOOR_BIKE_DATA_UUID);
        let status = characteristics
            .contains(&MACHINE_STATUS_UUID)
            .then_some(MACHINE_STATUS_UUID);
        if !command || !data {
            self.release(adapter, id).await;
            let missing = if command { "indoor bike data" } else { "control point" };
            return Err(ErgError::ProtocolMismatch(format!(
                "{label} has no {missing} channel"
            )));
        }

        let mut channels = vec![FTMS_CONTROL_POINT_UUID, INDOOR_BIKE_DATA_UUID];
        channels.extend(status);
        for channel in channels {
            if let Err(e) = adapter.subscribe(id, channel).await {
                self.release(adapter, id).await;
                return Err(e);
            }
        }

        let request = ControlCommand::request_control().to_bytes();
        if let Err(e) = adapter.write(id, FTMS_CONTROL_POINT_UUID, &request).await {
            self.release(adapter, id).await;
            return Err(e);
        }

        self.control = Some(BoundDevice {
            id: id.to_string(),
            label: label.clone(),
            command: FTMS_CONTROL_POINT_UUID,
            data: INDOOR_BIKE_DATA_UUID,
            status,
            controlling: true,
        });
        self.last_label = Some(label.clone());

        info!("Control acquired on {label}");
        Ok(label)
    }

    /// Connect, discover and subscribe to a heart rate broadcaster
    ///
    /// `timeout` bounds connect and discovery as in
    /// [`ConnectionManager::bind_control_device`].
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::Timeout`] if connect and discovery exceed the connect
    /// timeout, [`ErgError::ProtocolMismatch`] if the measurement channel is
    /// missing, or the adapter error of a failed subscribe.
    pub async fn bind_heart_rate_device<A: RadioAdapter + ?Sized>(
        &mut self,
        adapter: &A,
        peripheral: &DiscoveredPeripheral,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let id = peripheral.id.as_str();
        let label = peripheral.label().to_string();
        info!("Binding heart rate device: {label}");

        let characteristics = self
            .link(adapter, id, HEART_RATE_SERVICE_UUID, timeout)
            .await?;
        if !characteristics.contains(&HEART_RATE_MEASUREMENT_UUID) {
            self.release(adapter, id).await;
            return Err(ErgError::ProtocolMismatch(format!(
                "{label} has no heart rate measurement channel"
            )));
        }

        if let Err(e) = adapter.subscribe(id, HEART_RATE_MEASUREMENT_UUID).await {
            self.release(adapter, id).await;
            return Err(e);
        }

        self.heart_rate = Some(BoundHeartRateDevice {
            id: id.to_string(),
            label: label.clone(),
            measurement: HEART_RATE_MEASUREMENT_UUID,
        });

        info!("Heart rate device bound: {label}");
        Ok(label)
    }

    /// Connect and discover `service` under the connect timeout
    async fn link<A: RadioAdapter + ?Sized>(
        &self,
        adapter: &A,
        id: &str,
        service: Uuid,
        limit: Option<Duration>,
    ) -> Result<Vec<Uuid>> {
        let limit = limit.unwrap_or(self.connect_timeout);
        let attempt = async {
            adapter.connect(id).await?;
            adapter.discover(id, service).await
        };

        match timeout(limit, attempt).await {
            Ok(Ok(characteristics)) => Ok(characteristics),
            Ok(Err(e)) => {
                self.release(adapter, id).await;
                Err(e)
            }
            Err(_) => {
                self.release(adapter, id).await;
                Err(ErgError::Timeout {
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Drop the radio link unless the other role still uses it
    async fn release<A: RadioAdapter + ?Sized>(&self, adapter: &A, id: &str) {
        if self.is_bound(id) {
            debug!("Keeping link to {id}, still bound in the other role");
        } else {
            drop_link(adapter, id).await;
        }
    }

    /// Write a command to the bound control device
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::NotReady`] with no bound device, or the adapter
    /// error of a failed write.
    pub async fn send<A: RadioAdapter + ?Sized>(
        &self,
        adapter: &A,
        command: &ControlCommand,
    ) -> Result<()> {
        let device = self
            .control
            .as_ref()
            .ok_or_else(|| ErgError::not_ready("no control device bound"))?;
        let bytes = command.to_bytes();
        debug!("Sending {} to {}: {:02X?}", command.opcode, device.label, &bytes[..]);
        adapter.write(&device.id, device.command, &bytes).await
    }

    /// Re-issue request-control when it has lapsed
    ///
    /// # Errors
    ///
    /// Returns [`ErgError::NotReady`] with no bound device, or the adapter
    /// error of a failed write.
    pub async fn ensure_control<A: RadioAdapter + ?Sized>(&mut self, adapter: &A) -> Result<()> {
        let controlling = self
            .control
            .as_ref()
            .ok_or_else(|| ErgError::not_ready("no control device bound"))?
            .controlling;
        if controlling {
            return Ok(());
        }

        info!("Re-requesting control");
        self.send(adapter, &ControlCommand::request_control()).await?;
        self.set_controlling(true);
        Ok(())
    }

    /// Write a command, logging instead of failing
    pub async fn send_best_effort<A: RadioAdapter + ?Sized>(
        &self,
        adapter: &A,
        command: &ControlCommand,
    ) {
        if let Err(e) = self.send(adapter, command).await {
            warn!("Ignoring failed {} during teardown: {e}", command.opcode);
        }
    }

    /// Update the control flag of the bound device
    pub fn set_controlling(&mut self, controlling: bool) {
        if let Some(device) = self.control.as_mut() {
            device.controlling = controlling;
        }
    }

    /// Identify the bound channel a notification belongs to
    #[must_use]
    pub fn route(&self, peripheral: &str, characteristic: Uuid) -> Option<Channel> {
        if let Some(device) = self.control.as_ref().filter(|d| d.id == peripheral) {
            if characteristic == device.data {
                return Some(Channel::Data);
            }
            if characteristic == device.command {
                return Some(Channel::Command);
            }
            if Some(characteristic) == device.status {
                return Some(Channel::Status);
            }
        }
        self.heart_rate
            .as_ref()
            .filter(|d| d.id == peripheral && d.measurement == characteristic)
            .map(|_| Channel::HeartRate)
    }

    /// Tear down every binding of a peripheral whose link dropped
    ///
    /// Returns an empty list when `peripheral` is not bound.
    pub fn on_disconnected(&mut self, peripheral: &str) -> Vec<Unbound> {
        let mut unbound = Vec::new();
        if self.control.as_ref().is_some_and(|d| d.id == peripheral) {
            unbound.extend(self.control.take().map(Unbound::Control));
        }
        if self.heart_rate.as_ref().is_some_and(|d| d.id == peripheral) {
            unbound.extend(self.heart_rate.take().map(Unbound::HeartRate));
        }
        unbound
    }

    /// Voluntarily drop the binding for `role`
    ///
    /// The radio link stays up while the other role is bound to the same
    /// peripheral.
    pub async fn unbind<A: RadioAdapter + ?Sized>(
        &mut self,
        adapter: &A,
        role: DeviceRole,
    ) -> Option<Unbound> {
        let unbound = match role {
            DeviceRole::Control => self.control.take().map(Unbound::Control),
            DeviceRole::HeartRate => self.heart_rate.take().map(Unbound::HeartRate),
        };
        if let Some(unbound) = &unbound {
            let id = match unbound {
                Unbound::Control(device) => &device.id,
                Unbound::HeartRate(device) => &device.id,
            };
            self.release(adapter, id).await;
        }
        unbound
    }
}

/// Best-effort radio disconnect
async fn drop_link<A: RadioAdapter + ?Sized>(adapter: &A, id: &str) {
    if let Err(e) = adapter.disconnect(id).await {
        debug!("Ignoring disconnect failure for {id}: {e}");
    }
}
