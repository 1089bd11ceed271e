use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Instant, SystemTime},
};
use uuid::Uuid;

/// Classification of a discovered peripheral by advertised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Exposes the fitness machine control service
    ControlDevice,
    /// Broadcasts heart rate measurements
    HeartRate,
    /// Anything else
    Unknown,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlDevice => write!(f, "control-device"),
            Self::HeartRate => write!(f, "heart-rate"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Which binding slot an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceRole {
    /// The controllable trainer
    Control,
    /// The heart rate broadcaster
    HeartRate,
}

impl DeviceRole {
    /// Classification a peripheral must carry to satisfy this role
    #[must_use]
    pub const fn class(self) -> DeviceClass {
        match self {
            Self::Control => DeviceClass::ControlDevice,
            Self::HeartRate => DeviceClass::HeartRate,
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::HeartRate => write!(f, "heart-rate"),
        }
    }
}

/// How `connect` picks a peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Exact peripheral identifier
    Id(String),
    /// Case-insensitive substring of the advertised name
    Name(String),
    /// First peripheral whose classification fits the requested role
    Any,
}

impl Selector {
    /// Check whether a peripheral satisfies this selector for `role`
    ///
    /// Identifier selectors match regardless of classification; name and
    /// wildcard selectors also require the classification of `role`.
    #[must_use]
    pub fn matches(&self, peripheral: &DiscoveredPeripheral, role: DeviceRole) -> bool {
        match self {
            Self::Id(id) => peripheral.id == *id,
            Self::Name(filter) => {
                peripheral.class == role.class()
                    && peripheral.name.as_deref().is_some_and(|name| {
                        name.to_lowercase().contains(&filter.to_lowercase())
                    })
            }
            Self::Any => peripheral.class == role.class(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id={id}"),
            Self::Name(name) => write!(f, "name~{name}"),
            Self::Any => write!(f, "any"),
        }
    }
}

/// Peripheral seen during a scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredPeripheral {
    /// Identifier, stable for the lifetime of the radio session
    pub id: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
    /// Signal strength
    pub rssi: Option<i16>,
    /// Whether the peripheral accepts connections
    pub connectable: bool,
    /// Classification by advertised service
    pub class: DeviceClass,
    /// Whether the peripheral is currently bound
    pub connected: bool,
    /// Last advertisement time
    #[serde(skip)]
    pub last_seen: Instant,
}

impl DiscoveredPeripheral {
    /// Name shown to users, falling back to the identifier
    #[must_use]
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    /// No session
    #[default]
    Idle,
    /// Trainer is applying load
    Running,
    /// Paused, auto-stop clock frozen
    Paused,
    /// Session finished, a new one may start
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// One decoded telemetry notification
///
/// Only fields present in the notification are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Instantaneous power in watts
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub power_watts: Option<i16>,
    /// Instantaneous cadence in rpm (0.5 rpm resolution)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cadence_rpm: Option<f64>,
    /// Instantaneous speed in km/h (0.01 km/h resolution)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub speed_kph: Option<f64>,
    /// Heart rate in beats per minute
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub heart_rate_bpm: Option<u16>,
    /// Which bound device produced the sample
    pub source: DeviceRole,
    /// Decode time
    pub timestamp: SystemTime,
}

impl TelemetrySample {
    /// Create an empty sample for `source`
    #[must_use]
    pub fn empty(source: DeviceRole) -> Self {
        Self {
            power_watts: None,
            cadence_rpm: None,
            speed_kph: None,
            heart_rate_bpm: None,
            source,
            timestamp: SystemTime::now(),
        }
    }

    /// Whether no field was decoded
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.power_watts.is_none()
            && self.cadence_rpm.is_none()
            && self.speed_kph.is_none()
            && self.heart_rate_bpm.is_none()
    }
}

/// Connection and session status snapshot
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// A control device is bound
    pub connected: bool,
    /// Control has been acquired on the bound device
    pub controlling: bool,
    /// Session running
    pub running: bool,
    /// Session paused
    pub paused: bool,
    /// Discovery is active
    pub scanning: bool,
    /// Human-readable message
    pub message: Option<String>,
    /// Bound control device identifier
    pub device_id: Option<String>,
    /// Bound (or last bound) control device label
    pub device_label: Option<String>,
    /// Bound heart rate device identifier
    pub heart_rate_device_id: Option<String>,
    /// Session state
    pub state: SessionState,
    /// Last accepted target power
    pub target_watts: u16,
    /// Remaining auto-stop time in milliseconds
    pub remaining_ms: Option<u64>,
}

/// Events emitted to the collaborator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ErgEvent {
    /// Full sorted device snapshot
    DeviceList(Vec<DiscoveredPeripheral>),
    /// Telemetry from a bound device
    Telemetry(TelemetrySample),
    /// Connection/session status
    Status(StatusUpdate),
    /// Accepted target power after a set or nudge
    TargetWattsChanged(u16),
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Default connect and bounded-scan timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Age after which an unconnected peripheral leaves the device list
    pub staleness_window_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 20_000,
            staleness_window_ms: 15_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peripheral(id: &str, name: Option<&str>, class: DeviceClass) -> DiscoveredPeripheral {
        DiscoveredPeripheral {
            id: id.to_string(),
            name: name.map(str::to_string),
            services: Vec::new(),
            rssi: Some(-60),
            connectable: true,
            class,
            connected: false,
            last_seen: Instant::now(),
        }
    }

    #[test]
    fn test_selector_matching() {
        let kickr = peripheral("AA", Some("KICKR CORE 1234"), DeviceClass::ControlDevice);
        let strap = peripheral("BB", Some("HRM-Pro"), DeviceClass::HeartRate);

        assert!(Selector::Id("AA".to_string()).matches(&kickr, DeviceRole::HeartRate));
        assert!(Selector::Name("kickr".to_string()).matches(&kickr, DeviceRole::Control));
        assert!(!Selector::Name("kickr".to_string()).matches(&kickr, DeviceRole::HeartRate));
        assert!(Selector::Any.matches(&strap, DeviceRole::HeartRate));
        assert!(!Selector::Any.matches(&strap, DeviceRole::Control));
    }

    #[test]
    fn test_label_falls_back_to_id() {
        let unnamed = peripheral("CC:DD", None, DeviceClass::Unknown);
        assert_eq!(unnamed.label(), "CC:DD");
    }

    #[test]
    fn test_controller_config_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.connect_timeout_ms, 20_000);
        assert_eq!(config.staleness_window_ms, 15_000);
    }

    #[test]
    fn test_sample_omits_absent_fields() {
        let mut sample = TelemetrySample::empty(DeviceRole::Control);
        assert!(sample.is_empty());
        sample.power_watts = Some(232);

        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["power_watts"], 232);
        assert!(json.get("speed_kph").is_none());
        assert!(json.get("cadence_rpm").is_none());
        assert!(json.get("heart_rate_bpm").is_none());
    }

    #[test]
    fn test_device_list_serializes_services() {
        let mut kickr = peripheral("AA", Some("KICKR"), DeviceClass::ControlDevice);
        kickr.services = vec![crate::FTMS_SERVICE_UUID];

        let json = serde_json::to_value(ErgEvent::DeviceList(vec![kickr])).unwrap();
        let device = &json["DeviceList"][0];
        assert_eq!(device["services"][0], "00001826-0000-1000-8000-00805f9b34fb");
        assert_eq!(device["class"], "ControlDevice");
        assert!(device.get("last_seen").is_none());
    }
}
