use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

/// Power state of the host radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterState {
    /// State not reported yet
    #[default]
    Unknown,
    /// Ready to scan and connect
    PoweredOn,
    /// Radio switched off
    PoweredOff,
    /// No usable radio on this host
    Unsupported,
    /// Access to the radio was denied
    Unauthorized,
}

impl AdapterState {
    /// Whether the state will never become ready without user action
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Unsupported | Self::Unauthorized)
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::PoweredOn => write!(f, "powered on"),
            Self::PoweredOff => write!(f, "powered off"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Unauthorized => write!(f, "unauthorized"),
        }
    }
}

/// One advertisement report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Peripheral identifier
    pub id: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
    /// Signal strength
    pub rssi: Option<i16>,
    /// Whether the peripheral accepts connections
    pub connectable: bool,
}

/// Asynchronous events raised by the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// Adapter power state changed
    StateChanged(AdapterState),
    /// Peripheral advertised
    Advertisement(Advertisement),
    /// Characteristic value notification or indication
    Notification {
        /// Peripheral identifier
        peripheral: String,
        /// Characteristic the value arrived on
        characteristic: Uuid,
        /// Raw value
        value: Vec<u8>,
    },
    /// Link to a peripheral dropped
    Disconnected(String),
}

/// Capabilities the controller needs from the host radio
///
/// Peripherals are addressed by the identifier carried in their
/// [`Advertisement`]; characteristics by UUID.
#[async_trait]
pub trait RadioAdapter: Send + Sync + 'static {
    /// Current power state
    async fn state(&self) -> Result<AdapterState>;

    /// Open the inbound event stream
    ///
    /// Each call replaces the previous stream.
    async fn events(&self) -> Result<mpsc::UnboundedReceiver<RadioEvent>>;

    /// Start scanning without a service filter
    async fn start_scan(&self) -> Result<()>;

    /// Stop scanning
    async fn stop_scan(&self) -> Result<()>;

    /// Establish the radio link
    async fn connect(&self, peripheral: &str) -> Result<()>;

    /// Drop the radio link
    async fn disconnect(&self, peripheral: &str) -> Result<()>;

    /// Discover the characteristics of `service`
    ///
    /// Returns an empty list when the peripheral lacks the service.
    async fn discover(&self, peripheral: &str, service: Uuid) -> Result<Vec<Uuid>>;

    /// Enable notifications or indications on a characteristic
    async fn subscribe(&self, peripheral: &str, characteristic: Uuid) -> Result<()>;

    /// Write with response
    async fn write(&self, peripheral: &str, characteristic: Uuid, value: &[u8]) -> Result<()>;
}
