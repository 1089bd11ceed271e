#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Ergolink 🚴
//!
//! A Rust library for controlling smart trainers through the Bluetooth Low Energy
//! Fitness Machine Service (FTMS), with optional heart rate straps.
//!
//! The library discovers nearby peripherals, binds to one controllable trainer and
//! one heart rate broadcaster, negotiates control over the FTMS control point,
//! decodes indoor bike data and heart rate measurements, and runs an ERG session
//! (idle → running → paused → stopped) with an optional auto-stop duration.
//!
//! ## Architecture
//!
//! - **Radio adapter**: [`RadioAdapter`] abstracts the host radio;
//!   [`BtleplugAdapter`] is the production implementation
//! - **Controller**: [`ErgController`] is a cloneable handle to a single actor task
//!   that owns all connection and session state
//! - **Events**: the actor publishes [`ErgEvent`]s (device list, telemetry, status,
//!   target changes) on an unbounded channel
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: This library applies resistance on physical exercise equipment.
//! Always make sure the rider can stop pedalling safely, and handle
//! [`ErgEvent::Status`] disconnect messages in your application.
//!
//! ## Quick Start
//!
//! ```no_run
//! use ergolink::{BtleplugAdapter, ControllerConfig, DeviceRole, ErgController, Selector};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = BtleplugAdapter::new().await?;
//!     let (controller, mut events) =
//!         ErgController::spawn(adapter, ControllerConfig::default()).await?;
//!
//!     // Bind the first trainer that shows up
//!     controller.connect(Selector::Any, DeviceRole::Control).await?;
//!
//!     // Ride at 180 W for twenty minutes
//!     controller
//!         .start_session(180.0, Some(Duration::from_secs(20 * 60)))
//!         .await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!
//!     controller.shutdown().await;
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Radio capability interface
pub mod adapter;
/// `btleplug` radio implementation
pub mod ble;
/// Control and heart rate device bindings
pub mod connection;
/// Controller actor and command handle
pub mod controller;
/// Error types and handling
pub mod error;
/// Control point opcodes and acknowledgments
pub mod protocol;
/// Discovered peripheral tracking
pub mod registry;
/// Session state machine and auto-stop timer
pub mod session;
pub mod telemetry;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
pub(crate) mod fake;

// Re-export the main types for convenient usage
pub use adapter::{AdapterState, Advertisement, RadioAdapter, RadioEvent};
pub use ble::BtleplugAdapter;
pub use controller::ErgController;
pub use error::{ErgError, Result};
pub use types::{
    ControllerConfig, DeviceClass, DeviceRole, DiscoveredPeripheral, ErgEvent, Selector,
    SessionState, StatusUpdate, TelemetrySample,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Expand a Bluetooth SIG 16-bit identifier onto the base UUID
#[must_use]
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5F9B_34FB)
}

/// Fitness Machine Service
pub const FTMS_SERVICE_UUID: Uuid = sig_uuid(0x1826);

/// Indoor Bike Data characteristic (data channel)
pub const INDOOR_BIKE_DATA_UUID: Uuid = sig_uuid(0x2AD2);

/// Fitness Machine Control Point characteristic (command channel)
///
/// Written with response; acknowledgments arrive on the same characteristic
/// as indications.
pub const FTMS_CONTROL_POINT_UUID: Uuid = sig_uuid(0x2AD9);

/// Fitness Machine Status characteristic (status channel)
pub const MACHINE_STATUS_UUID: Uuid = sig_uuid(0x2ADA);

/// Heart Rate Service
pub const HEART_RATE_SERVICE_UUID: Uuid = sig_uuid(0x180D);

/// Heart Rate Measurement characteristic
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = sig_uuid(0x2A37);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_expansion() {
        assert_eq!(
            FTMS_SERVICE_UUID,
            Uuid::parse_str("00001826-0000-1000-8000-00805F9B34FB").unwrap()
        );
        assert_eq!(
            HEART_RATE_MEASUREMENT_UUID,
            Uuid::parse_str("00002a37-0000-1000-8000-00805f9b34fb").unwrap()
        );
        assert_ne!(FTMS_CONTROL_POINT_UUID, INDOOR_BIKE_DATA_UUID);
    }
}
