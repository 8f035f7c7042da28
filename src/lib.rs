#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Ergobed
//!
//! A Rust library for controlling Ergomotion adjustable beds via Bluetooth
//! Low Energy.
//!
//! The bed's wireless controller exposes a Nordic UART Service. Commands are
//! six-byte button presses written to the RX characteristic; the controller
//! answers with status frames on the TX characteristic carrying section
//! positions, motion flags, massage levels, the massage timer and the LED
//! state.
//!
//! The library is built in layers:
//!
//! - [`protocol`]: pure frame decoder and command table
//! - [`engine`]: target/actual reconciliation, one command per cycle
//! - [`session`]: keepalive-driven link lifecycle with single-flight sends
//! - [`device`]: the [`BedDevice`] facade exposing named attributes
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: This library moves physical furniture. Continuous
//! movements are driven by repeated button presses and only stop once the bed
//! reports a position close enough to the target, so keep an eye on the bed
//! and use the `stop` attribute when in doubt.
//!
//! ## Quick Start
//!
//! ```no_run
//! use ergobed::{BedDevice, ScenePreset, TargetValue};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bed = BedDevice::connect("AA:BB:CC:DD:EE:FF").await?;
//!
//!     // Raise the head section
//!     bed.write_attribute("head_position", TargetValue::Position(400))?;
//!
//!     // Or jump to a preset
//!     bed.write_attribute("scene", TargetValue::Scene(ScenePreset::ZeroG))?;
//!
//!     let head = bed.read_attribute("head_position")?;
//!     println!("Head at {:?}", head.position);
//!
//!     bed.write_attribute("stop", TargetValue::Stop)?;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy link over btleplug
pub mod ble;
/// Attribute-level facade for a single bed
pub mod device;
/// Target/actual reconciliation
pub mod engine;
/// Error types and handling
pub mod error;
/// Transport abstraction used by the session
pub mod link;
/// Status frame decoding and the command table
pub mod protocol;
/// Connection lifecycle management
pub mod session;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use device::BedDevice;
pub use error::{ErgoError, Result};
pub use protocol::{decode_frame, encode, Command};
pub use session::{ConnectionSession, SessionEvent};
pub use types::{
    Attribute, AttributeExtra, AttributeView, BedView, ConnectionState, EngineConfig,
    ObserverKind, ScenePreset, SessionConfig, StatusSnapshot, TargetValue, TimerOption,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Nordic UART Service UUID advertised by the bed controller
///
/// All commands and status updates travel through the two characteristics of
/// this service.
pub const ERGO_SERVICE_UUID: &str = "6E400001-B5A3-F393-E0A9-E50E24DCCA9E";

/// RX characteristic UUID for app-to-bed commands
///
/// Button presses are written here as six-byte payloads without response.
pub const ERGO_RX_CHAR_UUID: &str = "6E400002-B5A3-F393-E0A9-E50E24DCCA9E";

/// TX characteristic UUID for bed-to-app status notifications
///
/// The controller notifies 16 to 20 byte status frames on this
/// characteristic, both unsolicited while moving and in answer to a status
/// request.
pub const ERGO_TX_CHAR_UUID: &str = "6E400003-B5A3-F393-E0A9-E50E24DCCA9E";
