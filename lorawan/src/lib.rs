//! LoRaWAN end-device session and transmission core
//!
//! This crate implements the part of a LoRaWAN 1.0.x Class A node between
//! the radio driver and the application: over-the-air activation, duty-cycle
//! pacing, the RX1/RX2 receive windows, confirmed-uplink retries and
//! adaptive data rate. The transceiver driver and the non-volatile store
//! are supplied by the caller through the [`Radio`] and [`KeyValueStore`]
//! traits.
//!
//! # Features
//! - OTAA with persisted or in-memory credentials
//! - Per-band duty-cycle enforcement and listen-before-talk
//! - Configurable regions (US915, EU868)
//! - ADR with ADRACKReq backoff and network-driven LinkADRReq
//! - AT-command provisioning over any byte stream
//! - No unsafe code
//!
//! # Example
//! ```no_run
//! use lorawan_node::{Device, Error, MemoryStore, PinConfig, Radio, Response, Settings, US915};
//!
//! fn run<R: Radio>(radio: R) -> Result<(), Error> {
//!     let device = Device::new(radio, US915::new(), MemoryStore::initialized(), Settings::default())?;
//!     device.configure_pins(PinConfig { spi_host: 1, nss: 18, rxtx: 0xFF, rst: 14, dio0: 26, dio1: 33 })?;
//!
//!     if !device.is_provisioned() {
//!         device.try_provision("0011223344556677", "70B3D57ED0000001", "000102030405060708090A0B0C0D0E0F")?;
//!     }
//!     device.on_message(|payload, port| println!("port {port}: {payload:02X?}"));
//!     device.try_join()?;
//!
//!     match device.transmit_message(b"hello", 1, true) {
//!         Response::Success(delivery) => println!("sent in {} attempt(s)", delivery.attempts),
//!         Response::Failure(failure) => println!("no ack after {} attempt(s)", failure.attempts),
//!         Response::Unexpected(error) => return Err(error),
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Device and network configuration
pub mod config;

/// Cryptographic functions
pub mod crypto;

/// High-level device interface
pub mod device;

/// Error taxonomy
pub mod error;

/// LoRaWAN protocol implementation
pub mod lorawan;

/// Radio hardware abstraction layer
pub mod radio;

/// Persistent key/value storage
pub mod storage;

/// Time source
pub mod timer;

pub use config::{AESKey, AdrPolicy, DevAddr, DeviceIdentity, DutyCycleTable, RetryPolicy, Settings, EUI64};
pub use device::{Delivery, Device, DownlinkInfo, Lifecycle, Response, TransmissionFailure};
pub use error::Error;
pub use lorawan::{Region, TimingParams, EU868, US915};
pub use radio::{PinConfig, RFSettings, Radio, RadioError, WindowId};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
pub use timer::{Clock, SystemClock};
