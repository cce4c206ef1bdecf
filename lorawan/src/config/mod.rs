//! Device and network configuration
//!
//! This module contains types and functions for configuring LoRaWAN devices
//! and network parameters. It includes:
//! - Device identity (DevEUI, AppEUI, AppKey) and session state
//! - Runtime settings (timing, duty cycle, retries, ADR)

/// Device identity and session state
pub mod device;

/// Runtime settings
pub mod settings;

pub use device::{AESKey, DevAddr, DeviceIdentity, SessionState, EUI64};
pub use settings::{AdrPolicy, DutyCycleTable, RetryPolicy, Settings};
