//! LoRaWAN protocol implementation
//!
//! This module contains the core LoRaWAN protocol implementation, including:
//! - MAC layer and MAC command handling
//! - Frame codec
//! - Activation, transmission scheduling and adaptive data rate
//! - Duty-cycle accounting
//! - PHY layer operations and regional parameters

/// Adaptive data rate
pub mod adr;

/// MAC command handling
pub mod commands;

/// Duty-cycle accounting
pub mod duty_cycle;

/// Frame encoding and decoding
pub mod frame;

/// Over-the-air activation
pub mod join;

/// MAC layer implementation
pub mod mac;

/// PHY layer operations
pub mod phy;

/// Regional parameters and configurations
pub mod region;

/// Uplink and receive-window scheduling
pub mod scheduler;

pub use adr::{AdrController, Adjustment, Outcome};
pub use duty_cycle::DutyCycleGovernor;
pub use join::{JoinState, JoinStateMachine};
pub use mac::{LinkCheck, MacError, MacLayer, Received, Uplinked};
pub use phy::{PhyLayer, TimingParams};
pub use region::{Region, EU868, US915};
pub use scheduler::{RetrySchedule, TransmissionScheduler};
