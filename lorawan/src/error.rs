//! Crate-level error taxonomy
//!
//! Layer-local errors ([`RadioError`], [`MacError`], [`StorageError`]) fold
//! into [`Error`], which is what the device facade reports.

use crate::lorawan::mac::MacError;
use crate::radio::traits::RadioError;
use crate::storage::StorageError;

/// Errors reported by the device core
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Pins have not been configured yet
    #[error("radio pins not configured")]
    NotConfigured,

    /// DevEUI, AppEUI and AppKey are not all available
    #[error("device not provisioned")]
    NotProvisioned,

    /// The persistent storage subsystem has not been initialized
    #[error("persistent storage unavailable")]
    StorageUnavailable,

    /// No join-accept arrived in either join window
    #[error("join timed out")]
    JoinTimeout,

    /// A join-accept arrived but failed validation
    #[error("join-accept rejected: {0}")]
    JoinRejected(MacError),

    /// A confirmed uplink was never acknowledged
    #[error("transmission failed after {attempts} attempt(s)")]
    TransmissionFailed {
        /// Number of transmissions made
        attempts: u8,
    },

    /// No session is active
    #[error("device has not joined")]
    NotJoined,

    /// Application port outside 1..=223
    #[error("invalid port {0}")]
    InvalidPort(u8),

    /// Payload exceeds the limit of the current data rate
    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Requested payload length
        len: usize,
        /// Maximum for the current data rate
        max: usize,
    },

    /// The device has been shut down
    #[error("device is shut down")]
    ShutDown,

    /// Sub-band outside 0..=8
    #[error("invalid sub-band {0}")]
    InvalidSubBand(u8),

    /// Another handle already owns this radio
    #[error("radio {0:#x} already claimed by another device handle")]
    AlreadyClaimed(u64),

    /// Credential text is malformed
    #[error("invalid {0}")]
    InvalidCredential(&'static str),

    /// The hardware address needed for MAC-derived provisioning is unknown
    #[error("hardware address not configured")]
    NoHardwareAddress,

    /// Radio driver fault
    #[error("radio error: {0}")]
    Radio(#[from] RadioError),

    /// Frame-level fault
    #[error("MAC error: {0}")]
    Mac(#[from] MacError),

    /// Storage fault other than unavailability
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// The background worker is gone
    #[error("background worker unavailable")]
    WorkerUnavailable,
}

impl From<StorageError> for Error {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Unavailable => Error::StorageUnavailable,
            other => Error::Storage(other),
        }
    }
}

/// Crate result alias
pub type Result<T> = core::result::Result<T, Error>;
