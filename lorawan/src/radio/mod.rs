//! Radio hardware abstraction layer
//!
//! The transceiver driver itself lives outside this crate; [`Radio`] is the
//! contract it fulfils. [`settings`] keeps the per-window RF snapshot.

pub mod settings;
/// Driver contract and its configuration types
pub mod traits;

pub use settings::{Bandwidth, RFSettings, RadioSettingsTable, SpreadingFactor, WindowId};
pub use traits::{PinConfig, Radio, RadioError, RxConfig, RxQuality, TxConfig, NOT_CONNECTED};
