//! Per-window RF settings snapshot
//!
//! Written by the transmission scheduler as it moves through the TX, RX1 and
//! RX2 windows; read from any thread through the device facade.

use super::traits::ModulationParams;

/// Phase of the uplink/downlink cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowId {
    /// Outside any RX/TX window
    #[default]
    Idle,
    /// Transmitting (up to RX1)
    Tx,
    /// Receive window 1 (up to RX2)
    Rx1,
    /// Receive window 2
    Rx2,
}

/// Spreading factor as reported to applications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpreadingFactor {
    /// Unused / undefined
    #[default]
    None,
    /// Frequency shift keying
    Fsk,
    /// SF7
    SF7,
    /// SF8
    SF8,
    /// SF9
    SF9,
    /// SF10
    SF10,
    /// SF11
    SF11,
    /// SF12
    SF12,
}

impl SpreadingFactor {
    /// Map a numeric LoRa spreading factor; 0 denotes FSK
    pub fn from_sf(sf: u8) -> Self {
        match sf {
            0 => SpreadingFactor::Fsk,
            7 => SpreadingFactor::SF7,
            8 => SpreadingFactor::SF8,
            9 => SpreadingFactor::SF9,
            10 => SpreadingFactor::SF10,
            11 => SpreadingFactor::SF11,
            12 => SpreadingFactor::SF12,
            _ => SpreadingFactor::None,
        }
    }
}

/// Bandwidth as reported to applications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bandwidth {
    /// Unused / undefined
    #[default]
    None,
    /// 125 kHz
    BW125,
    /// 250 kHz
    BW250,
    /// 500 kHz
    BW500,
}

impl Bandwidth {
    /// Map a bandwidth in Hz
    pub fn from_hz(hz: u32) -> Self {
        match hz {
            125_000 => Bandwidth::BW125,
            250_000 => Bandwidth::BW250,
            500_000 => Bandwidth::BW500,
            _ => Bandwidth::None,
        }
    }
}

/// RF settings used in one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RFSettings {
    /// Spreading factor
    pub spreading_factor: SpreadingFactor,
    /// Bandwidth
    pub bandwidth: Bandwidth,
    /// Frequency in Hz
    pub frequency: u32,
    /// Transmit power in dBm (TX window only)
    pub tx_power_dbm: Option<i8>,
}

impl RFSettings {
    /// Snapshot radio parameters
    pub fn new(modulation: &ModulationParams, frequency: u32, tx_power_dbm: Option<i8>) -> Self {
        Self {
            spreading_factor: SpreadingFactor::from_sf(modulation.spreading_factor),
            bandwidth: Bandwidth::from_hz(modulation.bandwidth),
            frequency,
            tx_power_dbm,
        }
    }
}

/// Current window plus the last settings used in each window
#[derive(Debug, Clone, Default)]
pub struct RadioSettingsTable {
    window: WindowId,
    tx: RFSettings,
    rx1: RFSettings,
    rx2: RFSettings,
    rssi: i16,
    snr: i8,
}

impl RadioSettingsTable {
    /// Empty table: idle, nothing transmitted yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Current window
    pub fn window(&self) -> WindowId {
        self.window
    }

    /// Enter `window` using `settings`
    pub fn enter(&mut self, window: WindowId, settings: RFSettings) {
        match window {
            WindowId::Idle => {}
            WindowId::Tx => self.tx = settings,
            WindowId::Rx1 => self.rx1 = settings,
            WindowId::Rx2 => self.rx2 = settings,
        }
        self.window = window;
    }

    /// Leave any window
    pub fn idle(&mut self) {
        self.window = WindowId::Idle;
    }

    /// Settings of `window`; the idle window has none
    pub fn settings(&self, window: WindowId) -> RFSettings {
        match window {
            WindowId::Idle => RFSettings::default(),
            WindowId::Tx => self.tx,
            WindowId::Rx1 => self.rx1,
            WindowId::Rx2 => self.rx2,
        }
    }

    /// Remember the signal quality of a received message
    pub fn record_reception(&mut self, rssi: i16, snr: i8) {
        self.rssi = rssi;
        self.snr = snr;
    }

    /// RSSI of the last received message, in dBm
    pub fn rssi(&self) -> i16 {
        self.rssi
    }

    /// SNR of the last received message, in dB
    pub fn snr(&self) -> i8 {
        self.snr
    }
}
