use heapless::Vec;

use crate::lorawan::phy::TimingParams;

/// Maximum number of duty-cycle bands a region may define
pub const MAX_DUTY_CYCLE_BANDS: usize = 8;

/// Regulatory duty-cycle fraction per band
///
/// Index `i` applies to the band the region reports as `i`. `None` (or a
/// missing entry) means the band is unrestricted.
#[derive(Debug, Clone, PartialEq)]
pub struct DutyCycleTable {
    bands: Vec<Option<f32>, MAX_DUTY_CYCLE_BANDS>,
}

impl DutyCycleTable {
    /// No band is restricted (e.g. US915)
    pub fn unrestricted() -> Self {
        Self { bands: Vec::new() }
    }

    /// ETSI EN 300 220 limits for the EU868 band plan
    pub fn eu868() -> Self {
        Self::from_fractions(&[Some(0.01), Some(0.01), Some(0.001), Some(0.1), Some(0.01)])
    }

    /// Build from explicit fractions; entries beyond capacity are dropped
    pub fn from_fractions(fractions: &[Option<f32>]) -> Self {
        let mut bands = Vec::new();
        for fraction in fractions.iter().take(MAX_DUTY_CYCLE_BANDS) {
            let fraction = fraction.filter(|f| *f > 0.0 && *f < 1.0);
            // Capacity checked by take()
            let _ = bands.push(fraction);
        }
        Self { bands }
    }

    /// Fraction of time band `band` may be occupied, if restricted
    pub fn fraction(&self, band: usize) -> Option<f32> {
        self.bands.get(band).copied().flatten()
    }
}

impl Default for DutyCycleTable {
    fn default() -> Self {
        Self::unrestricted()
    }
}

/// Confirmed-uplink retransmission policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total transmissions of one confirmed frame (at least 1)
    pub max_attempts: u8,
    /// Lower the data rate after every this many unacknowledged attempts (0 = never)
    pub fallback_every: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            fallback_every: 2,
        }
    }
}

/// Adaptive data rate tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdrPolicy {
    /// ADR on at startup
    pub enabled: bool,
    /// Consecutive well-margined successes before raising the data rate
    pub success_run: u8,
    /// Consecutive failures before stepping power or data rate down
    pub failure_run: u8,
    /// Required SNR margin above the demodulation floor, in dB
    pub margin_db: f32,
    /// Uplinks without a downlink before the ADRACKReq bit is set
    pub ack_limit: u16,
    /// Further uplinks between backoff steps once the limit is exceeded
    pub ack_delay: u16,
}

impl Default for AdrPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            success_run: 4,
            failure_run: 2,
            margin_db: 10.0,
            ack_limit: 64,
            ack_delay: 32,
        }
    }
}

/// Device configuration beyond credentials
#[derive(Debug, Clone)]
pub struct Settings {
    /// Uplink sub-band (0 = all, 1..=8); ignored by regions without sub-bands
    pub sub_band: u8,
    /// Protocol timing
    pub timing: TimingParams,
    /// Duty-cycle limits per band; the region's regulatory table when `None`
    pub duty_cycle: Option<DutyCycleTable>,
    /// Confirmed-uplink retries
    pub retry: RetryPolicy,
    /// ADR behaviour
    pub adr: AdrPolicy,
    /// Initial data-rate index; region default when `None`
    pub data_rate: Option<u8>,
    /// Initial transmit-power index (0 = maximum)
    pub tx_power: u8,
    /// RSSI calibration for listen-before-talk, in dB
    pub rssi_cal: i8,
    /// 48-bit hardware address for MAC-derived provisioning
    pub hardware_address: Option<[u8; 6]>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sub_band: 2,
            timing: TimingParams::default(),
            duty_cycle: None,
            retry: RetryPolicy::default(),
            adr: AdrPolicy::default(),
            data_rate: None,
            tx_power: 0,
            rssi_cal: 10,
            hardware_address: None,
        }
    }
}

impl Settings {
    /// Set the uplink sub-band
    pub fn with_sub_band(mut self, band: u8) -> Self {
        self.sub_band = band;
        self
    }

    /// Set protocol timing
    pub fn with_timing(mut self, timing: TimingParams) -> Self {
        self.timing = timing;
        self
    }

    /// Override the region's duty-cycle limits
    pub fn with_duty_cycle(mut self, table: DutyCycleTable) -> Self {
        self.duty_cycle = Some(table);
        self
    }

    /// Set the confirmed-uplink retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set ADR tuning
    pub fn with_adr(mut self, adr: AdrPolicy) -> Self {
        self.adr = adr;
        self
    }

    /// Fix the initial data rate and transmit power
    pub fn with_radio_parameters(mut self, data_rate: u8, tx_power: u8) -> Self {
        self.data_rate = Some(data_rate);
        self.tx_power = tx_power;
        self
    }

    /// Set the hardware address used by MAC-derived provisioning
    pub fn with_hardware_address(mut self, mac: [u8; 6]) -> Self {
        self.hardware_address = Some(mac);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eu868_table() {
        let table = DutyCycleTable::eu868();
        assert_eq!(table.fraction(1), Some(0.01));
        assert_eq!(table.fraction(3), Some(0.1));
        assert_eq!(table.fraction(7), None);
    }

    #[test]
    fn out_of_range_fraction_is_unrestricted() {
        let table = DutyCycleTable::from_fractions(&[Some(0.0), Some(1.5), Some(0.5)]);
        assert_eq!(table.fraction(0), None);
        assert_eq!(table.fraction(1), None);
        assert_eq!(table.fraction(2), Some(0.5));
    }

    #[test]
    fn defaults_follow_ttn() {
        let settings = Settings::default();
        assert_eq!(settings.sub_band, 2);
        assert_eq!(settings.rssi_cal, 10);
        assert!(settings.adr.enabled);
        assert_eq!(settings.duty_cycle, None);
    }
}
