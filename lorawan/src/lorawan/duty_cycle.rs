//! Per-band duty-cycle accounting
//!
//! After a transmission of airtime `d` ending at `t` on a band limited to
//! fraction `f`, that band stays closed until `t + d / f - d`. The network
//! may add a device-wide limit of `1 / 2^n` on top (DutyCycleReq).

use std::time::Duration;

use crate::config::settings::{DutyCycleTable, MAX_DUTY_CYCLE_BANDS};

#[derive(Debug, Clone, Copy, Default)]
struct BandState {
    /// Total airtime spent on the band
    airtime: Duration,
    /// Earliest start of the next transmission
    next_allowed: Duration,
}

/// Tracks airtime and enforces the wait before the next legal transmission
#[derive(Debug, Clone)]
pub struct DutyCycleGovernor {
    table: DutyCycleTable,
    bands: [BandState; MAX_DUTY_CYCLE_BANDS],
    /// Network-imposed limit across all bands
    aggregated: Option<f64>,
    aggregated_next: Duration,
}

/// Off time after `airtime` under `fraction`, to the microsecond
fn off_time(airtime: Duration, fraction: f64) -> Duration {
    let period_us = (airtime.as_secs_f64() / fraction * 1e6).round() as u64;
    Duration::from_micros(period_us).saturating_sub(airtime)
}

impl DutyCycleGovernor {
    /// Governor enforcing `table`
    pub fn new(table: DutyCycleTable) -> Self {
        Self {
            table,
            bands: [BandState::default(); MAX_DUTY_CYCLE_BANDS],
            aggregated: None,
            aggregated_next: Duration::ZERO,
        }
    }

    /// Account for a transmission on `band` that ended at `now`
    pub fn record_transmission(&mut self, band: usize, now: Duration, airtime: Duration) {
        if let Some(fraction) = self.aggregated {
            self.aggregated_next = self.aggregated_next.max(now + off_time(airtime, fraction));
        }

        let fraction = self.table.fraction(band);
        let Some(state) = self.bands.get_mut(band) else {
            return;
        };
        state.airtime += airtime;
        if let Some(fraction) = fraction {
            state.next_allowed = state.next_allowed.max(now + off_time(airtime, f64::from(fraction)));
            tracing::debug!(band, next_allowed_ms = state.next_allowed.as_millis() as u64, "band closed");
        }
    }

    /// How long a transmission on `band` must still wait at `now`
    pub fn time_until_allowed(&self, band: usize, now: Duration) -> Duration {
        let mut next = self.aggregated_next;
        if self.table.fraction(band).is_some() {
            if let Some(state) = self.bands.get(band) {
                next = next.max(state.next_allowed);
            }
        }
        next.saturating_sub(now)
    }

    /// Total airtime spent on `band`
    pub fn airtime(&self, band: usize) -> Duration {
        self.bands.get(band).map(|b| b.airtime).unwrap_or_default()
    }

    /// Apply a DutyCycleReq exponent: limit all bands to `1 / 2^n` (0 lifts it)
    pub fn set_aggregated(&mut self, max_duty_cycle: u8) {
        self.aggregated = match max_duty_cycle & 0x0F {
            0 => None,
            n => Some(1.0 / f64::from(1u32 << n)),
        };
    }

    /// Drop the network-imposed limit; per-band accounting is regulatory and stays
    pub fn clear_aggregated(&mut self) {
        self.aggregated = None;
        self.aggregated_next = Duration::ZERO;
    }
}
