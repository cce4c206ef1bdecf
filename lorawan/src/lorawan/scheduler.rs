//! Single-uplink orchestration
//!
//! One [`TransmissionScheduler::exchange`] is one uplink and its receive
//! windows:
//!
//! 1. wait until the duty-cycle band of the chosen channel is open,
//! 2. listen before talk where the region requires it,
//! 3. transmit and charge the airtime to the band,
//! 4. open RX1, and RX2 if RX1 produced nothing acceptable.
//!
//! The window in progress is published to the shared [`RadioSettingsTable`].
//! Retransmission of confirmed uplinks is paced by [`RetrySchedule`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::duty_cycle::DutyCycleGovernor;
use super::mac::MacError;
use super::phy::{PhyLayer, MAX_PHY_PAYLOAD};
use super::region::DataRate;
use crate::config::settings::RetryPolicy;
use crate::radio::settings::{RFSettings, RadioSettingsTable, WindowId};
use crate::radio::traits::{PinConfig, Radio, RadioError, RxConfig, RxQuality, TxConfig};

/// Frequency and data rate of one receive window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowPlan {
    /// Frequency in Hz
    pub frequency: u32,
    /// Modulation
    pub data_rate: DataRate,
}

/// Everything needed to run one uplink exchange
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxPlan {
    /// Uplink frequency in Hz
    pub frequency: u32,
    /// Uplink modulation
    pub data_rate: DataRate,
    /// Transmit power in dBm
    pub power_dbm: i8,
    /// Duty-cycle band of `frequency`
    pub band: usize,
    /// First receive window
    pub rx1: WindowPlan,
    /// Second receive window
    pub rx2: WindowPlan,
    /// RX1 opening, measured from the end of the uplink
    pub rx1_delay: Duration,
    /// RX2 opening, measured from the end of the uplink
    pub rx2_delay: Duration,
    /// Listen-before-talk threshold in dBm
    pub lbt_threshold: Option<i16>,
}

/// How an exchange ended
#[derive(Debug, Clone, PartialEq)]
pub enum Exchange<T> {
    /// A downlink passed validation
    Accepted {
        /// What the validator produced
        value: T,
        /// Window it arrived in
        window: WindowId,
        /// Its signal quality
        quality: RxQuality,
    },
    /// Something arrived but failed validation, and RX2 (if reached) brought nothing better
    Rejected(MacError),
    /// Both windows stayed empty
    Silent,
}

/// Drives the radio through uplinks and their receive windows
pub struct TransmissionScheduler<R: Radio> {
    phy: PhyLayer<R>,
    governor: DutyCycleGovernor,
    table: Arc<RwLock<RadioSettingsTable>>,
    rx_window: Duration,
    rssi_cal: i8,
}

impl<R: Radio> TransmissionScheduler<R> {
    /// Create a scheduler
    pub fn new(
        phy: PhyLayer<R>,
        governor: DutyCycleGovernor,
        table: Arc<RwLock<RadioSettingsTable>>,
        rx_window: Duration,
        rssi_cal: i8,
    ) -> Self {
        Self {
            phy,
            governor,
            table,
            rx_window,
            rssi_cal,
        }
    }

    /// Wire the radio
    pub fn configure(&mut self, pins: &PinConfig) -> Result<(), RadioError> {
        self.phy.configure(pins)
    }

    /// Put the radio to sleep
    pub fn sleep(&mut self) -> Result<(), RadioError> {
        self.table.write().idle();
        self.phy.sleep()
    }

    /// Duty-cycle accounting
    pub fn governor(&self) -> &DutyCycleGovernor {
        &self.governor
    }

    /// Duty-cycle accounting, for network-imposed limits
    pub fn governor_mut(&mut self) -> &mut DutyCycleGovernor {
        &mut self.governor
    }

    /// Listen-before-talk calibration
    pub fn set_rssi_cal(&mut self, rssi_cal: i8) {
        self.rssi_cal = rssi_cal;
    }

    fn enter(&self, window: WindowId, settings: RFSettings) {
        tracing::debug!(?window, frequency = settings.frequency, "window");
        self.table.write().enter(window, settings);
    }

    fn idle(&self) {
        self.table.write().idle();
    }

    /// Run one uplink and its receive windows
    ///
    /// `accept` validates each received frame; the first frame it accepts
    /// ends the exchange. A frame it rejects in RX1 does not stop RX2 from
    /// opening. Radio faults abort the exchange.
    pub fn exchange<T>(
        &mut self,
        frame: &[u8],
        plan: &TxPlan,
        accept: impl FnMut(&[u8]) -> Result<T, MacError>,
    ) -> Result<Exchange<T>, RadioError> {
        let result = self.run(frame, plan, accept);
        self.idle();
        result
    }

    fn run<T>(
        &mut self,
        frame: &[u8],
        plan: &TxPlan,
        mut accept: impl FnMut(&[u8]) -> Result<T, MacError>,
    ) -> Result<Exchange<T>, RadioError> {
        let clock = Arc::clone(self.phy.clock());

        let wait = self.governor.time_until_allowed(plan.band, clock.now());
        if !wait.is_zero() {
            tracing::debug!(band = plan.band, wait_ms = wait.as_millis() as u64, "waiting for duty cycle");
            clock.sleep(wait);
        }

        if let Some(threshold) = plan.lbt_threshold {
            let rssi = self.phy.channel_rssi(plan.frequency)? + i16::from(self.rssi_cal);
            if rssi > threshold {
                tracing::warn!(rssi, threshold, frequency = plan.frequency, "channel busy");
                return Err(RadioError::ChannelBusy);
            }
        }

        let modulation = plan.data_rate.modulation();
        self.enter(WindowId::Tx, RFSettings::new(&modulation, plan.frequency, Some(plan.power_dbm)));
        let started = clock.now();
        let airtime = self.phy.transmit(
            TxConfig {
                power: plan.power_dbm,
                frequency: plan.frequency,
                modulation,
            },
            frame,
        )?;
        let airtime = Duration::from_millis(u64::from(airtime));
        let tx_end = clock.now().max(started + airtime);
        self.governor.record_transmission(plan.band, tx_end, airtime);

        let mut rejection = None;
        for (window, target, delay) in [
            (WindowId::Rx1, plan.rx1, plan.rx1_delay),
            (WindowId::Rx2, plan.rx2, plan.rx2_delay),
        ] {
            clock.sleep_until(tx_end + delay);

            let modulation = target.data_rate.modulation();
            self.enter(window, RFSettings::new(&modulation, target.frequency, None));
            let mut buffer = [0u8; MAX_PHY_PAYLOAD];
            let config = RxConfig {
                frequency: target.frequency,
                modulation,
                timeout_ms: self.rx_window.as_millis() as u32,
            };
            let Some((len, quality)) = self.phy.receive(config, &mut buffer)? else {
                continue;
            };

            match accept(&buffer[..len.min(MAX_PHY_PAYLOAD)]) {
                Ok(value) => {
                    self.table.write().record_reception(quality.rssi, quality.snr);
                    return Ok(Exchange::Accepted { value, window, quality });
                }
                Err(error) => {
                    tracing::warn!(?window, %error, "discarded downlink");
                    rejection = Some(error);
                }
            }
        }

        Ok(rejection.map_or(Exchange::Silent, Exchange::Rejected))
    }
}

/// One transmission of a (possibly repeated) uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number
    pub number: u8,
    /// Lower the data rate before this attempt
    pub fall_back: bool,
}

/// Paces retransmissions of a confirmed uplink
///
/// Unconfirmed uplinks get exactly one attempt.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    policy: RetryPolicy,
    limit: u8,
    done: u8,
}

impl RetrySchedule {
    /// Schedule for one uplink
    pub fn new(policy: RetryPolicy, confirmed: bool) -> Self {
        let limit = if confirmed { policy.max_attempts.max(1) } else { 1 };
        Self { policy, limit, done: 0 }
    }

    /// The next attempt, or `None` once the policy is exhausted
    pub fn next_attempt(&mut self) -> Option<Attempt> {
        if self.done >= self.limit {
            return None;
        }
        self.done += 1;
        let every = self.policy.fallback_every;
        Some(Attempt {
            number: self.done,
            fall_back: self.done > 1 && every > 0 && (self.done - 1) % every == 0,
        })
    }
}
