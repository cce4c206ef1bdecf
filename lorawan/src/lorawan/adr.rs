//! Adaptive data rate
//!
//! The controller owns the uplink data-rate and power indices. It reacts to
//! three inputs: transmission outcomes, the ADRACKReq counter and LinkADRReq
//! commands from the network. While disabled it changes nothing, so values
//! set by the application stay in force.

use crate::config::settings::AdrPolicy;

/// Lowest SNR (dB) at which a spreading factor still demodulates
pub fn demodulation_floor(spreading_factor: u8) -> Option<f32> {
    match spreading_factor {
        7 => Some(-7.5),
        8 => Some(-10.0),
        9 => Some(-12.5),
        10 => Some(-15.0),
        11 => Some(-17.5),
        12 => Some(-20.0),
        _ => None,
    }
}

/// Result of one uplink, as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// The network answered; `snr` is the downlink's SNR
    Success {
        /// Signal-to-noise ratio in dB
        snr: i8,
        /// Spreading factor the uplink used
        spreading_factor: u8,
    },
    /// A confirmed uplink went unacknowledged
    Failure,
}

/// What an update changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// Nothing changed
    None,
    /// Data rate raised to the given index
    DataRateUp(u8),
    /// Data rate lowered to the given index
    DataRateDown(u8),
    /// Power raised; the new (lower) power index
    PowerUp(u8),
}

/// Data-rate and power limits of the active region
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdrLimits {
    /// Lowest uplink data rate
    pub min_data_rate: u8,
    /// Highest data rate ADR may reach
    pub max_data_rate: u8,
    /// Weakest power index (0 = maximum power)
    pub max_power_index: u8,
}

/// Adaptive data rate controller
#[derive(Debug, Clone)]
pub struct AdrController {
    policy: AdrPolicy,
    limits: AdrLimits,
    enabled: bool,
    data_rate: u8,
    tx_power: u8,
    successes: u8,
    failures: u8,
    /// Uplinks since the last downlink
    ack_counter: u16,
}

impl AdrController {
    /// Create a controller starting at `data_rate` / `tx_power`
    pub fn new(policy: AdrPolicy, limits: AdrLimits, data_rate: u8, tx_power: u8) -> Self {
        Self {
            enabled: policy.enabled,
            policy,
            limits,
            data_rate: data_rate.clamp(limits.min_data_rate, limits.max_data_rate),
            tx_power: tx_power.min(limits.max_power_index),
            successes: 0,
            failures: 0,
            ack_counter: 0,
        }
    }

    /// Whether ADR is on
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Turn ADR on or off; counters restart either way
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.restart();
    }

    /// Current data-rate index
    pub fn data_rate(&self) -> u8 {
        self.data_rate
    }

    /// Current power index (0 = maximum)
    pub fn tx_power(&self) -> u8 {
        self.tx_power
    }

    /// Adopt new region limits (after a join or sub-band change)
    pub fn set_limits(&mut self, limits: AdrLimits) {
        self.limits = limits;
        self.data_rate = self.data_rate.clamp(limits.min_data_rate, limits.max_data_rate);
        self.tx_power = self.tx_power.min(limits.max_power_index);
    }

    /// Forget runs and the ADRACKReq counter
    pub fn restart(&mut self) {
        self.successes = 0;
        self.failures = 0;
        self.ack_counter = 0;
    }

    /// Count an uplink; returns whether it must carry ADRACKReq
    ///
    /// Once `ack_limit` uplinks went unanswered the device asks the network
    /// to respond, and every further `ack_delay` silent uplinks it steps
    /// towards a more robust configuration.
    pub fn on_uplink(&mut self) -> (bool, Adjustment) {
        if !self.enabled {
            return (false, Adjustment::None);
        }
        self.ack_counter = self.ack_counter.saturating_add(1);
        let limit = self.policy.ack_limit;
        if self.ack_counter < limit {
            return (false, Adjustment::None);
        }

        let beyond = self.ack_counter - limit;
        let delay = self.policy.ack_delay.max(1);
        let adjustment = if beyond > 0 && beyond % delay == 0 {
            let step = self.step_down();
            tracing::debug!(?step, ack_counter = self.ack_counter, "ADR backoff");
            step
        } else {
            Adjustment::None
        };
        (true, adjustment)
    }

    /// Any downlink proves the link
    pub fn on_downlink(&mut self) {
        self.ack_counter = 0;
    }

    /// Feed one outcome; at most one of data rate or power changes
    pub fn record(&mut self, outcome: Outcome) -> Adjustment {
        if !self.enabled {
            return Adjustment::None;
        }

        match outcome {
            Outcome::Success { snr, spreading_factor } => {
                self.failures = 0;
                let margin_ok = demodulation_floor(spreading_factor)
                    .map(|floor| f32::from(snr) - floor >= self.policy.margin_db)
                    .unwrap_or(false);
                if !margin_ok {
                    self.successes = 0;
                    return Adjustment::None;
                }
                self.successes = self.successes.saturating_add(1);
                if self.successes < self.policy.success_run.max(1) || self.data_rate >= self.limits.max_data_rate {
                    return Adjustment::None;
                }
                self.successes = 0;
                self.data_rate += 1;
                tracing::debug!(data_rate = self.data_rate, snr, "ADR raised data rate");
                Adjustment::DataRateUp(self.data_rate)
            }
            Outcome::Failure => {
                self.successes = 0;
                self.failures = self.failures.saturating_add(1);
                if self.failures < self.policy.failure_run.max(1) {
                    return Adjustment::None;
                }
                self.failures = 0;
                let step = self.step_down();
                tracing::debug!(?step, "ADR stepped down after failures");
                step
            }
        }
    }

    /// Retransmission fallback: one data rate lower, if ADR allows it
    pub fn fallback(&mut self) -> Adjustment {
        if !self.enabled || self.data_rate <= self.limits.min_data_rate {
            return Adjustment::None;
        }
        self.data_rate -= 1;
        Adjustment::DataRateDown(self.data_rate)
    }

    /// Apply a LinkADRReq; `0x0F` keeps the current value
    ///
    /// Returns `(data_rate_ack, power_ack)`. Nothing changes unless both
    /// are acceptable and ADR is enabled.
    pub fn apply_network(&mut self, data_rate: u8, tx_power: u8, valid_data_rate: impl Fn(u8) -> bool) -> (bool, bool) {
        if !self.enabled {
            return (false, false);
        }
        let dr_ok = data_rate == 0x0F || valid_data_rate(data_rate);
        let power_ok = tx_power == 0x0F || tx_power <= self.limits.max_power_index;
        if dr_ok && power_ok {
            if data_rate != 0x0F {
                self.data_rate = data_rate;
            }
            if tx_power != 0x0F {
                self.tx_power = tx_power;
            }
            self.restart();
        }
        (dr_ok, power_ok)
    }

    /// Power first, then data rate
    fn step_down(&mut self) -> Adjustment {
        if self.tx_power > 0 {
            self.tx_power -= 1;
            Adjustment::PowerUp(self.tx_power)
        } else if self.data_rate > self.limits.min_data_rate {
            self.data_rate -= 1;
            Adjustment::DataRateDown(self.data_rate)
        } else {
            Adjustment::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: AdrLimits = AdrLimits {
        min_data_rate: 0,
        max_data_rate: 5,
        max_power_index: 7,
    };

    fn controller(dr: u8, power: u8) -> AdrController {
        AdrController::new(AdrPolicy::default(), LIMITS, dr, power)
    }

    fn strong(sf: u8) -> Outcome {
        Outcome::Success {
            snr: 8,
            spreading_factor: sf,
        }
    }

    #[test]
    fn success_run_raises_data_rate() {
        let mut adr = controller(2, 0);
        for _ in 0..3 {
            assert_eq!(adr.record(strong(10)), Adjustment::None);
        }
        assert_eq!(adr.record(strong(10)), Adjustment::DataRateUp(3));
        assert_eq!(adr.tx_power(), 0);
    }

    #[test]
    fn weak_margin_does_not_count() {
        let mut adr = controller(2, 0);
        let weak = Outcome::Success {
            snr: -10,
            spreading_factor: 10,
        };
        for _ in 0..10 {
            assert_eq!(adr.record(weak), Adjustment::None);
        }
        assert_eq!(adr.data_rate(), 2);
    }

    #[test]
    fn failures_raise_power_before_lowering_rate() {
        let mut adr = controller(3, 1);
        assert_eq!(adr.record(Outcome::Failure), Adjustment::None);
        assert_eq!(adr.record(Outcome::Failure), Adjustment::PowerUp(0));
        assert_eq!(adr.data_rate(), 3);
        adr.record(Outcome::Failure);
        assert_eq!(adr.record(Outcome::Failure), Adjustment::DataRateDown(2));
        assert_eq!(adr.tx_power(), 0);
    }

    #[test]
    fn disabled_controller_is_inert() {
        let mut adr = controller(3, 2);
        adr.set_enabled(false);
        for _ in 0..20 {
            assert_eq!(adr.record(Outcome::Failure), Adjustment::None);
            assert_eq!(adr.record(strong(9)), Adjustment::None);
        }
        assert_eq!(adr.fallback(), Adjustment::None);
        assert_eq!(adr.apply_network(5, 0, |_| true), (false, false));
        assert_eq!(adr.on_uplink(), (false, Adjustment::None));
        assert_eq!((adr.data_rate(), adr.tx_power()), (3, 2));
    }

    #[test]
    fn ack_request_and_backoff() {
        let policy = AdrPolicy {
            ack_limit: 4,
            ack_delay: 2,
            ..AdrPolicy::default()
        };
        let mut adr = AdrController::new(policy, LIMITS, 5, 1);
        for _ in 0..3 {
            assert_eq!(adr.on_uplink(), (false, Adjustment::None));
        }
        assert_eq!(adr.on_uplink(), (true, Adjustment::None));
        assert_eq!(adr.on_uplink(), (true, Adjustment::None));
        assert_eq!(adr.on_uplink(), (true, Adjustment::PowerUp(0)));
        adr.on_uplink();
        assert_eq!(adr.on_uplink(), (true, Adjustment::DataRateDown(4)));
        adr.on_downlink();
        assert_eq!(adr.on_uplink(), (false, Adjustment::None));
    }

    #[test]
    fn network_request_is_validated() {
        let mut adr = controller(0, 0);
        assert_eq!(adr.apply_network(4, 9, |dr| dr <= 5), (true, false));
        assert_eq!(adr.data_rate(), 0);
        assert_eq!(adr.apply_network(4, 0x0F, |dr| dr <= 5), (true, true));
        assert_eq!((adr.data_rate(), adr.tx_power()), (4, 0));
    }
}
