use std::sync::Arc;
use std::time::Duration;

use crate::radio::traits::{ModulationParams, PinConfig, Radio, RadioError, RxConfig, RxQuality, TxConfig};
use crate::timer::Clock;

/// Largest PHY payload a LoRa radio carries
pub const MAX_PHY_PAYLOAD: usize = 255;

/// Slack granted to the driver beyond the computed completion time
const COMPLETION_SLACK: Duration = Duration::from_secs(1);

/// PHY layer timing parameters
///
/// Regional values; the defaults are the LoRaWAN 1.0.x ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingParams {
    /// Delay from end of uplink to RX1
    pub rx1_delay: Duration,
    /// Delay from end of uplink to RX2
    pub rx2_delay: Duration,
    /// Delay from end of join-request to the first join window
    pub join_accept_delay1: Duration,
    /// Delay from end of join-request to the second join window
    pub join_accept_delay2: Duration,
    /// How long each receive window listens for a preamble
    pub rx_window: Duration,
    /// Interval between driver completion polls
    pub poll_interval: Duration,
}

impl Default for TimingParams {
    fn default() -> Self {
        Self {
            rx1_delay: Duration::from_secs(1),
            rx2_delay: Duration::from_secs(2),
            join_accept_delay1: Duration::from_secs(5),
            join_accept_delay2: Duration::from_secs(6),
            rx_window: Duration::from_millis(500),
            poll_interval: Duration::from_millis(1),
        }
    }
}

/// LoRa time on air in milliseconds (explicit header, CRC on, 8-symbol preamble)
pub fn time_on_air(modulation: &ModulationParams, payload_len: usize) -> u32 {
    if modulation.spreading_factor == 0 || modulation.bandwidth == 0 {
        // FSK 50 kbps: preamble + sync + length + payload + CRC
        let bytes = 5 + 3 + 1 + payload_len + 2;
        return ((bytes * 8) as u32).div_ceil(50);
    }

    let sf = f64::from(modulation.spreading_factor);
    let bw = f64::from(modulation.bandwidth);
    let cr = f64::from(modulation.coding_rate.clamp(1, 4));
    let low_data_rate = modulation.spreading_factor >= 11 && modulation.bandwidth == 125_000;
    let de = if low_data_rate { 1.0 } else { 0.0 };

    let t_sym = (2f64).powf(sf) / bw * 1000.0;
    let t_preamble = (8.0 + 4.25) * t_sym;
    let numerator = 8.0 * payload_len as f64 - 4.0 * sf + 28.0 + 16.0;
    let symbols = 8.0 + ((numerator / (4.0 * (sf - 2.0 * de))).ceil() * (cr + 4.0)).max(0.0);

    (t_preamble + symbols * t_sym).ceil() as u32
}

/// PHY layer: drives the radio through blocking transmit and receive
pub struct PhyLayer<R: Radio> {
    /// Radio driver
    radio: R,
    /// Time source for polling
    clock: Arc<dyn Clock>,
    /// Interval between completion polls
    poll_interval: Duration,
}

impl<R: Radio> PhyLayer<R> {
    /// Create new PHY layer
    pub fn new(radio: R, clock: Arc<dyn Clock>, poll_interval: Duration) -> Self {
        Self {
            radio,
            clock,
            poll_interval,
        }
    }

    /// Wire the radio to its pins
    pub fn configure(&mut self, pins: &PinConfig) -> Result<(), RadioError> {
        self.radio.configure(pins)
    }

    /// Transmit and wait for completion; returns the airtime in milliseconds
    pub fn transmit(&mut self, config: TxConfig, data: &[u8]) -> Result<u32, RadioError> {
        let expected = time_on_air(&config.modulation, data.len());
        let deadline = self.clock.now() + Duration::from_millis(u64::from(expected)) + COMPLETION_SLACK;

        self.radio.transmit(config, data)?;
        loop {
            match self.radio.poll_transmit() {
                Ok(airtime) => return Ok(airtime),
                Err(nb::Error::Other(e)) => return Err(e),
                Err(nb::Error::WouldBlock) => {
                    if self.clock.now() >= deadline {
                        tracing::warn!(expected_ms = expected, "transmit completion never signalled");
                        return Err(RadioError::Timeout);
                    }
                    self.clock.sleep(self.poll_interval);
                }
            }
        }
    }

    /// Listen for one window; `None` when nothing was received
    pub fn receive(&mut self, config: RxConfig, buffer: &mut [u8]) -> Result<Option<(usize, RxQuality)>, RadioError> {
        // A preamble caught at the end of the window still needs a full packet's airtime
        let longest = time_on_air(&config.modulation, MAX_PHY_PAYLOAD);
        let deadline = self.clock.now()
            + Duration::from_millis(u64::from(config.timeout_ms) + u64::from(longest))
            + COMPLETION_SLACK;

        self.radio.receive(config)?;
        loop {
            match self.radio.poll_receive(buffer) {
                Ok(result) => return Ok(result),
                Err(nb::Error::Other(e)) => return Err(e),
                Err(nb::Error::WouldBlock) => {
                    if self.clock.now() >= deadline {
                        tracing::warn!(frequency = config.frequency, "receive window never closed");
                        return Err(RadioError::Timeout);
                    }
                    self.clock.sleep(self.poll_interval);
                }
            }
        }
    }

    /// Channel RSSI for listen-before-talk
    pub fn channel_rssi(&mut self, frequency: u32) -> Result<i16, RadioError> {
        self.radio.channel_rssi(frequency)
    }

    /// Put the radio to sleep
    pub fn sleep(&mut self) -> Result<(), RadioError> {
        self.radio.sleep()
    }

    /// Time source shared with the scheduler
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}
