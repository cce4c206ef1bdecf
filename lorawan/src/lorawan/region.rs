use heapless::Vec;

use crate::config::settings::DutyCycleTable;
use crate::radio::traits::ModulationParams;

/// Upper bound on channels in any supported plan
pub const MAX_CHANNELS: usize = 72;

/// Modulation of one data-rate index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRate {
    /// Spreading factor (0 for FSK)
    pub spreading_factor: u8,
    /// Bandwidth in Hz
    pub bandwidth: u32,
}

impl DataRate {
    const fn lora(spreading_factor: u8, bandwidth: u32) -> Self {
        Self {
            spreading_factor,
            bandwidth,
        }
    }

    /// Radio modulation parameters (coding rate 4/5)
    pub fn modulation(&self) -> ModulationParams {
        ModulationParams {
            spreading_factor: self.spreading_factor,
            bandwidth: self.bandwidth,
            coding_rate: 1,
        }
    }
}

/// Uplink channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Channel {
    /// Channel frequency in Hz
    pub frequency: u32,
    /// Minimum data rate index
    pub min_dr: u8,
    /// Maximum data rate index
    pub max_dr: u8,
    /// Whether the channel is enabled
    pub enabled: bool,
}

impl Channel {
    const fn new(frequency: u32, min_dr: u8, max_dr: u8) -> Self {
        Self {
            frequency,
            min_dr,
            max_dr,
            enabled: true,
        }
    }

    fn supports(&self, dr: u8) -> bool {
        self.enabled && self.frequency != 0 && (self.min_dr..=self.max_dr).contains(&dr)
    }
}

/// Regional channel plan
///
/// Only the parts the MAC needs are modelled: channels, data-rate table,
/// receive-window derivation, power steps and duty-cycle band assignment.
pub trait Region: Send + 'static {
    /// Restrict uplinks to a sub-band (0 = all); no-op where sub-bands do not exist
    fn set_sub_band(&mut self, band: u8);

    /// Channel at `index`
    fn channel(&self, index: usize) -> Option<Channel>;

    /// Indices of enabled channels able to carry `dr`
    fn uplink_channels(&self, dr: u8) -> Vec<usize, MAX_CHANNELS>;

    /// Modulation of data rate `index`
    fn data_rate(&self, index: u8) -> Option<DataRate>;

    /// Lowest uplink data rate
    fn min_data_rate(&self) -> u8;

    /// Highest uplink data rate reachable by ADR
    fn max_data_rate(&self) -> u8;

    /// Data rate used before ADR has any information
    fn default_data_rate(&self) -> u8;

    /// Data rate of join-requests
    fn join_data_rate(&self) -> u8;

    /// Largest application payload at `dr`
    fn max_payload_size(&self, dr: u8) -> usize;

    /// Highest (weakest) transmit-power index
    fn max_tx_power_index(&self) -> u8;

    /// EIRP in dBm of power index `index` (0 = maximum)
    fn tx_power_dbm(&self, index: u8) -> Option<i8>;

    /// RX1 frequency and data rate for an uplink on `channel` at `dr`
    fn rx1_window(&self, channel: usize, dr: u8, rx1_dr_offset: u8) -> (u32, u8);

    /// RX2 frequency and data rate before the network changes them
    fn rx2_default(&self) -> (u32, u8);

    /// Duty-cycle band a frequency belongs to
    fn duty_cycle_band(&self, frequency: u32) -> usize;

    /// Regulatory duty-cycle limits, indexed by [`duty_cycle_band`](Self::duty_cycle_band)
    fn duty_cycle_table(&self) -> DutyCycleTable {
        DutyCycleTable::unrestricted()
    }

    /// Listen-before-talk threshold in dBm, where required
    fn lbt_threshold(&self) -> Option<i16> {
        None
    }

    /// Apply the optional CFList of a join-accept
    fn apply_cf_list(&mut self, _cf_list: &[u8; 16]) {}

    /// Define or remove a channel (NewChannelReq); `false` if refused
    fn set_channel(&mut self, _index: u8, _frequency: u32, _min_dr: u8, _max_dr: u8) -> bool {
        false
    }

    /// Apply a LinkADRReq channel mask; `false` if the mask is invalid
    fn apply_channel_mask(&mut self, mask: u16, control: u8) -> bool;
}

const US915_DATA_RATES: [Option<DataRate>; 14] = [
    Some(DataRate::lora(10, 125_000)),
    Some(DataRate::lora(9, 125_000)),
    Some(DataRate::lora(8, 125_000)),
    Some(DataRate::lora(7, 125_000)),
    Some(DataRate::lora(8, 500_000)),
    None,
    None,
    None,
    Some(DataRate::lora(12, 500_000)),
    Some(DataRate::lora(11, 500_000)),
    Some(DataRate::lora(10, 500_000)),
    Some(DataRate::lora(9, 500_000)),
    Some(DataRate::lora(8, 500_000)),
    Some(DataRate::lora(7, 500_000)),
];

/// US902-928 channel plan
#[derive(Debug, Clone)]
pub struct US915 {
    /// Upstream channels (64 x 125 kHz + 8 x 500 kHz)
    channels: Vec<Channel, MAX_CHANNELS>,
    /// Current sub-band (0 = all)
    sub_band: u8,
}

impl Default for US915 {
    fn default() -> Self {
        let mut channels = Vec::new();
        for i in 0..64u32 {
            // 64 + 8 fits MAX_CHANNELS
            let _ = channels.push(Channel::new(902_300_000 + i * 200_000, 0, 3));
        }
        for i in 0..8u32 {
            let _ = channels.push(Channel::new(903_000_000 + i * 1_600_000, 4, 4));
        }
        Self {
            channels,
            sub_band: 0,
        }
    }
}

impl US915 {
    /// Create a plan with every channel enabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Current sub-band (0 = all)
    pub fn sub_band(&self) -> u8 {
        self.sub_band
    }
}

impl Region for US915 {
    fn set_sub_band(&mut self, band: u8) {
        self.sub_band = band.min(8);
        for (i, channel) in self.channels.iter_mut().enumerate() {
            channel.enabled = match self.sub_band {
                0 => true,
                b if i < 64 => i / 8 == usize::from(b - 1),
                b => i - 64 == usize::from(b - 1),
            };
        }
    }

    fn channel(&self, index: usize) -> Option<Channel> {
        self.channels.get(index).copied()
    }

    fn uplink_channels(&self, dr: u8) -> Vec<usize, MAX_CHANNELS> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.supports(dr))
            .map(|(i, _)| i)
            .collect()
    }

    fn data_rate(&self, index: u8) -> Option<DataRate> {
        US915_DATA_RATES.get(usize::from(index)).copied().flatten()
    }

    fn min_data_rate(&self) -> u8 {
        0
    }

    fn max_data_rate(&self) -> u8 {
        3
    }

    fn default_data_rate(&self) -> u8 {
        0
    }

    fn join_data_rate(&self) -> u8 {
        0
    }

    fn max_payload_size(&self, dr: u8) -> usize {
        match dr {
            0 => 11,
            1 => 53,
            2 => 125,
            3 | 4 => 242,
            8 => 53,
            9 => 129,
            10..=13 => 242,
            _ => 0,
        }
    }

    fn max_tx_power_index(&self) -> u8 {
        10
    }

    fn tx_power_dbm(&self, index: u8) -> Option<i8> {
        (index <= self.max_tx_power_index()).then(|| 30 - 2 * index as i8)
    }

    fn rx1_window(&self, channel: usize, dr: u8, rx1_dr_offset: u8) -> (u32, u8) {
        let frequency = 923_300_000 + (channel % 8) as u32 * 600_000;
        let data_rate = (10 + dr).saturating_sub(rx1_dr_offset).clamp(8, 13);
        (frequency, data_rate)
    }

    fn rx2_default(&self) -> (u32, u8) {
        (923_300_000, 8)
    }

    fn duty_cycle_band(&self, _frequency: u32) -> usize {
        0
    }

    fn apply_cf_list(&mut self, cf_list: &[u8; 16]) {
        // CFList type 1: channel mask for all 72 channels
        if cf_list[15] != 1 {
            return;
        }
        for (i, channel) in self.channels.iter_mut().enumerate() {
            channel.enabled = cf_list[i / 8] & (1 << (i % 8)) != 0;
        }
    }

    fn apply_channel_mask(&mut self, mask: u16, control: u8) -> bool {
        match control {
            0..=4 => {
                let base = usize::from(control) * 16;
                for bit in 0..16 {
                    if let Some(channel) = self.channels.get_mut(base + bit) {
                        channel.enabled = mask & (1 << bit) != 0;
                    }
                }
                true
            }
            6 | 7 => {
                let on = control == 6;
                for (i, channel) in self.channels.iter_mut().enumerate() {
                    channel.enabled = if i < 64 { on } else { mask & (1 << (i - 64)) != 0 };
                }
                true
            }
            _ => false,
        }
    }
}

const EU868_DATA_RATES: [DataRate; 8] = [
    DataRate::lora(12, 125_000),
    DataRate::lora(11, 125_000),
    DataRate::lora(10, 125_000),
    DataRate::lora(9, 125_000),
    DataRate::lora(8, 125_000),
    DataRate::lora(7, 125_000),
    DataRate::lora(7, 250_000),
    // FSK 50 kbps
    DataRate::lora(0, 0),
];

const EU868_MAX_CHANNELS: usize = 16;
const EU868_DEFAULT_CHANNELS: usize = 3;

/// EU863-870 channel plan
#[derive(Debug, Clone)]
pub struct EU868 {
    channels: Vec<Channel, EU868_MAX_CHANNELS>,
}

impl Default for EU868 {
    fn default() -> Self {
        let mut channels = Vec::new();
        for frequency in [868_100_000, 868_300_000, 868_500_000] {
            let _ = channels.push(Channel::new(frequency, 0, 5));
        }
        Self { channels }
    }
}

impl EU868 {
    /// Create a plan with the three mandatory join channels
    pub fn new() -> Self {
        Self::default()
    }

    fn valid_frequency(frequency: u32) -> bool {
        (863_000_000..=870_000_000).contains(&frequency)
    }

    fn put_channel(&mut self, index: usize, channel: Channel) {
        while self.channels.len() <= index {
            if self
                .channels
                .push(Channel {
                    frequency: 0,
                    min_dr: 0,
                    max_dr: 0,
                    enabled: false,
                })
                .is_err()
            {
                return;
            }
        }
        self.channels[index] = channel;
    }
}

impl Region for EU868 {
    fn set_sub_band(&mut self, _band: u8) {}

    fn channel(&self, index: usize) -> Option<Channel> {
        self.channels.get(index).copied()
    }

    fn uplink_channels(&self, dr: u8) -> Vec<usize, MAX_CHANNELS> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.supports(dr))
            .map(|(i, _)| i)
            .collect()
    }

    fn data_rate(&self, index: u8) -> Option<DataRate> {
        EU868_DATA_RATES.get(usize::from(index)).copied()
    }

    fn min_data_rate(&self) -> u8 {
        0
    }

    fn max_data_rate(&self) -> u8 {
        5
    }

    fn default_data_rate(&self) -> u8 {
        5
    }

    fn join_data_rate(&self) -> u8 {
        5
    }

    fn max_payload_size(&self, dr: u8) -> usize {
        match dr {
            0..=2 => 51,
            3 => 115,
            4..=7 => 222,
            _ => 0,
        }
    }

    fn max_tx_power_index(&self) -> u8 {
        7
    }

    fn tx_power_dbm(&self, index: u8) -> Option<i8> {
        (index <= self.max_tx_power_index()).then(|| 16 - 2 * index as i8)
    }

    fn rx1_window(&self, channel: usize, dr: u8, rx1_dr_offset: u8) -> (u32, u8) {
        let frequency = self.channels.get(channel).map(|c| c.frequency).unwrap_or(868_100_000);
        (frequency, dr.saturating_sub(rx1_dr_offset))
    }

    fn rx2_default(&self) -> (u32, u8) {
        (869_525_000, 0)
    }

    fn duty_cycle_band(&self, frequency: u32) -> usize {
        match frequency {
            868_000_000..=868_600_000 => 1,
            868_700_000..=869_200_000 => 2,
            869_400_000..=869_650_000 => 3,
            869_700_000..=870_000_000 => 4,
            _ => 0,
        }
    }

    fn duty_cycle_table(&self) -> DutyCycleTable {
        DutyCycleTable::eu868()
    }

    fn apply_cf_list(&mut self, cf_list: &[u8; 16]) {
        // CFList type 0: five extra frequencies in units of 100 Hz
        if cf_list[15] != 0 {
            return;
        }
        for (slot, raw) in cf_list[..15].chunks_exact(3).enumerate() {
            let frequency = u32::from_le_bytes([raw[0], raw[1], raw[2], 0]) * 100;
            if frequency != 0 && Self::valid_frequency(frequency) {
                self.put_channel(EU868_DEFAULT_CHANNELS + slot, Channel::new(frequency, 0, 5));
            }
        }
    }

    fn set_channel(&mut self, index: u8, frequency: u32, min_dr: u8, max_dr: u8) -> bool {
        let index = usize::from(index);
        if index < EU868_DEFAULT_CHANNELS || index >= EU868_MAX_CHANNELS || min_dr > max_dr || max_dr > 7 {
            return false;
        }
        if frequency == 0 {
            if let Some(channel) = self.channels.get_mut(index) {
                channel.frequency = 0;
                channel.enabled = false;
            }
            return true;
        }
        if !Self::valid_frequency(frequency) {
            return false;
        }
        self.put_channel(index, Channel::new(frequency, min_dr, max_dr));
        true
    }

    fn apply_channel_mask(&mut self, mask: u16, control: u8) -> bool {
        match control {
            0 => {
                if mask == 0 {
                    return false;
                }
                for (i, channel) in self.channels.iter_mut().enumerate() {
                    channel.enabled = channel.frequency != 0 && mask & (1 << i) != 0;
                }
                true
            }
            6 => {
                for channel in self.channels.iter_mut() {
                    channel.enabled = channel.frequency != 0;
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn us915_sub_band_two() {
        let mut region = US915::new();
        assert_eq!(region.uplink_channels(0).len(), 64);

        region.set_sub_band(2);
        let channels = region.uplink_channels(0);
        assert_eq!(channels.len(), 8);
        assert_eq!(region.channel(channels[0]).unwrap().frequency, 903_900_000);
        assert_eq!(region.uplink_channels(4).as_slice(), &[65]);
    }

    #[test]
    fn us915_rx_windows() {
        let region = US915::new();
        assert_eq!(region.rx1_window(9, 0, 0), (923_900_000, 10));
        assert_eq!(region.rx1_window(9, 4, 1), (923_900_000, 13));
        assert_eq!(region.rx1_window(9, 0, 3), (923_900_000, 8));
        assert_eq!(region.rx2_default(), (923_300_000, 8));
        assert_eq!(region.data_rate(8).unwrap().spreading_factor, 12);
    }

    #[test]
    fn us915_channel_mask_control_seven() {
        let mut region = US915::new();
        assert!(region.apply_channel_mask(0x0002, 7));
        assert!(region.uplink_channels(0).is_empty());
        assert_eq!(region.uplink_channels(4).as_slice(), &[65]);
    }

    #[test]
    fn eu868_cf_list_adds_channels() {
        let mut region = EU868::new();
        let mut cf = [0u8; 16];
        let f = (867_100_000u32 / 100).to_le_bytes();
        cf[..3].copy_from_slice(&f[..3]);
        region.apply_cf_list(&cf);
        assert_eq!(region.channel(3).unwrap().frequency, 867_100_000);
        assert_eq!(region.uplink_channels(5).len(), 4);
    }

    #[test]
    fn eu868_duty_bands_and_power() {
        let region = EU868::new();
        assert_eq!(region.duty_cycle_band(868_100_000), 1);
        assert_eq!(region.duty_cycle_band(869_525_000), 3);
        assert_eq!(region.duty_cycle_band(867_100_000), 0);
        assert_eq!(region.tx_power_dbm(0), Some(16));
        assert_eq!(region.tx_power_dbm(7), Some(2));
        assert_eq!(region.tx_power_dbm(8), None);
    }

    #[test]
    fn regulatory_duty_cycle_comes_with_the_plan() {
        let eu = EU868::new();
        let table = eu.duty_cycle_table();
        assert_eq!(table.fraction(eu.duty_cycle_band(868_100_000)), Some(0.01));
        assert_eq!(table.fraction(eu.duty_cycle_band(869_525_000)), Some(0.1));

        let us = US915::new();
        assert_eq!(us.duty_cycle_table().fraction(us.duty_cycle_band(903_900_000)), None);
    }

    #[test]
    fn eu868_default_channels_are_fixed() {
        let mut region = EU868::new();
        assert!(!region.set_channel(1, 867_500_000, 0, 5));
        assert!(region.set_channel(4, 867_500_000, 0, 5));
        assert_eq!(region.channel(4).unwrap().frequency, 867_500_000);
        assert!(!region.channel(3).unwrap().enabled);
    }
}
