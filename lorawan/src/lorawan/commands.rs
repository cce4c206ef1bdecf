use heapless::Vec;

use crate::lorawan::mac::MacError;

/// Largest FOpts field
pub const MAX_FOPTS: usize = 15;

/// MAC command identifiers (the same CID is used in both directions)
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum CommandIdentifier {
    /// Link quality check
    LinkCheck = 0x02,
    /// Data rate, power and channel mask
    LinkADR = 0x03,
    /// Aggregated duty-cycle limit
    DutyCycle = 0x04,
    /// RX1 offset and RX2 parameters
    RXParamSetup = 0x05,
    /// Battery and margin status
    DevStatus = 0x06,
    /// Create or modify a channel
    NewChannel = 0x07,
    /// Delay before RX1
    RXTimingSetup = 0x08,
    /// Dwell time and max EIRP
    TxParamSetup = 0x09,
    /// Separate RX1 downlink frequency
    DlChannel = 0x0A,
}

impl CommandIdentifier {
    fn from_byte(cid: u8) -> Option<Self> {
        Some(match cid {
            0x02 => Self::LinkCheck,
            0x03 => Self::LinkADR,
            0x04 => Self::DutyCycle,
            0x05 => Self::RXParamSetup,
            0x06 => Self::DevStatus,
            0x07 => Self::NewChannel,
            0x08 => Self::RXTimingSetup,
            0x09 => Self::TxParamSetup,
            0x0A => Self::DlChannel,
            _ => return None,
        })
    }

    /// Payload length of the network-to-device form of this command
    fn downlink_len(self) -> usize {
        match self {
            Self::LinkCheck => 2,
            Self::LinkADR => 4,
            Self::DutyCycle => 1,
            Self::RXParamSetup => 4,
            Self::DevStatus => 0,
            Self::NewChannel => 5,
            Self::RXTimingSetup => 1,
            Self::TxParamSetup => 1,
            Self::DlChannel => 4,
        }
    }
}

/// MAC command
#[derive(Debug, Clone, PartialEq)]
pub enum MacCommand {
    /// Link check request
    LinkCheckReq,
    /// Link check answer
    LinkCheckAns {
        /// Link margin in dB
        margin: u8,
        /// Number of gateways that received the request
        gateway_count: u8,
    },
    /// Link ADR request
    LinkADRReq {
        /// Data rate
        data_rate: u8,
        /// TX power
        tx_power: u8,
        /// Channel mask
        ch_mask: u16,
        /// Channel mask control
        ch_mask_cntl: u8,
        /// Number of transmissions
        nb_trans: u8,
    },
    /// Link ADR answer
    LinkADRAns {
        /// Power ACK
        power_ack: bool,
        /// Data rate ACK
        data_rate_ack: bool,
        /// Channel mask ACK
        channel_mask_ack: bool,
    },
    /// Duty cycle request
    DutyCycleReq {
        /// Maximum duty cycle exponent (limit is 1 / 2^n)
        max_duty_cycle: u8,
    },
    /// Duty cycle answer
    DutyCycleAns,
    /// RX parameter setup request
    RXParamSetupReq {
        /// RX1 data rate offset
        rx1_dr_offset: u8,
        /// RX2 data rate
        rx2_data_rate: u8,
        /// RX2 frequency in Hz
        freq: u32,
    },
    /// RX parameter setup answer
    RXParamSetupAns {
        /// RX1 data rate offset ACK
        rx1_dr_offset_ack: bool,
        /// RX2 data rate ACK
        rx2_data_rate_ack: bool,
        /// Channel ACK
        channel_ack: bool,
    },
    /// Device status request
    DevStatusReq,
    /// Device status answer
    DevStatusAns {
        /// Battery level (0 = external power, 1-254 = level, 255 = unknown)
        battery: u8,
        /// Demodulation margin in dB (-32..=31)
        margin: i8,
    },
    /// New channel request
    NewChannelReq {
        /// Channel index
        ch_index: u8,
        /// Frequency in Hz (0 removes the channel)
        freq: u32,
        /// Maximum data rate
        max_dr: u8,
        /// Minimum data rate
        min_dr: u8,
    },
    /// New channel answer
    NewChannelAns {
        /// Channel frequency OK
        channel_freq_ok: bool,
        /// Data rate OK
        data_rate_ok: bool,
    },
    /// RX timing setup request
    RXTimingSetupReq {
        /// Delay in seconds (0 means 1)
        delay: u8,
    },
    /// RX timing setup answer
    RXTimingSetupAns,
    /// TX parameter setup request (dwell-time regions only)
    TxParamSetupReq {
        /// Downlink dwell time
        downlink_dwell_time: bool,
        /// Uplink dwell time
        uplink_dwell_time: bool,
        /// Maximum EIRP
        max_eirp: u8,
    },
    /// Downlink channel request
    DlChannelReq {
        /// Channel index
        ch_index: u8,
        /// Frequency in Hz
        freq: u32,
    },
}

fn freq_from_bytes(raw: &[u8]) -> u32 {
    u32::from_le_bytes([raw[0], raw[1], raw[2], 0]) * 100
}

impl MacCommand {
    /// Parse one network-to-device command from its CID and payload
    pub fn from_bytes(cid: u8, payload: &[u8]) -> Option<Self> {
        let id = CommandIdentifier::from_byte(cid)?;
        if payload.len() < id.downlink_len() {
            return None;
        }
        Some(match id {
            CommandIdentifier::LinkCheck => MacCommand::LinkCheckAns {
                margin: payload[0],
                gateway_count: payload[1],
            },
            CommandIdentifier::LinkADR => MacCommand::LinkADRReq {
                data_rate: payload[0] >> 4,
                tx_power: payload[0] & 0x0F,
                ch_mask: u16::from_le_bytes([payload[1], payload[2]]),
                ch_mask_cntl: (payload[3] >> 4) & 0x07,
                nb_trans: payload[3] & 0x0F,
            },
            CommandIdentifier::DutyCycle => MacCommand::DutyCycleReq {
                max_duty_cycle: payload[0] & 0x0F,
            },
            CommandIdentifier::RXParamSetup => MacCommand::RXParamSetupReq {
                rx1_dr_offset: (payload[0] >> 4) & 0x07,
                rx2_data_rate: payload[0] & 0x0F,
                freq: freq_from_bytes(&payload[1..4]),
            },
            CommandIdentifier::DevStatus => MacCommand::DevStatusReq,
            CommandIdentifier::NewChannel => MacCommand::NewChannelReq {
                ch_index: payload[0],
                freq: freq_from_bytes(&payload[1..4]),
                max_dr: payload[4] >> 4,
                min_dr: payload[4] & 0x0F,
            },
            CommandIdentifier::RXTimingSetup => MacCommand::RXTimingSetupReq {
                delay: payload[0] & 0x0F,
            },
            CommandIdentifier::TxParamSetup => MacCommand::TxParamSetupReq {
                downlink_dwell_time: (payload[0] & 0x20) != 0,
                uplink_dwell_time: (payload[0] & 0x10) != 0,
                max_eirp: payload[0] & 0x0F,
            },
            CommandIdentifier::DlChannel => MacCommand::DlChannelReq {
                ch_index: payload[0],
                freq: freq_from_bytes(&payload[1..4]),
            },
        })
    }

    /// Command identifier
    pub fn cid(&self) -> u8 {
        let id = match self {
            MacCommand::LinkCheckReq | MacCommand::LinkCheckAns { .. } => CommandIdentifier::LinkCheck,
            MacCommand::LinkADRReq { .. } | MacCommand::LinkADRAns { .. } => CommandIdentifier::LinkADR,
            MacCommand::DutyCycleReq { .. } | MacCommand::DutyCycleAns => CommandIdentifier::DutyCycle,
            MacCommand::RXParamSetupReq { .. } | MacCommand::RXParamSetupAns { .. } => CommandIdentifier::RXParamSetup,
            MacCommand::DevStatusReq | MacCommand::DevStatusAns { .. } => CommandIdentifier::DevStatus,
            MacCommand::NewChannelReq { .. } | MacCommand::NewChannelAns { .. } => CommandIdentifier::NewChannel,
            MacCommand::RXTimingSetupReq { .. } | MacCommand::RXTimingSetupAns => CommandIdentifier::RXTimingSetup,
            MacCommand::TxParamSetupReq { .. } => CommandIdentifier::TxParamSetup,
            MacCommand::DlChannelReq { .. } => CommandIdentifier::DlChannel,
        };
        id as u8
    }

    /// Append the device-to-network form of this command to `out`
    ///
    /// Only requests and answers a device sends can be encoded.
    pub fn encode(&self, out: &mut Vec<u8, MAX_FOPTS>) -> Result<(), MacError> {
        let mut buf: Vec<u8, 3> = Vec::new();
        let push = |buf: &mut Vec<u8, 3>, byte: u8| buf.push(byte).map_err(|_| MacError::BufferTooSmall);

        push(&mut buf, self.cid())?;
        match self {
            MacCommand::LinkCheckReq | MacCommand::DutyCycleAns | MacCommand::RXTimingSetupAns => {}
            MacCommand::LinkADRAns {
                power_ack,
                data_rate_ack,
                channel_mask_ack,
            } => push(
                &mut buf,
                (u8::from(*power_ack) << 2) | (u8::from(*data_rate_ack) << 1) | u8::from(*channel_mask_ack),
            )?,
            MacCommand::RXParamSetupAns {
                rx1_dr_offset_ack,
                rx2_data_rate_ack,
                channel_ack,
            } => push(
                &mut buf,
                (u8::from(*rx1_dr_offset_ack) << 2) | (u8::from(*rx2_data_rate_ack) << 1) | u8::from(*channel_ack),
            )?,
            MacCommand::DevStatusAns { battery, margin } => {
                push(&mut buf, *battery)?;
                push(&mut buf, ((*margin).clamp(-32, 31) & 0x3F) as u8)?;
            }
            MacCommand::NewChannelAns {
                channel_freq_ok,
                data_rate_ok,
            } => push(&mut buf, (u8::from(*data_rate_ok) << 1) | u8::from(*channel_freq_ok))?,
            _ => return Err(MacError::InvalidValue),
        }

        out.extend_from_slice(&buf).map_err(|_| MacError::BufferTooSmall)
    }
}

/// Iterator over the commands packed into FOpts or a port-0 payload
///
/// Stops after the first unknown or truncated command; the remainder of the
/// buffer cannot be framed once a length is unknown.
pub struct DownlinkCommands<'a> {
    data: &'a [u8],
    failed: bool,
}

impl<'a> DownlinkCommands<'a> {
    /// Iterate the commands in `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, failed: false }
    }
}

impl Iterator for DownlinkCommands<'_> {
    type Item = Result<MacCommand, MacError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let (&cid, rest) = self.data.split_first()?;
        let result = match CommandIdentifier::from_byte(cid) {
            None => Err(MacError::UnknownCommand(cid)),
            Some(id) if rest.len() < id.downlink_len() => Err(MacError::InvalidFrame),
            Some(id) => {
                let (payload, tail) = rest.split_at(id.downlink_len());
                self.data = tail;
                MacCommand::from_bytes(cid, payload).ok_or(MacError::InvalidFrame)
            }
        };
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}
