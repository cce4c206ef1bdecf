//! LoRaWAN 1.0.x frame codec
//!
//! Encodes and decodes the PHYPayloads the core exchanges: join-request,
//! join-accept and data frames in both directions. Decoding verifies the MIC
//! before anything else is trusted.

use heapless::Vec;

use super::commands::MAX_FOPTS;
use super::mac::MacError;
use super::phy::MAX_PHY_PAYLOAD;
use crate::config::device::{AESKey, DevAddr, EUI64};
use crate::crypto::{self, Direction, MIC_SIZE};

/// PHY payload buffer
pub type FrameBuffer = Vec<u8, MAX_PHY_PAYLOAD>;

/// Join-request length: MHDR + AppEUI + DevEUI + DevNonce + MIC
pub const JOIN_REQUEST_LEN: usize = 1 + 8 + 8 + 2 + MIC_SIZE;

/// Shortest data frame: MHDR + DevAddr + FCtrl + FCnt + MIC
const MIN_DATA_FRAME: usize = 1 + 4 + 1 + 2 + MIC_SIZE;

/// Major version bits of MHDR (LoRaWAN R1)
const MAJOR_R1: u8 = 0x00;

/// MAC header types
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum MType {
    /// Join-request (uplink)
    JoinRequest = 0x00,
    /// Join-accept (downlink)
    JoinAccept = 0x20,
    /// Uplink without acknowledgement
    UnconfirmedDataUp = 0x40,
    /// Downlink without acknowledgement
    UnconfirmedDataDown = 0x60,
    /// Uplink the network must acknowledge
    ConfirmedDataUp = 0x80,
    /// Downlink the device must acknowledge
    ConfirmedDataDown = 0xA0,
    /// Rejoin-request (LoRaWAN 1.1, never sent here)
    RejoinRequest = 0xC0,
    /// Non-standard frame
    Proprietary = 0xE0,
}

impl MType {
    /// Message type of an MHDR byte
    pub fn from_mhdr(mhdr: u8) -> Self {
        match mhdr & 0xE0 {
            0x00 => MType::JoinRequest,
            0x20 => MType::JoinAccept,
            0x40 => MType::UnconfirmedDataUp,
            0x60 => MType::UnconfirmedDataDown,
            0x80 => MType::ConfirmedDataUp,
            0xA0 => MType::ConfirmedDataDown,
            0xC0 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }

    fn mhdr(self) -> u8 {
        self as u8 | MAJOR_R1
    }

    /// Direction of a data frame type
    pub fn direction(self) -> Option<Direction> {
        match self {
            MType::UnconfirmedDataUp | MType::ConfirmedDataUp => Some(Direction::Up),
            MType::UnconfirmedDataDown | MType::ConfirmedDataDown => Some(Direction::Down),
            _ => None,
        }
    }

    /// Whether the frame asks for an acknowledgement
    pub fn is_confirmed(self) -> bool {
        matches!(self, MType::ConfirmedDataUp | MType::ConfirmedDataDown)
    }
}

/// Frame header flags
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FCtrl {
    /// ADR enabled (uplink) / ADR supported by the network (downlink)
    pub adr: bool,
    /// Uplink asks the network to prove the link (uplink only)
    pub adr_ack_req: bool,
    /// Acknowledges the last confirmed frame of the other side
    pub ack: bool,
    /// The network has more data pending (downlink only)
    pub f_pending: bool,
}

impl FCtrl {
    fn to_byte(self, f_opts_len: usize) -> u8 {
        let mut byte = (f_opts_len as u8) & 0x0F;
        if self.adr {
            byte |= 0x80;
        }
        if self.adr_ack_req {
            byte |= 0x40;
        }
        if self.ack {
            byte |= 0x20;
        }
        if self.f_pending {
            byte |= 0x10;
        }
        byte
    }

    fn from_byte(byte: u8) -> (Self, usize) {
        let fctrl = Self {
            adr: (byte & 0x80) != 0,
            adr_ack_req: (byte & 0x40) != 0,
            ack: (byte & 0x20) != 0,
            f_pending: (byte & 0x10) != 0,
        };
        (fctrl, usize::from(byte & 0x0F))
    }
}

/// Join-request fields
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinRequest {
    /// Application (join server) identifier
    pub app_eui: EUI64,
    /// Device identifier
    pub dev_eui: EUI64,
    /// Random nonce, never reused by the network
    pub dev_nonce: u16,
}

impl JoinRequest {
    /// Serialize and sign with the AppKey
    pub fn encode(&self, app_key: &AESKey) -> Vec<u8, JOIN_REQUEST_LEN> {
        let mut frame = [0u8; JOIN_REQUEST_LEN];
        frame[0] = MType::JoinRequest.mhdr();
        frame[1..9].copy_from_slice(&self.app_eui.to_le_bytes());
        frame[9..17].copy_from_slice(&self.dev_eui.to_le_bytes());
        frame[17..19].copy_from_slice(&self.dev_nonce.to_le_bytes());
        let mic = crypto::compute_join_mic(app_key, &frame[..19]);
        frame[19..].copy_from_slice(&mic);
        // Exactly JOIN_REQUEST_LEN bytes
        Vec::from_slice(&frame).unwrap_or_default()
    }

    /// Parse and verify a join-request (network side)
    pub fn decode(app_key: &AESKey, frame: &[u8]) -> Result<Self, MacError> {
        if frame.len() != JOIN_REQUEST_LEN || MType::from_mhdr(frame[0]) != MType::JoinRequest {
            return Err(MacError::InvalidFrame);
        }
        if crypto::compute_join_mic(app_key, &frame[..19]) != frame[19..] {
            return Err(MacError::InvalidMic);
        }
        let eui = |raw: &[u8]| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(raw);
            bytes.reverse();
            EUI64::new(bytes)
        };
        Ok(Self {
            app_eui: eui(&frame[1..9]),
            dev_eui: eui(&frame[9..17]),
            dev_nonce: u16::from_le_bytes([frame[17], frame[18]]),
        })
    }
}

/// Join-accept fields
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinAccept {
    /// Join server nonce
    pub app_nonce: [u8; 3],
    /// Network identifier
    pub net_id: [u8; 3],
    /// Assigned device address
    pub dev_addr: DevAddr,
    /// RX1 data-rate offset (bits 6..4) and RX2 data rate (bits 3..0)
    pub dl_settings: u8,
    /// RX1 delay in seconds (0 means 1)
    pub rx_delay: u8,
    /// Optional channel list
    pub cf_list: Option<[u8; 16]>,
}

impl JoinAccept {
    /// RX1 data-rate offset
    pub fn rx1_dr_offset(&self) -> u8 {
        (self.dl_settings >> 4) & 0x07
    }

    /// RX2 data rate
    pub fn rx2_data_rate(&self) -> u8 {
        self.dl_settings & 0x0F
    }

    /// Decrypt, verify and parse a join-accept (device side)
    pub fn decode(app_key: &AESKey, frame: &[u8]) -> Result<Self, MacError> {
        let body_len = frame.len().checked_sub(1).ok_or(MacError::InvalidFrame)?;
        if (body_len != 16 && body_len != 32) || MType::from_mhdr(frame[0]) != MType::JoinAccept {
            return Err(MacError::InvalidFrame);
        }

        let mut plain = [0u8; 33];
        plain[0] = frame[0];
        plain[1..frame.len()].copy_from_slice(&frame[1..]);
        crypto::decrypt_join_accept(app_key, &mut plain[1..frame.len()]);

        let mic_at = frame.len() - MIC_SIZE;
        if crypto::compute_join_mic(app_key, &plain[..mic_at]) != plain[mic_at..frame.len()] {
            return Err(MacError::InvalidMic);
        }

        let p = &plain[1..mic_at];
        let cf_list = (p.len() == 28).then(|| {
            let mut list = [0u8; 16];
            list.copy_from_slice(&p[12..28]);
            list
        });
        Ok(Self {
            app_nonce: [p[0], p[1], p[2]],
            net_id: [p[3], p[4], p[5]],
            dev_addr: DevAddr::from_le_bytes([p[6], p[7], p[8], p[9]]),
            dl_settings: p[10],
            rx_delay: p[11] & 0x0F,
            cf_list,
        })
    }

    /// Serialize, sign and encrypt a join-accept (network side)
    pub fn encode(&self, app_key: &AESKey) -> Vec<u8, 33> {
        let mut frame: Vec<u8, 33> = Vec::new();
        let mut fields = [0u8; 28];
        fields[..3].copy_from_slice(&self.app_nonce);
        fields[3..6].copy_from_slice(&self.net_id);
        fields[6..10].copy_from_slice(&self.dev_addr.to_le_bytes());
        fields[10] = self.dl_settings;
        fields[11] = self.rx_delay;
        let len = match &self.cf_list {
            Some(list) => {
                fields[12..].copy_from_slice(list);
                28
            }
            None => 12,
        };

        // Capacity 33 covers MHDR + 28 + MIC
        let _ = frame.push(MType::JoinAccept.mhdr());
        let _ = frame.extend_from_slice(&fields[..len]);
        let mic = crypto::compute_join_mic(app_key, &frame);
        let _ = frame.extend_from_slice(&mic);
        crypto::encrypt_join_accept(app_key, &mut frame[1..]);
        frame
    }
}

/// Data frame in either direction
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    /// Message type (one of the four data types)
    pub mtype: MType,
    /// Device address
    pub dev_addr: DevAddr,
    /// Frame control flags
    pub fctrl: FCtrl,
    /// Full 32-bit frame counter (16 bits travel on air)
    pub fcnt: u32,
    /// Piggybacked MAC commands
    pub f_opts: Vec<u8, MAX_FOPTS>,
    /// Port, absent for frames that only carry FOpts
    pub port: Option<u8>,
    /// Plaintext FRMPayload
    pub payload: FrameBuffer,
}

impl DataFrame {
    fn direction(&self) -> Result<Direction, MacError> {
        self.mtype.direction().ok_or(MacError::InvalidFrame)
    }

    /// Device address of a data frame without verifying it
    pub fn peek_dev_addr(frame: &[u8]) -> Option<DevAddr> {
        (frame.len() >= MIN_DATA_FRAME).then(|| DevAddr::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]))
    }

    /// Serialize, encrypt and sign
    pub fn encode(&self, nwk_skey: &AESKey, app_skey: &AESKey) -> Result<FrameBuffer, MacError> {
        let dir = self.direction()?;
        if self.port == Some(0) && !self.f_opts.is_empty() {
            return Err(MacError::InvalidFrame);
        }

        let mut frame = FrameBuffer::new();
        let overflow = |_| MacError::BufferTooSmall;
        frame.push(self.mtype.mhdr()).map_err(overflow)?;
        frame.extend_from_slice(&self.dev_addr.to_le_bytes()).map_err(|_| MacError::BufferTooSmall)?;
        frame.push(self.fctrl.to_byte(self.f_opts.len())).map_err(overflow)?;
        frame.extend_from_slice(&(self.fcnt as u16).to_le_bytes()).map_err(|_| MacError::BufferTooSmall)?;
        frame.extend_from_slice(&self.f_opts).map_err(|_| MacError::BufferTooSmall)?;

        if let Some(port) = self.port {
            frame.push(port).map_err(overflow)?;
            let start = frame.len();
            frame.extend_from_slice(&self.payload).map_err(|_| MacError::BufferTooSmall)?;
            let key = if port == 0 { nwk_skey } else { app_skey };
            crypto::crypt_payload(key, self.dev_addr, self.fcnt, dir, &mut frame[start..]);
        } else if !self.payload.is_empty() {
            return Err(MacError::InvalidFrame);
        }

        let mic = crypto::compute_mic(nwk_skey, &frame, self.dev_addr, self.fcnt, dir);
        frame.extend_from_slice(&mic).map_err(|_| MacError::BufferTooSmall)?;
        Ok(frame)
    }

    /// Verify, parse and decrypt
    ///
    /// `expand_fcnt` rebuilds the full frame counter from its 16 transmitted
    /// bits; a replayed counter expands to a value the MIC does not match.
    pub fn decode(
        frame: &[u8],
        nwk_skey: &AESKey,
        app_skey: &AESKey,
        expand_fcnt: impl FnOnce(u16) -> u32,
    ) -> Result<Self, MacError> {
        if frame.len() < MIN_DATA_FRAME {
            return Err(MacError::InvalidFrame);
        }
        let mtype = MType::from_mhdr(frame[0]);
        let dir = mtype.direction().ok_or(MacError::InvalidFrame)?;

        let dev_addr = DevAddr::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let (fctrl, f_opts_len) = FCtrl::from_byte(frame[5]);
        let fcnt = expand_fcnt(u16::from_le_bytes([frame[6], frame[7]]));

        let mic_at = frame.len() - MIC_SIZE;
        let opts_end = 8 + f_opts_len;
        if opts_end > mic_at {
            return Err(MacError::InvalidFrame);
        }
        if crypto::compute_mic(nwk_skey, &frame[..mic_at], dev_addr, fcnt, dir) != frame[mic_at..] {
            return Err(MacError::InvalidMic);
        }

        let f_opts = Vec::from_slice(&frame[8..opts_end]).map_err(|_| MacError::InvalidFrame)?;
        let (port, payload) = if opts_end < mic_at {
            let port = frame[opts_end];
            if port == 0 && f_opts_len > 0 {
                return Err(MacError::InvalidFrame);
            }
            let mut payload = FrameBuffer::from_slice(&frame[opts_end + 1..mic_at]).map_err(|_| MacError::InvalidFrame)?;
            let key = if port == 0 { nwk_skey } else { app_skey };
            crypto::crypt_payload(key, dev_addr, fcnt, dir, &mut payload);
            (Some(port), payload)
        } else {
            (None, FrameBuffer::new())
        };

        Ok(Self {
            mtype,
            dev_addr,
            fctrl,
            fcnt,
            f_opts,
            port,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> (AESKey, AESKey) {
        (AESKey::new([0x11; 16]), AESKey::new([0x22; 16]))
    }

    fn uplink() -> DataFrame {
        DataFrame {
            mtype: MType::ConfirmedDataUp,
            dev_addr: DevAddr::new(0x2601_1F2A),
            fctrl: FCtrl {
                adr: true,
                ..FCtrl::default()
            },
            fcnt: 0x0001_0005,
            f_opts: Vec::from_slice(&[0x06, 0xFF, 0x0A]).unwrap(),
            port: Some(10),
            payload: FrameBuffer::from_slice(b"hello").unwrap(),
        }
    }

    #[test]
    fn data_frame_layout() {
        let (nwk, app) = keys();
        let frame = uplink().encode(&nwk, &app).unwrap();
        assert_eq!(frame[0], 0x80);
        assert_eq!(&frame[1..5], &[0x2A, 0x1F, 0x01, 0x26]);
        assert_eq!(frame[5], 0x83);
        assert_eq!(&frame[6..8], &[0x05, 0x00]);
        assert_eq!(frame[11], 10);
        assert_ne!(&frame[12..17], b"hello");
        assert_eq!(frame.len(), 1 + 4 + 1 + 2 + 3 + 1 + 5 + 4);
    }

    #[test]
    fn data_frame_decodes_with_full_counter() {
        let (nwk, app) = keys();
        let original = uplink();
        let frame = original.encode(&nwk, &app).unwrap();
        let decoded = DataFrame::decode(&frame, &nwk, &app, |low| 0x0001_0000 | u32::from(low)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn wrong_counter_epoch_fails_mic() {
        let (nwk, app) = keys();
        let frame = uplink().encode(&nwk, &app).unwrap();
        let result = DataFrame::decode(&frame, &nwk, &app, u32::from);
        assert_eq!(result, Err(MacError::InvalidMic));
    }

    #[test]
    fn tampered_frame_fails_mic() {
        let (nwk, app) = keys();
        let mut frame = uplink().encode(&nwk, &app).unwrap();
        frame[13] ^= 0x01;
        let result = DataFrame::decode(&frame, &nwk, &app, |low| 0x0001_0000 | u32::from(low));
        assert_eq!(result, Err(MacError::InvalidMic));
    }

    #[test]
    fn short_frame_is_invalid() {
        let (nwk, app) = keys();
        assert_eq!(DataFrame::decode(&[0x60; 8], &nwk, &app, u32::from), Err(MacError::InvalidFrame));
    }

    #[test]
    fn join_request_layout() {
        let key = AESKey::new([0x33; 16]);
        let request = JoinRequest {
            app_eui: EUI64::new([0x70, 0xB3, 0xD5, 0x7E, 0xD0, 0x00, 0x00, 0x01]),
            dev_eui: EUI64::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]),
            dev_nonce: 0xBEEF,
        };
        let frame = request.encode(&key);
        assert_eq!(frame.len(), JOIN_REQUEST_LEN);
        assert_eq!(frame[0], 0x00);
        assert_eq!(frame[1], 0x01);
        assert_eq!(frame[8], 0x70);
        assert_eq!(&frame[17..19], &[0xEF, 0xBE]);
        assert_eq!(JoinRequest::decode(&key, &frame), Ok(request));
    }

    #[test]
    fn join_accept_with_cf_list() {
        let key = AESKey::new([0x44; 16]);
        let accept = JoinAccept {
            app_nonce: [1, 2, 3],
            net_id: [0x13, 0, 0],
            dev_addr: DevAddr::new(0x2601_0001),
            dl_settings: 0x21,
            rx_delay: 1,
            cf_list: Some([0x18, 0x4F, 0x84, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
        };
        let frame = accept.encode(&key);
        assert_eq!(frame.len(), 33);
        let decoded = JoinAccept::decode(&key, &frame).unwrap();
        assert_eq!(decoded, accept);
        assert_eq!(decoded.rx1_dr_offset(), 2);
        assert_eq!(decoded.rx2_data_rate(), 1);
    }

    #[test]
    fn join_accept_under_wrong_key_is_rejected() {
        let accept = JoinAccept {
            app_nonce: [1, 2, 3],
            net_id: [0, 0, 0],
            dev_addr: DevAddr::new(1),
            dl_settings: 0,
            rx_delay: 0,
            cf_list: None,
        };
        let frame = accept.encode(&AESKey::new([0x44; 16]));
        assert_eq!(frame.len(), 17);
        assert_eq!(JoinAccept::decode(&AESKey::new([0x45; 16]), &frame), Err(MacError::InvalidMic));
        assert_eq!(JoinAccept::decode(&AESKey::new([0x45; 16]), &frame[..10]), Err(MacError::InvalidFrame));
    }
}
