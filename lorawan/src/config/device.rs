use core::fmt;

use crate::error::Error;

/// Marker inserted between the OUI and the NIC half of a MAC address to form an EUI-64
const EUI48_MARKER: [u8; 2] = [0xFF, 0xFE];

/// EUI-64 identifier, stored most significant byte first (the order it is written in)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EUI64([u8; 8]);

impl EUI64 {
    /// Create from big-endian bytes
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Parse 16 hexadecimal characters
    pub fn from_hex(text: &str) -> Result<Self, Error> {
        parse_hex(text, "EUI").map(Self)
    }

    /// Expand a 48-bit hardware address by inserting `FFFE` at its midpoint
    ///
    /// `A0:B1:C2:01:02:03` becomes `A0B1C2FFFE010203`.
    pub fn from_hardware_address(mac: [u8; 6]) -> Self {
        let mut eui = [0u8; 8];
        eui[..3].copy_from_slice(&mac[..3]);
        eui[3..5].copy_from_slice(&EUI48_MARKER);
        eui[5..].copy_from_slice(&mac[3..]);
        Self(eui)
    }

    /// Big-endian bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Bytes in over-the-air (little-endian) order
    pub fn to_le_bytes(&self) -> [u8; 8] {
        let mut le = self.0;
        le.reverse();
        le
    }
}

impl fmt::Display for EUI64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for EUI64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EUI64({})", self)
    }
}

/// AES-128 key
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AESKey([u8; 16]);

impl AESKey {
    /// Create from raw bytes
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse 32 hexadecimal characters
    pub fn from_hex(text: &str) -> Result<Self, Error> {
        parse_hex(text, "AppKey").map(Self)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for AESKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AESKey(..)")
    }
}

/// Device address assigned by the network at join
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevAddr(u32);

impl DevAddr {
    /// Create from the numeric address
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Decode from over-the-air order
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }

    /// Encode in over-the-air order
    pub fn to_le_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Numeric address
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl fmt::Debug for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevAddr({:08X})", self.0)
    }
}

fn parse_hex<const N: usize>(text: &str, field: &'static str) -> Result<[u8; N], Error> {
    let mut out = [0u8; N];
    hex::decode_to_slice(text, &mut out).map_err(|_| Error::InvalidCredential(field))?;
    Ok(out)
}

/// Credentials needed for over-the-air activation
///
/// A value of this type is always complete: partial sets are
/// represented by its absence.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeviceIdentity {
    /// Device EUI
    pub dev_eui: EUI64,
    /// AppEUI / JoinEUI
    pub app_eui: EUI64,
    /// Root key for OTAA
    pub app_key: AESKey,
}

impl DeviceIdentity {
    /// Create from already decoded values
    pub fn new(dev_eui: EUI64, app_eui: EUI64, app_key: AESKey) -> Self {
        Self {
            dev_eui,
            app_eui,
            app_key,
        }
    }

    /// Parse the three fixed-length hexadecimal strings (16, 16 and 32 characters)
    pub fn from_hex(dev_eui: &str, app_eui: &str, app_key: &str) -> Result<Self, Error> {
        Ok(Self {
            dev_eui: parse_hex(dev_eui, "DevEUI").map(EUI64)?,
            app_eui: parse_hex(app_eui, "AppEUI").map(EUI64)?,
            app_key: AESKey::from_hex(app_key)?,
        })
    }

    /// Build an identity whose DevEUI is derived from a hardware address
    pub fn from_hardware_address(mac: [u8; 6], app_eui: &str, app_key: &str) -> Result<Self, Error> {
        Ok(Self {
            dev_eui: EUI64::from_hardware_address(mac),
            app_eui: parse_hex(app_eui, "AppEUI").map(EUI64)?,
            app_key: AESKey::from_hex(app_key)?,
        })
    }
}

/// Session context derived by a successful join
///
/// Volatile: it is not persisted and is dropped by a reset.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Device address (assigned during activation)
    pub dev_addr: DevAddr,
    /// Network session key
    pub nwk_skey: AESKey,
    /// Application session key
    pub app_skey: AESKey,
    /// Network identifier from the join-accept
    pub net_id: [u8; 3],
    /// Next uplink frame counter
    pub fcnt_up: u32,
    /// Next acceptable downlink frame counter
    pub fcnt_down: u32,
}

impl SessionState {
    /// Create a fresh session with zeroed frame counters
    pub fn new(dev_addr: DevAddr, nwk_skey: AESKey, app_skey: AESKey, net_id: [u8; 3]) -> Self {
        Self {
            dev_addr,
            nwk_skey,
            app_skey,
            net_id,
            fcnt_up: 0,
            fcnt_down: 0,
        }
    }

    /// Increment the uplink frame counter
    pub fn increment_fcnt_up(&mut self) {
        self.fcnt_up = self.fcnt_up.wrapping_add(1);
    }

    /// Reconstruct the full downlink counter from its 16 transmitted bits
    pub fn expand_fcnt_down(&self, fcnt16: u16) -> u32 {
        let mut candidate = (self.fcnt_down & 0xFFFF_0000) | u32::from(fcnt16);
        if candidate < self.fcnt_down {
            candidate = candidate.wrapping_add(0x1_0000);
        }
        candidate
    }

    /// Record an accepted downlink counter
    pub fn accept_fcnt_down(&mut self, fcnt: u32) {
        self.fcnt_down = fcnt.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eui_from_hardware_address() {
        let eui = EUI64::from_hardware_address([0xA0, 0xB1, 0xC2, 0x01, 0x02, 0x03]);
        assert_eq!(eui.to_string(), "A0B1C2FFFE010203");
    }

    #[test]
    fn eui_wire_order_is_reversed() {
        let eui = EUI64::from_hex("0011223344556677").unwrap();
        assert_eq!(eui.to_le_bytes(), [0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00]);
    }

    #[test]
    fn identity_rejects_bad_text() {
        let key = "000102030405060708090A0B0C0D0E0F";
        assert!(DeviceIdentity::from_hex("0011223344556677", "70B3D57ED0000000", key).is_ok());
        assert_eq!(
            DeviceIdentity::from_hex("001122334455667", "70B3D57ED0000000", key),
            Err(Error::InvalidCredential("DevEUI"))
        );
        assert_eq!(
            DeviceIdentity::from_hex("0011223344556677", "70B3D57ED000000G", key),
            Err(Error::InvalidCredential("AppEUI"))
        );
        assert_eq!(
            DeviceIdentity::from_hex("0011223344556677", "70B3D57ED0000000", &key[..30]),
            Err(Error::InvalidCredential("AppKey"))
        );
    }

    #[test]
    fn key_debug_is_redacted() {
        let key = AESKey::new([0xAB; 16]);
        assert_eq!(format!("{:?}", key), "AESKey(..)");
    }

    #[test]
    fn downlink_counter_rolls_over_16_bits() {
        let mut session = SessionState::new(DevAddr::new(1), AESKey::default(), AESKey::default(), [0; 3]);
        assert_eq!(session.expand_fcnt_down(5), 5);
        session.accept_fcnt_down(0xFFFF);
        assert_eq!(session.fcnt_down, 0x1_0000);
        assert_eq!(session.expand_fcnt_down(0x0002), 0x1_0002);
        // A counter below the expected one wraps into the next epoch
        session.accept_fcnt_down(0x1_0010);
        assert_eq!(session.expand_fcnt_down(0x0005), 0x2_0005);
    }
}
