/// Pin value meaning "not wired"
pub const NOT_CONNECTED: u8 = 0xFF;

/// Bus and GPIO wiring of the radio chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinConfig {
    /// SPI bus / peripheral identifier
    pub spi_host: u8,
    /// Chip select (NSS)
    pub nss: u8,
    /// RX/TX antenna switch, or [`NOT_CONNECTED`]
    pub rxtx: u8,
    /// Reset line, or [`NOT_CONNECTED`]
    pub rst: u8,
    /// DIO0 interrupt line
    pub dio0: u8,
    /// DIO1 interrupt line
    pub dio1: u8,
}

/// Radio modulation parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModulationParams {
    /// Spreading factor (SF7-SF12)
    pub spreading_factor: u8,
    /// Bandwidth in Hz
    pub bandwidth: u32,
    /// Coding rate denominator offset (1 = 4/5 .. 4 = 4/8)
    pub coding_rate: u8,
}

/// Radio transmission parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxConfig {
    /// Transmission power in dBm
    pub power: i8,
    /// Frequency in Hz
    pub frequency: u32,
    /// Modulation parameters
    pub modulation: ModulationParams,
}

/// Radio receive parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RxConfig {
    /// Frequency in Hz
    pub frequency: u32,
    /// Modulation parameters
    pub modulation: ModulationParams,
    /// Receive timeout in milliseconds
    pub timeout_ms: u32,
}

/// Signal quality of a received packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxQuality {
    /// RSSI in dBm
    pub rssi: i16,
    /// SNR in dB
    pub snr: i8,
}

/// Possible errors in radio operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RadioError {
    /// SPI transfer error
    #[error("SPI transfer failed")]
    Spi,
    /// GPIO error
    #[error("GPIO failure")]
    Gpio,
    /// Invalid configuration
    #[error("invalid radio configuration")]
    Config,
    /// Radio hardware error
    #[error("radio hardware fault")]
    Hardware,
    /// Operation timeout
    #[error("radio operation timed out")]
    Timeout,
    /// Listen-before-talk found the channel occupied
    #[error("channel busy")]
    ChannelBusy,
}

/// Radio driver contract
///
/// Transmission and reception are started with one call and completed by
/// polling, which is how an interrupt-driven driver surfaces its DIO
/// events: the poll returns `WouldBlock` until the interrupt has fired.
pub trait Radio: Send + 'static {
    /// Identifier of the physical transceiver, unique per process
    fn hardware_id(&self) -> u64;

    /// Wire the driver to its bus and interrupt lines
    fn configure(&mut self, pins: &PinConfig) -> Result<(), RadioError>;

    /// Start transmitting `buffer`
    fn transmit(&mut self, config: TxConfig, buffer: &[u8]) -> Result<(), RadioError>;

    /// Poll for the end of the transmission; yields the airtime in milliseconds
    fn poll_transmit(&mut self) -> nb::Result<u32, RadioError>;

    /// Open a receive window
    fn receive(&mut self, config: RxConfig) -> Result<(), RadioError>;

    /// Poll the open window
    ///
    /// Yields `Some((len, quality))` when a packet was written to `buffer`,
    /// `None` when the window closed without one.
    fn poll_receive(&mut self, buffer: &mut [u8]) -> nb::Result<Option<(usize, RxQuality)>, RadioError>;

    /// Instantaneous channel RSSI in dBm, for listen-before-talk
    fn channel_rssi(&mut self, frequency: u32) -> Result<i16, RadioError>;

    /// Put the radio into sleep mode
    fn sleep(&mut self) -> Result<(), RadioError>;
}
