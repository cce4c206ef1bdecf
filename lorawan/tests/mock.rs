//! Test doubles: a scripted radio, a virtual clock and a network server
//! speaking real LoRaWAN 1.0.x crypto.

#![allow(dead_code)]

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use heapless::Vec as HVec;
use lorawan_node::config::device::{AESKey, DevAddr, DeviceIdentity};
use lorawan_node::crypto::derive_session_keys;
use lorawan_node::lorawan::frame::{DataFrame, FCtrl, FrameBuffer, JoinAccept, JoinRequest, MType};
use lorawan_node::lorawan::phy::time_on_air;
use lorawan_node::radio::traits::{PinConfig, Radio, RadioError, RxConfig, RxQuality, TxConfig};
use lorawan_node::storage::{KeyValueStore, MemoryStore, StorageError};
use lorawan_node::timer::Clock;
use lorawan_node::WindowId;
use parking_lot::Mutex;

pub const DEV_EUI: &str = "0011223344556677";
pub const APP_EUI: &str = "70B3D57ED0000001";
pub const APP_KEY: &str = "000102030405060708090A0B0C0D0E0F";

pub const PINS: PinConfig = PinConfig {
    spi_host: 1,
    nss: 18,
    rxtx: 0xFF,
    rst: 14,
    dio0: 26,
    dio1: 33,
};

pub fn identity() -> DeviceIdentity {
    DeviceIdentity::from_hex(DEV_EUI, APP_EUI, APP_KEY).unwrap()
}

/// Virtual time: sleeping advances it instantly
#[derive(Default)]
pub struct MockClock {
    now: Mutex<Duration>,
}

impl MockClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for MockClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// One uplink as the radio saw it
#[derive(Debug, Clone)]
pub struct Transmission {
    pub at: Duration,
    pub airtime: Duration,
    pub config: TxConfig,
    pub frame: Vec<u8>,
    /// What the device reported as its current window while transmitting
    pub window: Option<WindowId>,
}

/// One receive window as the radio saw it
#[derive(Debug, Clone)]
pub struct Window {
    pub id: WindowId,
    pub at: Duration,
    pub config: RxConfig,
    pub reported: Option<WindowId>,
}

pub type Responder = Box<dyn FnMut(&[u8], WindowId) -> Option<Vec<u8>> + Send>;
pub type Probe = Box<dyn Fn() -> Option<WindowId> + Send>;

struct State {
    transmissions: Vec<Transmission>,
    windows: Vec<Window>,
    configured: Vec<PinConfig>,
    sleeping: bool,
    channel_rssi: i16,
    quality: RxQuality,
    fail_next: Option<RadioError>,
    responder: Option<Responder>,
    probe: Option<Probe>,
}

/// Inspection and scripting side of a [`MockRadio`]
#[derive(Clone)]
pub struct RadioHandle {
    state: Arc<Mutex<State>>,
}

impl RadioHandle {
    pub fn transmissions(&self) -> Vec<Transmission> {
        self.state.lock().transmissions.clone()
    }

    pub fn tx_count(&self) -> usize {
        self.state.lock().transmissions.len()
    }

    pub fn windows(&self) -> Vec<Window> {
        self.state.lock().windows.clone()
    }

    pub fn configured(&self) -> Vec<PinConfig> {
        self.state.lock().configured.clone()
    }

    pub fn is_sleeping(&self) -> bool {
        self.state.lock().sleeping
    }

    pub fn set_channel_rssi(&self, rssi: i16) {
        self.state.lock().channel_rssi = rssi;
    }

    pub fn set_quality(&self, quality: RxQuality) {
        self.state.lock().quality = quality;
    }

    pub fn fail_next_transmit(&self, error: RadioError) {
        self.state.lock().fail_next = Some(error);
    }

    pub fn respond_with(&self, responder: impl FnMut(&[u8], WindowId) -> Option<Vec<u8>> + Send + 'static) {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Attach a network server
    pub fn connect(&self, server: &Arc<Mutex<NetworkServer>>) {
        let server = Arc::clone(server);
        self.respond_with(move |frame, window| server.lock().handle(frame, window));
    }

    /// Sample the device's reported window at every radio operation
    pub fn probe(&self, probe: impl Fn() -> Option<WindowId> + Send + 'static) {
        self.state.lock().probe = Some(Box::new(probe));
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Radio that completes instantly in virtual time
pub struct MockRadio {
    id: u64,
    clock: Arc<MockClock>,
    state: Arc<Mutex<State>>,
    last_frame: Vec<u8>,
    windows_since_tx: u8,
    pending_tx: Option<u32>,
    pending_rx: Option<(Option<Vec<u8>>, RxConfig)>,
}

impl MockRadio {
    pub fn new(clock: &Arc<MockClock>) -> (Self, RadioHandle) {
        Self::with_id(NEXT_ID.fetch_add(1, Ordering::Relaxed), clock)
    }

    pub fn with_id(id: u64, clock: &Arc<MockClock>) -> (Self, RadioHandle) {
        let state = Arc::new(Mutex::new(State {
            transmissions: Vec::new(),
            windows: Vec::new(),
            configured: Vec::new(),
            sleeping: false,
            channel_rssi: -120,
            quality: RxQuality { rssi: -60, snr: 9 },
            fail_next: None,
            responder: None,
            probe: None,
        }));
        let radio = Self {
            id,
            clock: Arc::clone(clock),
            state: Arc::clone(&state),
            last_frame: Vec::new(),
            windows_since_tx: 0,
            pending_tx: None,
            pending_rx: None,
        };
        (radio, RadioHandle { state })
    }
}

impl Radio for MockRadio {
    fn hardware_id(&self) -> u64 {
        self.id
    }

    fn configure(&mut self, pins: &PinConfig) -> Result<(), RadioError> {
        let mut state = self.state.lock();
        state.configured.push(*pins);
        state.sleeping = false;
        Ok(())
    }

    fn transmit(&mut self, config: TxConfig, buffer: &[u8]) -> Result<(), RadioError> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_next.take() {
            return Err(error);
        }
        let airtime = time_on_air(&config.modulation, buffer.len());
        let window = state.probe.as_ref().and_then(|probe| probe());
        state.transmissions.push(Transmission {
            at: self.clock.now(),
            airtime: Duration::from_millis(u64::from(airtime)),
            config,
            frame: buffer.to_vec(),
            window,
        });
        state.sleeping = false;
        self.last_frame = buffer.to_vec();
        self.windows_since_tx = 0;
        self.pending_tx = Some(airtime);
        Ok(())
    }

    fn poll_transmit(&mut self) -> nb::Result<u32, RadioError> {
        let airtime = self.pending_tx.take().ok_or(nb::Error::Other(RadioError::Hardware))?;
        self.clock.advance(Duration::from_millis(u64::from(airtime)));
        Ok(airtime)
    }

    fn receive(&mut self, config: RxConfig) -> Result<(), RadioError> {
        let id = if self.windows_since_tx == 0 {
            WindowId::Rx1
        } else {
            WindowId::Rx2
        };
        self.windows_since_tx += 1;

        let mut state = self.state.lock();
        let reported = state.probe.as_ref().and_then(|probe| probe());
        state.windows.push(Window {
            id,
            at: self.clock.now(),
            config,
            reported,
        });
        let frame = self.last_frame.clone();
        let reply = state.responder.as_mut().and_then(|respond| respond(&frame, id));
        self.pending_rx = Some((reply, config));
        Ok(())
    }

    fn poll_receive(&mut self, buffer: &mut [u8]) -> nb::Result<Option<(usize, RxQuality)>, RadioError> {
        let (reply, config) = self.pending_rx.take().ok_or(nb::Error::Other(RadioError::Hardware))?;
        match reply {
            Some(reply) => {
                let len = reply.len().min(buffer.len());
                buffer[..len].copy_from_slice(&reply[..len]);
                let airtime = time_on_air(&config.modulation, len);
                self.clock.advance(Duration::from_millis(u64::from(airtime)));
                Ok(Some((len, self.state.lock().quality)))
            }
            None => {
                self.clock.advance(Duration::from_millis(u64::from(config.timeout_ms)));
                Ok(None)
            }
        }
    }

    fn channel_rssi(&mut self, _frequency: u32) -> Result<i16, RadioError> {
        Ok(self.state.lock().channel_rssi)
    }

    fn sleep(&mut self) -> Result<(), RadioError> {
        self.state.lock().sleeping = true;
        Ok(())
    }
}

/// Uplink decoded by the network server
#[derive(Debug, Clone)]
pub struct ReceivedUplink {
    pub confirmed: bool,
    pub fcnt: u32,
    pub fctrl: FCtrl,
    pub f_opts: Vec<u8>,
    pub port: Option<u8>,
    pub payload: Vec<u8>,
}

/// Minimal network server for one device
pub struct NetworkServer {
    identity: DeviceIdentity,
    /// Key used to sign join-accepts; differs from the AppKey to force a rejection
    accept_key: AESKey,
    pub answer_joins: bool,
    pub join_window: WindowId,
    pub reply_window: WindowId,
    /// Acknowledge confirmed uplinks
    pub ack: bool,
    /// Answer every uplink, even when there is nothing to say
    pub always_reply: bool,
    next_addr: u32,
    session: Option<(DevAddr, AESKey, AESKey)>,
    fcnt_down: u32,
    pub joins: Vec<JoinRequest>,
    pub uplinks: Vec<ReceivedUplink>,
    queued: Option<(u8, Vec<u8>)>,
    commands: Vec<u8>,
    confirmed_downlink: bool,
}

impl NetworkServer {
    pub fn new(identity: DeviceIdentity) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            identity,
            accept_key: identity.app_key,
            answer_joins: true,
            join_window: WindowId::Rx1,
            reply_window: WindowId::Rx1,
            ack: true,
            always_reply: false,
            next_addr: 0x2601_0001,
            session: None,
            fcnt_down: 0,
            joins: Vec::new(),
            uplinks: Vec::new(),
            queued: None,
            commands: Vec::new(),
            confirmed_downlink: false,
        }))
    }

    pub fn sign_accepts_with(&mut self, key: AESKey) {
        self.accept_key = key;
    }

    pub fn dev_addr(&self) -> Option<DevAddr> {
        self.session.map(|(addr, _, _)| addr)
    }

    /// Application data for the next downlink
    pub fn queue_downlink(&mut self, port: u8, payload: &[u8]) {
        self.queued = Some((port, payload.to_vec()));
    }

    /// Raw MAC commands for the FOpts of the next downlink
    pub fn queue_commands(&mut self, commands: &[u8]) {
        self.commands.extend_from_slice(commands);
    }

    /// Send the next downlink as confirmed data
    pub fn confirm_next_downlink(&mut self) {
        self.confirmed_downlink = true;
    }

    pub fn handle(&mut self, frame: &[u8], window: WindowId) -> Option<Vec<u8>> {
        match MType::from_mhdr(*frame.first()?) {
            MType::JoinRequest => self.join(frame, window),
            MType::UnconfirmedDataUp | MType::ConfirmedDataUp => self.uplink(frame, window),
            _ => None,
        }
    }

    fn join(&mut self, frame: &[u8], window: WindowId) -> Option<Vec<u8>> {
        let request = JoinRequest::decode(&self.identity.app_key, frame).ok()?;
        if window == WindowId::Rx1 {
            self.joins.push(request);
        }
        if !self.answer_joins || window != self.join_window {
            return None;
        }

        let dev_addr = DevAddr::new(self.next_addr);
        self.next_addr += 1;
        let accept = JoinAccept {
            app_nonce: [0x01, 0x02, 0x03],
            net_id: [0x13, 0x00, 0x00],
            dev_addr,
            dl_settings: 0,
            rx_delay: 1,
            cf_list: None,
        };
        let (nwk_skey, app_skey) =
            derive_session_keys(&self.identity.app_key, &accept.app_nonce, &accept.net_id, request.dev_nonce);
        self.session = Some((dev_addr, nwk_skey, app_skey));
        self.fcnt_down = 0;
        Some(accept.encode(&self.accept_key).to_vec())
    }

    fn uplink(&mut self, frame: &[u8], window: WindowId) -> Option<Vec<u8>> {
        let (dev_addr, nwk_skey, app_skey) = self.session?;
        let uplink = DataFrame::decode(frame, &nwk_skey, &app_skey, |fcnt| u32::from(fcnt)).ok()?;
        let confirmed = uplink.mtype.is_confirmed();
        if window == WindowId::Rx1 {
            self.uplinks.push(ReceivedUplink {
                confirmed,
                fcnt: uplink.fcnt,
                fctrl: uplink.fctrl,
                f_opts: uplink.f_opts.to_vec(),
                port: uplink.port,
                payload: uplink.payload.to_vec(),
            });
        }
        if window != self.reply_window {
            return None;
        }

        let ack = confirmed && self.ack;
        if !ack && self.queued.is_none() && self.commands.is_empty() && !self.always_reply {
            return None;
        }
        let (port, payload) = match self.queued.take() {
            Some((port, payload)) => (Some(port), payload),
            None => (None, Vec::new()),
        };
        let mtype = if std::mem::take(&mut self.confirmed_downlink) {
            MType::ConfirmedDataDown
        } else {
            MType::UnconfirmedDataDown
        };
        let downlink = DataFrame {
            mtype,
            dev_addr,
            fctrl: FCtrl {
                ack,
                ..FCtrl::default()
            },
            fcnt: self.fcnt_down,
            f_opts: HVec::from_slice(&std::mem::take(&mut self.commands)).ok()?,
            port,
            payload: FrameBuffer::from_slice(&payload).ok()?,
        };
        self.fcnt_down += 1;
        downlink.encode(&nwk_skey, &app_skey).ok().map(|frame| frame.to_vec())
    }
}

/// Store whose contents stay inspectable after it is handed to a device
#[derive(Clone)]
pub struct SharedStore(pub Arc<Mutex<MemoryStore>>);

impl SharedStore {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(MemoryStore::initialized())))
    }
}

impl KeyValueStore for SharedStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.0.lock().get(key)
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.0.lock().put(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.0.lock().remove(key)
    }
}

/// Writer whose output stays readable after it moves to another thread
#[derive(Clone, Default)]
pub struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
