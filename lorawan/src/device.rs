//! High-level LoRaWAN device interface
//!
//! [`Device`] is the one handle an application holds. It owns the radio
//! (no second handle for the same transceiver can exist), persists the
//! identity, and runs the MAC layer on a background thread while exposing
//! blocking calls to the foreground:
//!
//! ```text
//! Uninitialized --configure_pins--> Configured --join--> Active
//!                                       ^                  |
//!                                       +-- reset ---------+
//! Configured/Active --shutdown--> Shutdown --startup--> Configured
//! ```
//!
//! # Downlink delivery
//!
//! The handler registered with [`Device::on_message`] runs synchronously
//! inside [`Device::transmit_message`], in the caller's thread and while
//! the device is still locked for the transmission. Its execution time
//! adds directly to the time `transmit_message` blocks, and it must not
//! call `join*`, `transmit_message` or any other method that drives the
//! radio on the same device.

/// Identity persistence
pub mod credentials;

/// Application downlink delivery
pub mod dispatch;

/// AT-command provisioning listener
pub mod provisioning;

mod worker;

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};

use self::credentials::CredentialStore;
use self::dispatch::ReceptionDispatcher;
use self::provisioning::Provisioner;
use self::worker::Worker;
use crate::config::device::DeviceIdentity;
use crate::config::settings::Settings;
use crate::error::Error;
use crate::lorawan::adr::AdrController;
use crate::lorawan::mac::{adr_limits, LinkCheck, MacLayer, Uplinked};
use crate::lorawan::region::Region;
use crate::radio::settings::{RFSettings, RadioSettingsTable, WindowId};
use crate::radio::traits::{PinConfig, Radio, RxQuality};
use crate::storage::KeyValueStore;
use crate::timer::{Clock, SystemClock};

/// Highest selectable sub-band
pub const MAX_SUB_BAND: u8 = 8;

/// Radios currently owned by a [`Device`]
static CLAIMED: Mutex<Vec<u64>> = parking_lot::const_mutex(Vec::new());

/// Exclusive ownership of one transceiver, released on drop
struct Claim(u64);

impl Claim {
    fn acquire(hardware_id: u64) -> Result<Self, Error> {
        let mut claimed = CLAIMED.lock();
        if claimed.contains(&hardware_id) {
            return Err(Error::AlreadyClaimed(hardware_id));
        }
        claimed.push(hardware_id);
        Ok(Self(hardware_id))
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        CLAIMED.lock().retain(|id| *id != self.0);
    }
}

/// Device lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Radio not wired yet
    Uninitialized,
    /// Radio wired, no session
    Configured,
    /// Joined
    Active,
    /// Background work and radio halted
    Shutdown,
}

/// Downlink that came back with an uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownlinkInfo {
    /// Application port
    pub port: u8,
    /// Payload length handed to the message handler
    pub len: usize,
    /// Window it arrived in
    pub window: WindowId,
    /// Signal quality
    pub quality: RxQuality,
}

/// A transmission that completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// The network acknowledged the uplink (confirmed uplinks only)
    pub acknowledged: bool,
    /// Transmissions made
    pub attempts: u8,
    /// Application downlink received, if any
    pub downlink: Option<DownlinkInfo>,
}

/// A confirmed uplink the network never acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionFailure {
    /// Transmissions made
    pub attempts: u8,
}

/// Outcome of [`Device::transmit_message`]
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Sent; acknowledged when confirmation was requested
    Success(Delivery),
    /// Confirmed uplink not acknowledged after all retries
    Failure(TransmissionFailure),
    /// Anything else: misuse, oversize payload, radio fault
    Unexpected(Error),
}

impl Response {
    /// Whether the transmission succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success(_))
    }
}

impl From<Result<Uplinked, Error>> for Response {
    fn from(result: Result<Uplinked, Error>) -> Self {
        match result {
            Ok(uplinked) => Response::Success(Delivery {
                acknowledged: uplinked.acknowledged,
                attempts: uplinked.attempts,
                downlink: uplinked.downlink.map(|received| DownlinkInfo {
                    port: received.port,
                    len: received.payload.len(),
                    window: received.window,
                    quality: received.quality,
                }),
            }),
            Err(Error::TransmissionFailed { attempts }) => Response::Failure(TransmissionFailure { attempts }),
            Err(error) => Response::Unexpected(error),
        }
    }
}

/// Where the MAC layer currently lives
struct Core<R: Radio, REG: Region> {
    lifecycle: Lifecycle,
    pins: Option<PinConfig>,
    /// Present while no worker is running
    parked: Option<MacLayer<R, REG>>,
    worker: Option<Worker<R, REG>>,
}

impl<R: Radio, REG: Region> Core<R, REG> {
    fn run<T, F>(&mut self, job: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut MacLayer<R, REG>) -> T + Send + 'static,
    {
        match (&self.worker, &mut self.parked) {
            (Some(worker), _) => worker.call(job),
            (None, Some(mac)) => Ok(job(mac)),
            (None, None) => Err(Error::WorkerUnavailable),
        }
    }

    /// Reject radio work outside `Configured`/`Active`
    fn ready(&self) -> Result<(), Error> {
        match self.lifecycle {
            Lifecycle::Uninitialized => Err(Error::NotConfigured),
            Lifecycle::Shutdown => Err(Error::ShutDown),
            Lifecycle::Configured | Lifecycle::Active => Ok(()),
        }
    }

    fn join(&mut self, identity: DeviceIdentity) -> Result<(), Error> {
        let result = self.run(move |mac| mac.join(&identity)).and_then(|joined| joined);
        self.transition(if result.is_ok() {
            Lifecycle::Active
        } else {
            Lifecycle::Configured
        });
        result
    }

    fn transition(&mut self, to: Lifecycle) {
        if self.lifecycle != to {
            tracing::info!(from = ?self.lifecycle, ?to, "lifecycle");
            self.lifecycle = to;
        }
    }
}

struct ProvisioningTask {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// LoRaWAN end device
///
/// Every method takes `&self`; share the handle with `Arc` to call it from
/// several threads. Joins and transmissions are serialized.
pub struct Device<R: Radio, REG: Region> {
    core: Mutex<Core<R, REG>>,
    credentials: Arc<CredentialStore>,
    dispatcher: ReceptionDispatcher,
    table: Arc<RwLock<RadioSettingsTable>>,
    adr: Arc<Mutex<AdrController>>,
    hardware_address: Option<[u8; 6]>,
    provisioning: Mutex<Option<ProvisioningTask>>,
    // Released last, once the worker has given the radio back
    _claim: Claim,
}

impl<R: Radio, REG: Region> Device<R, REG> {
    /// Take ownership of `radio`, using the system clock
    ///
    /// Fails with [`Error::AlreadyClaimed`] while another `Device` owns the
    /// same transceiver.
    pub fn new(radio: R, region: REG, storage: impl KeyValueStore + 'static, settings: Settings) -> Result<Self, Error> {
        Self::with_clock(radio, region, storage, settings, Arc::new(SystemClock::new()))
    }

    /// Take ownership of `radio`, waiting on `clock`
    pub fn with_clock(
        radio: R,
        region: REG,
        storage: impl KeyValueStore + 'static,
        settings: Settings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        if settings.sub_band > MAX_SUB_BAND {
            return Err(Error::InvalidSubBand(settings.sub_band));
        }
        let claim = Claim::acquire(radio.hardware_id())?;

        let data_rate = settings.data_rate.unwrap_or_else(|| region.default_data_rate());
        let adr = Arc::new(Mutex::new(AdrController::new(
            settings.adr,
            adr_limits(&region),
            data_rate,
            settings.tx_power,
        )));
        let table = Arc::new(RwLock::new(RadioSettingsTable::new()));
        let mac = MacLayer::new(radio, region, clock, &settings, Arc::clone(&table), Arc::clone(&adr));

        tracing::debug!(hardware_id = claim.0, sub_band = settings.sub_band, "device created");
        Ok(Self {
            core: Mutex::new(Core {
                lifecycle: Lifecycle::Uninitialized,
                pins: None,
                parked: Some(mac),
                worker: None,
            }),
            credentials: Arc::new(CredentialStore::new(storage)),
            dispatcher: ReceptionDispatcher::new(),
            table,
            adr,
            hardware_address: settings.hardware_address,
            provisioning: Mutex::new(None),
            _claim: claim,
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> Lifecycle {
        self.core.lock().lifecycle
    }

    /// Wire the radio and start the background worker
    pub fn configure_pins(&self, pins: PinConfig) -> Result<(), Error> {
        let mut core = self.core.lock();
        if core.lifecycle == Lifecycle::Shutdown {
            return Err(Error::ShutDown);
        }
        core.run(move |mac| mac.configure(&pins))??;
        core.pins = Some(pins);

        if core.worker.is_none() {
            let mac = core.parked.take().ok_or(Error::WorkerUnavailable)?;
            core.worker = Some(Worker::spawn(mac)?);
        }
        if core.lifecycle == Lifecycle::Uninitialized {
            core.transition(Lifecycle::Configured);
        }
        Ok(())
    }

    /// Restrict uplinks to one sub-band (0 = all); may precede [`configure_pins`](Self::configure_pins)
    pub fn set_subband(&self, band: u8) -> Result<(), Error> {
        if band > MAX_SUB_BAND {
            return Err(Error::InvalidSubBand(band));
        }
        self.core.lock().run(move |mac| mac.set_sub_band(band))
    }

    /// Persist an identity given as hexadecimal text; `false` if malformed or not stored
    pub fn provision(&self, dev_eui: &str, app_eui: &str, app_key: &str) -> bool {
        log_failure("provision", self.try_provision(dev_eui, app_eui, app_key))
    }

    /// Persist an identity given as hexadecimal text
    pub fn try_provision(&self, dev_eui: &str, app_eui: &str, app_key: &str) -> Result<(), Error> {
        let identity = DeviceIdentity::from_hex(dev_eui, app_eui, app_key)?;
        self.credentials.save(&identity)?;
        Ok(())
    }

    /// Persist an identity whose DevEUI is derived from the hardware address
    pub fn provision_with_mac(&self, app_eui: &str, app_key: &str) -> bool {
        log_failure("provision_with_mac", self.try_provision_with_mac(app_eui, app_key))
    }

    /// See [`provision_with_mac`](Self::provision_with_mac)
    pub fn try_provision_with_mac(&self, app_eui: &str, app_key: &str) -> Result<(), Error> {
        let mac = self.hardware_address.ok_or(Error::NoHardwareAddress)?;
        let identity = DeviceIdentity::from_hardware_address(mac, app_eui, app_key)?;
        self.credentials.save(&identity)?;
        Ok(())
    }

    /// Listen for AT provisioning commands on a background thread
    ///
    /// At most one listener runs at a time; it ends when `input` is
    /// exhausted or the device shuts down.
    pub fn start_provisioning_task<I, O>(&self, input: I, output: O) -> Result<(), Error>
    where
        I: BufRead + Send + 'static,
        O: Write + Send + 'static,
    {
        let mut task = self.provisioning.lock();
        if task.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            tracing::warn!("provisioning listener already running");
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let provisioner = Provisioner::new(Arc::clone(&self.credentials), self.hardware_address, Arc::clone(&stop));
        let handle = thread::Builder::new()
            .name("lorawan-prov".into())
            .spawn(move || {
                if let Err(error) = provisioner.serve(input, output) {
                    tracing::warn!(%error, "provisioning listener failed");
                }
            })
            .map_err(|error| {
                tracing::warn!(%error, "could not start provisioning listener");
                Error::WorkerUnavailable
            })?;
        *task = Some(ProvisioningTask { stop, handle });
        Ok(())
    }

    /// Block until an identity is available through any provisioning path
    pub fn wait_for_provisioning(&self) {
        self.credentials.wait_for_provisioning();
    }

    /// Whether a complete identity is available
    pub fn is_provisioned(&self) -> bool {
        self.credentials.is_complete()
    }

    /// Join with the stored identity; `false` on any failure
    pub fn join(&self) -> bool {
        log_failure("join", self.try_join())
    }

    /// Join with the stored identity
    ///
    /// Blocks through both join-accept windows. An active session is
    /// dropped first.
    pub fn try_join(&self) -> Result<(), Error> {
        let mut core = self.core.lock();
        core.ready()?;
        let identity = self.credentials.join_identity()?;
        core.join(identity)
    }

    /// Join with the given identity without persisting it; `false` on any failure
    pub fn join_with(&self, dev_eui: &str, app_eui: &str, app_key: &str) -> bool {
        log_failure("join_with", self.try_join_with(dev_eui, app_eui, app_key))
    }

    /// Join with the given identity without persisting it
    ///
    /// The identity is kept in memory, so later [`join`](Self::join) calls
    /// may reuse it when nothing is stored.
    pub fn try_join_with(&self, dev_eui: &str, app_eui: &str, app_key: &str) -> Result<(), Error> {
        let mut core = self.core.lock();
        core.ready()?;
        let identity = DeviceIdentity::from_hex(dev_eui, app_eui, app_key)?;
        self.credentials.set_volatile(identity);
        core.join(identity)
    }

    /// Send one application payload and wait for its receive windows
    ///
    /// A downlink is handed to the message handler before this returns.
    pub fn transmit_message(&self, payload: &[u8], port: u8, confirm: bool) -> Response {
        let mut core = self.core.lock();
        let result = match core.lifecycle {
            Lifecycle::Uninitialized => Err(Error::NotConfigured),
            Lifecycle::Shutdown => Err(Error::ShutDown),
            Lifecycle::Configured => Err(Error::NotJoined),
            Lifecycle::Active => {
                let payload = payload.to_vec();
                core.run(move |mac| mac.send(&payload, port, confirm))
                    .and_then(|sent| sent)
            }
        };

        if let Ok(Uplinked {
            downlink: Some(received),
            ..
        }) = &result
        {
            self.dispatcher.dispatch(&received.payload, received.port);
        }
        if let Err(error) = &result {
            tracing::warn!(port, confirm, %error, "uplink failed");
        }
        Response::from(result)
    }

    /// Register the downlink handler, replacing any previous one
    ///
    /// See the [module documentation](self) for the execution contract.
    pub fn on_message(&self, handler: impl FnMut(&[u8], u8) + Send + 'static) {
        self.dispatcher.register(Box::new(handler));
    }

    /// Whether adaptive data rate is on
    pub fn adr_enabled(&self) -> bool {
        self.adr.lock().enabled()
    }

    /// Turn adaptive data rate on or off
    pub fn set_adr_enabled(&self, enabled: bool) {
        tracing::debug!(enabled, "ADR");
        self.adr.lock().set_enabled(enabled);
    }

    /// Listen-before-talk RSSI calibration in dB
    pub fn set_rssi_cal(&self, cal: i8) -> Result<(), Error> {
        self.core.lock().run(move |mac| mac.set_rssi_cal(cal))
    }

    /// Piggyback a LinkCheckReq on the next uplink
    pub fn request_link_check(&self) -> Result<(), Error> {
        let mut core = self.core.lock();
        core.ready()?;
        core.run(|mac| mac.request_link_check()).and_then(|queued| queued)
    }

    /// Last LinkCheckAns received in this session
    pub fn link_check(&self) -> Option<LinkCheck> {
        self.core.lock().run(|mac| mac.link_check()).ok().flatten()
    }

    /// Drop the session; the identity is kept and a fresh join is required
    pub fn reset(&self) -> Result<(), Error> {
        let mut core = self.core.lock();
        core.run(|mac| mac.reset_session())?;
        if core.lifecycle == Lifecycle::Active {
            core.transition(Lifecycle::Configured);
        }
        Ok(())
    }

    /// Halt background tasks and put the radio to sleep
    ///
    /// Identity and pin configuration are kept.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.stop_provisioning();

        let mut core = self.core.lock();
        if matches!(core.lifecycle, Lifecycle::Uninitialized | Lifecycle::Shutdown) {
            return Ok(());
        }
        if let Some(worker) = core.worker.take() {
            core.parked = Some(worker.stop()?);
        }
        core.transition(Lifecycle::Shutdown);

        let mac = core.parked.as_mut().ok_or(Error::WorkerUnavailable)?;
        if let Err(error) = mac.sleep() {
            tracing::warn!(%error, "radio did not enter sleep");
        }
        Ok(())
    }

    /// Bring a shut-down device back to `Configured`; a fresh join is required
    pub fn startup(&self) -> Result<(), Error> {
        let mut core = self.core.lock();
        if core.lifecycle != Lifecycle::Shutdown {
            return Ok(());
        }
        let pins = core.pins.ok_or(Error::NotConfigured)?;
        let mac = core.parked.as_mut().ok_or(Error::WorkerUnavailable)?;
        mac.reset_session();
        mac.configure(&pins)?;

        let mac = core.parked.take().ok_or(Error::WorkerUnavailable)?;
        core.worker = Some(Worker::spawn(mac)?);
        core.transition(Lifecycle::Configured);
        Ok(())
    }

    /// Window the radio is in right now
    pub fn rx_tx_window(&self) -> WindowId {
        self.table.read().window()
    }

    /// Last RF settings used in `window`
    pub fn get_rf_settings(&self, window: WindowId) -> RFSettings {
        self.table.read().settings(window)
    }

    /// Last uplink settings
    pub fn tx_settings(&self) -> RFSettings {
        self.get_rf_settings(WindowId::Tx)
    }

    /// Last RX1 settings
    pub fn rx1_settings(&self) -> RFSettings {
        self.get_rf_settings(WindowId::Rx1)
    }

    /// Last RX2 settings
    pub fn rx2_settings(&self) -> RFSettings {
        self.get_rf_settings(WindowId::Rx2)
    }

    /// RSSI of the last received downlink, in dBm
    pub fn rssi(&self) -> i16 {
        self.table.read().rssi()
    }

    /// SNR of the last received downlink, in dB
    pub fn snr(&self) -> i8 {
        self.table.read().snr()
    }

    fn stop_provisioning(&self) {
        if let Some(task) = self.provisioning.lock().take() {
            task.stop.store(true, Ordering::Release);
            tracing::debug!("provisioning listener asked to stop");
        }
    }
}

impl<R: Radio, REG: Region> Drop for Device<R, REG> {
    fn drop(&mut self) {
        self.stop_provisioning();
    }
}

fn log_failure(operation: &'static str, result: Result<(), Error>) -> bool {
    match result {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(operation, %error, "failed");
            false
        }
    }
}
