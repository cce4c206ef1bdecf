use std::sync::Arc;
use std::time::Duration;

use heapless::Vec;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;

use super::adr::{AdrController, AdrLimits, Outcome};
use super::commands::{DownlinkCommands, MacCommand, MAX_FOPTS};
use super::duty_cycle::DutyCycleGovernor;
use super::frame::{DataFrame, FCtrl, FrameBuffer, MType};
use super::join::JoinStateMachine;
use super::phy::{PhyLayer, TimingParams};
use super::region::Region;
use super::scheduler::{Exchange, RetrySchedule, TransmissionScheduler, TxPlan, WindowPlan};
use crate::config::device::{DevAddr, DeviceIdentity, SessionState};
use crate::config::settings::{RetryPolicy, Settings};
use crate::error::Error;
use crate::radio::settings::{RadioSettingsTable, WindowId};
use crate::radio::traits::{PinConfig, Radio, RadioError, RxQuality};
use crate::timer::Clock;

/// Lowest application port
pub const MIN_APP_PORT: u8 = 1;

/// Highest application port (224 and up are reserved)
pub const MAX_APP_PORT: u8 = 223;

/// Largest RX1 data-rate offset accepted from the network
const MAX_RX1_DR_OFFSET: u8 = 5;

/// MAC layer error
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MacError {
    /// Invalid MIC
    #[error("invalid MIC")]
    InvalidMic,
    /// Malformed frame
    #[error("invalid frame")]
    InvalidFrame,
    /// Buffer too small
    #[error("buffer too small")]
    BufferTooSmall,
    /// MAC command identifier not understood
    #[error("unknown MAC command {0:#04x}")]
    UnknownCommand(u8),
    /// Field value out of range
    #[error("invalid value")]
    InvalidValue,
    /// Frame addressed to another device
    #[error("frame for device {0}")]
    AddressMismatch(DevAddr),
}

/// Application data received after an uplink
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    /// Application port (1..=223)
    pub port: u8,
    /// Decrypted payload
    pub payload: FrameBuffer,
    /// Window the downlink arrived in
    pub window: WindowId,
    /// Signal quality of the downlink
    pub quality: RxQuality,
}

/// Result of a completed uplink
#[derive(Debug, Clone, PartialEq)]
pub struct Uplinked {
    /// The network acknowledged the frame (confirmed uplinks)
    pub acknowledged: bool,
    /// Number of transmissions made
    pub attempts: u8,
    /// Application data that came back, if any
    pub downlink: Option<Received>,
}

/// Last LinkCheckAns from the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCheck {
    /// Demodulation margin of the request in dB
    pub margin: u8,
    /// Gateways that heard the request
    pub gateway_count: u8,
}

/// Data-rate and power limits ADR works within for `region`
pub fn adr_limits(region: &impl Region) -> AdrLimits {
    AdrLimits {
        min_data_rate: region.min_data_rate(),
        max_data_rate: region.max_data_rate(),
        max_power_index: region.max_tx_power_index(),
    }
}

/// MAC layer state
///
/// Owns the session and everything the network may reconfigure. Lives on
/// the worker thread; the ADR controller and the radio settings table are
/// shared with the foreground.
pub struct MacLayer<R: Radio, REG: Region> {
    scheduler: TransmissionScheduler<R>,
    region: REG,
    join: JoinStateMachine,
    session: Option<SessionState>,
    adr: Arc<Mutex<AdrController>>,
    timing: TimingParams,
    retry: RetryPolicy,
    rx1_dr_offset: u8,
    rx2: (u32, u8),
    rx1_delay: Duration,
    rx2_delay: Duration,
    /// MAC answers to piggyback on the next uplink
    pending: Vec<u8, MAX_FOPTS>,
    /// The last downlink was confirmed; acknowledge it on the next uplink
    ack_next: bool,
    link_check: Option<LinkCheck>,
}

impl<R: Radio, REG: Region> MacLayer<R, REG> {
    /// Create a new MAC layer
    pub fn new(
        radio: R,
        mut region: REG,
        clock: Arc<dyn Clock>,
        settings: &Settings,
        table: Arc<RwLock<RadioSettingsTable>>,
        adr: Arc<Mutex<AdrController>>,
    ) -> Self {
        region.set_sub_band(settings.sub_band);
        adr.lock().set_limits(adr_limits(&region));

        let phy = PhyLayer::new(radio, clock, settings.timing.poll_interval);
        let duty_cycle = settings.duty_cycle.clone().unwrap_or_else(|| region.duty_cycle_table());
        let governor = DutyCycleGovernor::new(duty_cycle);
        let rx2 = region.rx2_default();
        Self {
            scheduler: TransmissionScheduler::new(phy, governor, table, settings.timing.rx_window, settings.rssi_cal),
            region,
            join: JoinStateMachine::new(),
            session: None,
            adr,
            timing: settings.timing,
            retry: settings.retry,
            rx1_dr_offset: 0,
            rx2,
            rx1_delay: settings.timing.rx1_delay,
            rx2_delay: settings.timing.rx2_delay,
            pending: Vec::new(),
            ack_next: false,
            link_check: None,
        }
    }

    /// Wire the radio
    pub fn configure(&mut self, pins: &PinConfig) -> Result<(), RadioError> {
        self.scheduler.configure(pins)
    }

    /// Put the radio to sleep
    pub fn sleep(&mut self) -> Result<(), RadioError> {
        self.scheduler.sleep()
    }

    /// Restrict uplinks to a sub-band (0 = all)
    pub fn set_sub_band(&mut self, band: u8) {
        self.region.set_sub_band(band);
        self.adr.lock().set_limits(adr_limits(&self.region));
    }

    /// Listen-before-talk calibration
    pub fn set_rssi_cal(&mut self, rssi_cal: i8) {
        self.scheduler.set_rssi_cal(rssi_cal);
    }

    /// Whether a session is active
    pub fn is_joined(&self) -> bool {
        self.session.is_some()
    }

    /// Active session
    pub fn session(&self) -> Option<&SessionState> {
        self.session.as_ref()
    }

    /// Region plan
    pub fn region(&self) -> &REG {
        &self.region
    }

    /// Duty-cycle accounting
    pub fn governor(&self) -> &DutyCycleGovernor {
        self.scheduler.governor()
    }

    /// Last LinkCheckAns received
    pub fn link_check(&self) -> Option<LinkCheck> {
        self.link_check
    }

    /// Largest payload the next uplink can carry
    pub fn max_payload_size(&self) -> usize {
        let data_rate = self.adr.lock().data_rate();
        self.room(data_rate, self.pending.len())
    }

    /// Drop the session and everything the network configured through it
    pub fn reset_session(&mut self) {
        self.session = None;
        self.join.reset();
        self.pending.clear();
        self.ack_next = false;
        self.link_check = None;
        self.rx1_dr_offset = 0;
        self.rx2 = self.region.rx2_default();
        self.rx1_delay = self.timing.rx1_delay;
        self.rx2_delay = self.timing.rx2_delay;
        self.scheduler.governor_mut().clear_aggregated();
        self.adr.lock().restart();
    }

    /// Ask the network for a LinkCheckAns on the next uplink
    pub fn request_link_check(&mut self) -> Result<(), Error> {
        MacCommand::LinkCheckReq.encode(&mut self.pending)?;
        Ok(())
    }

    fn plan(&self, data_rate: u8, power: u8, rx1_delay: Duration, rx2_delay: Duration) -> Result<TxPlan, RadioError> {
        let channels = self.region.uplink_channels(data_rate);
        let channel = *channels.choose(&mut rand::thread_rng()).ok_or(RadioError::Config)?;
        let frequency = self.region.channel(channel).ok_or(RadioError::Config)?.frequency;
        let power_dbm = self
            .region
            .tx_power_dbm(power)
            .or_else(|| self.region.tx_power_dbm(0))
            .ok_or(RadioError::Config)?;

        let window = |(frequency, data_rate): (u32, u8)| -> Result<WindowPlan, RadioError> {
            Ok(WindowPlan {
                frequency,
                data_rate: self.region.data_rate(data_rate).ok_or(RadioError::Config)?,
            })
        };

        Ok(TxPlan {
            frequency,
            data_rate: self.region.data_rate(data_rate).ok_or(RadioError::Config)?,
            power_dbm,
            band: self.region.duty_cycle_band(frequency),
            rx1: window(self.region.rx1_window(channel, data_rate, self.rx1_dr_offset))?,
            rx2: window(self.rx2)?,
            rx1_delay,
            rx2_delay,
            lbt_threshold: self.region.lbt_threshold(),
        })
    }

    /// Perform one over-the-air activation
    ///
    /// An active session is dropped first. Exactly one join-request is sent.
    pub fn join(&mut self, identity: &DeviceIdentity) -> Result<(), Error> {
        if self.session.is_some() {
            tracing::debug!("rejoining: dropping active session");
            self.reset_session();
        }

        // Without a session the RX parameters are the regional defaults
        let join_dr = self.region.join_data_rate();
        let plan = self.plan(join_dr, 0, self.timing.join_accept_delay1, self.timing.join_accept_delay2)?;

        let dev_nonce: u16 = rand::random();
        let request = self.join.begin(identity, dev_nonce);
        tracing::info!(dev_eui = %identity.dev_eui, frequency = plan.frequency, "sending join-request");

        let join = &self.join;
        let outcome = self.scheduler.exchange(&request, &plan, |frame| join.check(frame));
        let accept = match outcome {
            Ok(Exchange::Accepted { value, .. }) => value,
            Ok(Exchange::Silent) => {
                self.join.fail();
                tracing::warn!("no join-accept received");
                return Err(Error::JoinTimeout);
            }
            Ok(Exchange::Rejected(error)) => {
                self.join.fail();
                tracing::warn!(%error, "join-accept rejected");
                return Err(Error::JoinRejected(error));
            }
            Err(error) => {
                self.join.fail();
                tracing::warn!(%error, "radio fault during join");
                return Err(error.into());
            }
        };

        let session = self.join.complete(&accept).map_err(Error::JoinRejected)?;
        if let Some(cf_list) = &accept.cf_list {
            self.region.apply_cf_list(cf_list);
        }
        self.rx1_dr_offset = accept.rx1_dr_offset().min(MAX_RX1_DR_OFFSET);
        if self.region.data_rate(accept.rx2_data_rate()).is_some() {
            self.rx2.1 = accept.rx2_data_rate();
        }
        if accept.rx_delay != 0 {
            self.set_rx_delay(accept.rx_delay);
        }
        self.adr.lock().restart();

        tracing::info!(dev_addr = %session.dev_addr, "joined");
        self.session = Some(session);
        Ok(())
    }

    /// Application payload bytes available at `data_rate` beside `f_opts` bytes of commands
    fn room(&self, data_rate: u8, f_opts: usize) -> usize {
        self.region.max_payload_size(data_rate).saturating_sub(f_opts)
    }

    fn set_rx_delay(&mut self, seconds: u8) {
        self.rx1_delay = Duration::from_secs(u64::from(seconds.clamp(1, 15)));
        self.rx2_delay = self.rx1_delay + Duration::from_secs(1);
    }

    /// Send one application payload
    ///
    /// Confirmed payloads are retransmitted with the same frame counter until
    /// acknowledged or the retry policy is exhausted.
    pub fn send(&mut self, payload: &[u8], port: u8, confirmed: bool) -> Result<Uplinked, Error> {
        if self.session.is_none() {
            return Err(Error::NotJoined);
        }
        if !(MIN_APP_PORT..=MAX_APP_PORT).contains(&port) {
            return Err(Error::InvalidPort(port));
        }
        let f_opts = self.pending.len();
        let data_rate = self.adr.lock().data_rate();
        let max = self.room(data_rate, f_opts);
        if payload.len() > max {
            return Err(Error::PayloadTooLarge { len: payload.len(), max });
        }

        // ADR backoff may lower the data rate below what the payload needs
        let (adr_enabled, ack_req, data_rate) = {
            let mut adr = self.adr.lock();
            let (ack_req, _) = adr.on_uplink();
            (adr.enabled(), ack_req, adr.data_rate())
        };
        let max = self.room(data_rate, f_opts);
        if payload.len() > max {
            tracing::warn!(len = payload.len(), max, data_rate, "payload no longer fits after ADR backoff");
            return Err(Error::PayloadTooLarge { len: payload.len(), max });
        }

        let session = self.session.as_mut().ok_or(Error::NotJoined)?;
        let frame = DataFrame {
            mtype: if confirmed {
                MType::ConfirmedDataUp
            } else {
                MType::UnconfirmedDataUp
            },
            dev_addr: session.dev_addr,
            fctrl: FCtrl {
                adr: adr_enabled,
                adr_ack_req: ack_req,
                ack: self.ack_next,
                f_pending: false,
            },
            fcnt: session.fcnt_up,
            f_opts: self.pending.clone(),
            port: Some(port),
            payload: FrameBuffer::from_slice(payload).map_err(|_| Error::PayloadTooLarge {
                len: payload.len(),
                max,
            })?,
        }
        .encode(&session.nwk_skey, &session.app_skey)?;

        // The counter and piggybacked answers are spent once the frame exists
        session.increment_fcnt_up();
        self.pending.clear();
        self.ack_next = false;

        let mut schedule = RetrySchedule::new(self.retry, confirmed);
        let mut attempts = 0;
        let mut downlink = None;
        while let Some(attempt) = schedule.next_attempt() {
            attempts = attempt.number;
            let (data_rate, power) = {
                let mut adr = self.adr.lock();
                let lower = adr.data_rate().saturating_sub(1);
                if attempt.fall_back && payload.len() <= self.room(lower, f_opts) {
                    adr.fallback();
                }
                (adr.data_rate(), adr.tx_power())
            };
            let max = self.room(data_rate, f_opts);
            if payload.len() > max {
                return Err(Error::PayloadTooLarge { len: payload.len(), max });
            }
            let plan = self.plan(data_rate, power, self.rx1_delay, self.rx2_delay)?;
            tracing::debug!(attempt = attempt.number, data_rate, frequency = plan.frequency, "uplink");

            let session = self.session.as_ref().ok_or(Error::NotJoined)?;
            let outcome = self
                .scheduler
                .exchange(&frame, &plan, |bytes| validate_downlink(session, bytes))?;

            if let Exchange::Accepted { value, window, quality } = outcome {
                let acknowledged = value.fctrl.ack;
                if let Some(received) = self.accept_downlink(value, window, quality, plan.data_rate.spreading_factor) {
                    downlink = Some(received);
                }
                if !confirmed || acknowledged {
                    return Ok(Uplinked {
                        acknowledged,
                        attempts,
                        downlink,
                    });
                }
            } else if !confirmed {
                return Ok(Uplinked {
                    acknowledged: false,
                    attempts,
                    downlink: None,
                });
            }
        }

        self.adr.lock().record(Outcome::Failure);
        if downlink.is_some() {
            tracing::warn!("application downlink arrived without acknowledgement and is dropped");
        }
        tracing::warn!(attempts, "confirmed uplink not acknowledged");
        Err(Error::TransmissionFailed { attempts })
    }

    /// Apply a validated downlink; returns its application data
    fn accept_downlink(
        &mut self,
        frame: DataFrame,
        window: WindowId,
        quality: RxQuality,
        spreading_factor: u8,
    ) -> Option<Received> {
        if let Some(session) = self.session.as_mut() {
            session.accept_fcnt_down(frame.fcnt);
        }
        self.ack_next = frame.mtype.is_confirmed();
        {
            let mut adr = self.adr.lock();
            adr.on_downlink();
            adr.record(Outcome::Success {
                snr: quality.snr,
                spreading_factor,
            });
        }

        tracing::debug!(fcnt = frame.fcnt, ?window, ack = frame.fctrl.ack, "downlink");
        self.handle_commands(&frame.f_opts, quality.snr);
        match frame.port {
            Some(0) => {
                self.handle_commands(&frame.payload, quality.snr);
                None
            }
            Some(port) => Some(Received {
                port,
                payload: frame.payload,
                window,
                quality,
            }),
            None => None,
        }
    }

    fn handle_commands(&mut self, data: &[u8], snr: i8) {
        for command in DownlinkCommands::new(data) {
            let command = match command {
                Ok(command) => command,
                Err(error) => {
                    tracing::warn!(%error, "unparseable MAC command");
                    break;
                }
            };
            tracing::debug!(?command, "MAC command");
            if let Some(answer) = self.answer(command, snr) {
                if answer.encode(&mut self.pending).is_err() {
                    tracing::warn!(?answer, "no room for MAC answer");
                }
            }
        }
    }

    fn answer(&mut self, command: MacCommand, snr: i8) -> Option<MacCommand> {
        match command {
            MacCommand::LinkCheckAns { margin, gateway_count } => {
                tracing::info!(margin, gateway_count, "link check");
                self.link_check = Some(LinkCheck { margin, gateway_count });
                None
            }
            MacCommand::LinkADRReq {
                data_rate,
                tx_power,
                ch_mask,
                ch_mask_cntl,
                ..
            } => {
                let channel_mask_ack = self.region.apply_channel_mask(ch_mask, ch_mask_cntl);
                let region = &self.region;
                let (data_rate_ack, power_ack) = self.adr.lock().apply_network(data_rate, tx_power, |dr| {
                    dr <= region.max_data_rate() && region.data_rate(dr).is_some() && !region.uplink_channels(dr).is_empty()
                });
                Some(MacCommand::LinkADRAns {
                    power_ack,
                    data_rate_ack,
                    channel_mask_ack,
                })
            }
            MacCommand::DutyCycleReq { max_duty_cycle } => {
                self.scheduler.governor_mut().set_aggregated(max_duty_cycle);
                Some(MacCommand::DutyCycleAns)
            }
            MacCommand::RXParamSetupReq {
                rx1_dr_offset,
                rx2_data_rate,
                freq,
            } => {
                let rx1_dr_offset_ack = rx1_dr_offset <= MAX_RX1_DR_OFFSET;
                let rx2_data_rate_ack = self.region.data_rate(rx2_data_rate).is_some();
                let channel_ack = freq != 0;
                if rx1_dr_offset_ack && rx2_data_rate_ack && channel_ack {
                    self.rx1_dr_offset = rx1_dr_offset;
                    self.rx2 = (freq, rx2_data_rate);
                }
                Some(MacCommand::RXParamSetupAns {
                    rx1_dr_offset_ack,
                    rx2_data_rate_ack,
                    channel_ack,
                })
            }
            MacCommand::DevStatusReq => Some(MacCommand::DevStatusAns {
                battery: 255,
                margin: snr.clamp(-32, 31),
            }),
            MacCommand::NewChannelReq {
                ch_index,
                freq,
                max_dr,
                min_dr,
            } => {
                let ok = self.region.set_channel(ch_index, freq, min_dr, max_dr);
                Some(MacCommand::NewChannelAns {
                    channel_freq_ok: ok,
                    data_rate_ok: ok,
                })
            }
            MacCommand::RXTimingSetupReq { delay } => {
                self.set_rx_delay(delay);
                Some(MacCommand::RXTimingSetupAns)
            }
            MacCommand::TxParamSetupReq { .. } | MacCommand::DlChannelReq { .. } => {
                tracing::debug!(?command, "ignored MAC command");
                None
            }
            _ => None,
        }
    }
}

/// Accept only data downlinks for this session with a valid MIC
fn validate_downlink(session: &SessionState, bytes: &[u8]) -> Result<DataFrame, MacError> {
    let dev_addr = DataFrame::peek_dev_addr(bytes).ok_or(MacError::InvalidFrame)?;
    if dev_addr != session.dev_addr {
        return Err(MacError::AddressMismatch(dev_addr));
    }
    let frame = DataFrame::decode(bytes, &session.nwk_skey, &session.app_skey, |fcnt| {
        session.expand_fcnt_down(fcnt)
    })?;
    if !matches!(frame.mtype, MType::UnconfirmedDataDown | MType::ConfirmedDataDown) {
        return Err(MacError::InvalidFrame);
    }
    Ok(frame)
}
