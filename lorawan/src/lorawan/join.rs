//! Over-the-air activation state machine
//!
//! ```text
//! Idle -> Joining -> Joined
//!            |
//!            +-> Failed -> Idle
//! ```

use heapless::Vec;

use super::frame::{JoinAccept, JoinRequest, JOIN_REQUEST_LEN};
use super::mac::MacError;
use crate::config::device::{DeviceIdentity, SessionState};
use crate::crypto;

/// Activation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinState {
    /// No session, no join in progress
    #[default]
    Idle,
    /// Join-request sent, waiting for the accept
    Joining,
    /// Session established
    Joined,
    /// The last attempt timed out or was rejected
    Failed,
}

/// Drives one join exchange at a time
#[derive(Debug, Default)]
pub struct JoinStateMachine {
    state: JoinState,
    pending: Option<(DeviceIdentity, u16)>,
}

impl JoinStateMachine {
    /// Machine in `Idle`
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    pub fn state(&self) -> JoinState {
        self.state
    }

    /// Enter `Joining` and build the join-request
    ///
    /// A machine that is `Joined` or `Failed` restarts from `Idle` first.
    pub fn begin(&mut self, identity: &DeviceIdentity, dev_nonce: u16) -> Vec<u8, JOIN_REQUEST_LEN> {
        if self.state != JoinState::Idle {
            self.reset();
        }
        self.state = JoinState::Joining;
        self.pending = Some((*identity, dev_nonce));

        JoinRequest {
            app_eui: identity.app_eui,
            dev_eui: identity.dev_eui,
            dev_nonce,
        }
        .encode(&identity.app_key)
    }

    /// Validate a candidate join-accept without changing state
    pub fn check(&self, frame: &[u8]) -> Result<JoinAccept, MacError> {
        let (identity, _) = self.pending.as_ref().ok_or(MacError::InvalidFrame)?;
        JoinAccept::decode(&identity.app_key, frame)
    }

    /// Derive the session from a validated accept and enter `Joined`
    pub fn complete(&mut self, accept: &JoinAccept) -> Result<SessionState, MacError> {
        if self.state != JoinState::Joining {
            return Err(MacError::InvalidFrame);
        }
        let (identity, dev_nonce) = self.pending.take().ok_or(MacError::InvalidFrame)?;
        let (nwk_skey, app_skey) =
            crypto::derive_session_keys(&identity.app_key, &accept.app_nonce, &accept.net_id, dev_nonce);
        self.state = JoinState::Joined;
        Ok(SessionState::new(accept.dev_addr, nwk_skey, app_skey, accept.net_id))
    }

    /// The attempt timed out or its accept was rejected
    pub fn fail(&mut self) {
        self.pending = None;
        self.state = JoinState::Failed;
    }

    /// Back to `Idle`
    pub fn reset(&mut self) {
        self.pending = None;
        self.state = JoinState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::device::{AESKey, DevAddr, EUI64};

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new(EUI64::new([1; 8]), EUI64::new([2; 8]), AESKey::new([3; 16]))
    }

    fn accept() -> JoinAccept {
        JoinAccept {
            app_nonce: [9, 9, 9],
            net_id: [0x13, 0, 0],
            dev_addr: DevAddr::new(0x2601_0042),
            dl_settings: 0,
            rx_delay: 1,
            cf_list: None,
        }
    }

    #[test]
    fn successful_join() {
        let mut machine = JoinStateMachine::new();
        let request = machine.begin(&identity(), 0x1234);
        assert_eq!(request.len(), JOIN_REQUEST_LEN);
        assert_eq!(machine.state(), JoinState::Joining);

        let frame = accept().encode(&identity().app_key);
        let parsed = machine.check(&frame).unwrap();
        let session = machine.complete(&parsed).unwrap();
        assert_eq!(machine.state(), JoinState::Joined);
        assert_eq!(session.dev_addr, DevAddr::new(0x2601_0042));
        assert_eq!(session.fcnt_up, 0);
    }

    #[test]
    fn accept_under_other_key_is_rejected() {
        let mut machine = JoinStateMachine::new();
        machine.begin(&identity(), 1);
        let frame = accept().encode(&AESKey::new([4; 16]));
        assert_eq!(machine.check(&frame), Err(MacError::InvalidMic));
        assert_eq!(machine.state(), JoinState::Joining);
        machine.fail();
        assert_eq!(machine.state(), JoinState::Failed);
    }

    #[test]
    fn rejoin_restarts_from_idle() {
        let mut machine = JoinStateMachine::new();
        machine.begin(&identity(), 1);
        let parsed = machine.check(&accept().encode(&identity().app_key)).unwrap();
        machine.complete(&parsed).unwrap();
        machine.begin(&identity(), 2);
        assert_eq!(machine.state(), JoinState::Joining);
    }

    #[test]
    fn complete_without_begin_is_invalid() {
        let mut machine = JoinStateMachine::new();
        assert!(machine.complete(&accept()).is_err());
        assert_eq!(machine.state(), JoinState::Idle);
    }
}
