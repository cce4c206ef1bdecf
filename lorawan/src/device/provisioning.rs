//! AT-command provisioning listener
//!
//! Reads newline-terminated commands from any byte stream (typically a
//! serial console) and answers on the paired writer:
//!
//! | Command                          | Reply                              |
//! |----------------------------------|------------------------------------|
//! | `AT`                             | `OK`                               |
//! | `AT+PROV?`                       | `<devEui>-<appEui>-<32 zeros>`, `OK` |
//! | `AT+PROV=<devEui>-<appEui>-<appKey>` | `OK` / `ERROR`                 |
//! | `AT+PROVM=<appEui>-<appKey>`     | `OK` / `ERROR`                     |
//! | `AT+MAC?`                        | 12 hex digits, `OK`                |
//! | `AT+HWEUI?`                      | DevEUI derived from the MAC, `OK`  |
//!
//! The AppKey is never echoed back.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::credentials::CredentialStore;
use crate::config::device::{DeviceIdentity, EUI64};
use crate::error::Error;

const HIDDEN_KEY: &str = "00000000000000000000000000000000";

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Ok,
    Value(String),
    Error,
}

/// Provisioning command interpreter
pub struct Provisioner {
    credentials: Arc<CredentialStore>,
    hardware_address: Option<[u8; 6]>,
    stop: Arc<AtomicBool>,
}

impl Provisioner {
    /// Interpreter saving into `credentials`
    pub fn new(credentials: Arc<CredentialStore>, hardware_address: Option<[u8; 6]>, stop: Arc<AtomicBool>) -> Self {
        Self {
            credentials,
            hardware_address,
            stop,
        }
    }

    /// Answer commands until the input ends or the stop flag is raised
    ///
    /// The flag is checked between lines; a blocked read is not interrupted.
    pub fn serve(&self, mut input: impl BufRead, mut output: impl Write) -> io::Result<()> {
        let mut line = String::new();
        while !self.stop.load(Ordering::Acquire) {
            line.clear();
            if input.read_line(&mut line)? == 0 {
                break;
            }
            let command = line.trim();
            if command.is_empty() {
                continue;
            }
            match self.handle(command) {
                Reply::Ok => write!(output, "OK\r\n")?,
                Reply::Value(value) => write!(output, "{value}\r\nOK\r\n")?,
                Reply::Error => write!(output, "ERROR\r\n")?,
            }
            output.flush()?;
        }
        tracing::debug!("provisioning listener stopped");
        Ok(())
    }

    fn handle(&self, command: &str) -> Reply {
        let (name, argument) = match command.split_once('=') {
            Some((name, argument)) => (name, Some(argument)),
            None => (command, None),
        };
        let result = match (name.to_ascii_uppercase().as_str(), argument) {
            ("AT", None) => Ok(Reply::Ok),
            ("AT+PROV?", None) => self.query(),
            ("AT+PROV", Some(argument)) => self.provision(argument),
            ("AT+PROVM", Some(argument)) => self.provision_with_mac(argument),
            ("AT+MAC?", None) => self.mac().map(|mac| Reply::Value(hex::encode_upper(mac))),
            ("AT+HWEUI?", None) => self
                .mac()
                .map(|mac| Reply::Value(EUI64::from_hardware_address(mac).to_string())),
            _ => {
                tracing::warn!(command, "unknown provisioning command");
                return Reply::Error;
            }
        };
        result.unwrap_or_else(|error| {
            tracing::warn!(command = name, %error, "provisioning command failed");
            Reply::Error
        })
    }

    fn query(&self) -> Result<Reply, Error> {
        let identity = self.credentials.load()?;
        Ok(Reply::Value(format!("{}-{}-{HIDDEN_KEY}", identity.dev_eui, identity.app_eui)))
    }

    fn provision(&self, argument: &str) -> Result<Reply, Error> {
        let identity = match split_fields::<3>(argument) {
            Some([dev_eui, app_eui, app_key]) => DeviceIdentity::from_hex(dev_eui, app_eui, app_key)?,
            None => return Err(Error::InvalidCredential("provisioning triple")),
        };
        self.credentials.save(&identity)?;
        Ok(Reply::Ok)
    }

    fn provision_with_mac(&self, argument: &str) -> Result<Reply, Error> {
        let mac = self.mac()?;
        let identity = match split_fields::<2>(argument) {
            Some([app_eui, app_key]) => DeviceIdentity::from_hardware_address(mac, app_eui, app_key)?,
            None => return Err(Error::InvalidCredential("provisioning pair")),
        };
        self.credentials.save(&identity)?;
        Ok(Reply::Ok)
    }

    fn mac(&self) -> Result<[u8; 6], Error> {
        self.hardware_address.ok_or(Error::NoHardwareAddress)
    }
}

/// Exactly `N` dash-separated fields
fn split_fields<const N: usize>(argument: &str) -> Option<[&str; N]> {
    let mut fields = [""; N];
    let mut parts = argument.split('-');
    for field in fields.iter_mut() {
        *field = parts.next()?;
    }
    parts.next().is_none().then_some(fields)
}
