//! LoRaWAN cryptographic operations
//!
//! This module provides cryptographic functions for LoRaWAN 1.0.x security:
//! - Message Integrity Code (MIC) computation (AES-CMAC)
//! - Payload encryption/decryption (AES-128 in counter mode)
//! - Join accept encryption
//! - Session key derivation

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::config::device::{AESKey, DevAddr};

/// MIC size in bytes
pub const MIC_SIZE: usize = 4;

/// Block size for AES-128
const BLOCK_SIZE: usize = 16;

/// Direction identifiers for cryptographic operations
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Direction {
    /// Uplink (device to network)
    Up = 0,
    /// Downlink (network to device)
    Down = 1,
}

fn cipher(key: &AESKey) -> Aes128 {
    Aes128::new(key.as_bytes().into())
}

fn cmac(key: &AESKey, parts: &[&[u8]]) -> [u8; MIC_SIZE] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(key.as_bytes().into());
    for part in parts {
        mac.update(part);
    }
    let tag = mac.finalize().into_bytes();
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&tag[..MIC_SIZE]);
    mic
}

/// Per-frame block shared by the MIC (B0) and the keystream (Ai)
fn frame_block(tag: u8, dir: Direction, dev_addr: DevAddr, fcnt: u32, last: u8) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[0] = tag;
    block[5] = dir as u8;
    block[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    block[10..14].copy_from_slice(&fcnt.to_le_bytes());
    block[15] = last;
    block
}

/// Compute Message Integrity Code (MIC) for a data frame
///
/// # Arguments
/// * `key` - Network session key
/// * `data` - MHDR through FRMPayload
/// * `dev_addr` - Device address
/// * `fcnt` - Full 32-bit frame counter
/// * `dir` - Message direction
pub fn compute_mic(key: &AESKey, data: &[u8], dev_addr: DevAddr, fcnt: u32, dir: Direction) -> [u8; MIC_SIZE] {
    let b0 = frame_block(0x49, dir, dev_addr, fcnt, data.len() as u8);
    cmac(key, &[&b0, data])
}

/// Encrypt or decrypt a FRMPayload in place (the operation is its own inverse)
///
/// # Arguments
/// * `key` - AppSKey, or NwkSKey for port 0
/// * `dev_addr` - Device address
/// * `fcnt` - Full 32-bit frame counter
/// * `dir` - Message direction
/// * `payload` - Data to transform
pub fn crypt_payload(key: &AESKey, dev_addr: DevAddr, fcnt: u32, dir: Direction, payload: &mut [u8]) {
    let cipher = cipher(key);
    for (i, chunk) in payload.chunks_mut(BLOCK_SIZE).enumerate() {
        let mut s = frame_block(0x01, dir, dev_addr, fcnt, (i + 1) as u8);
        cipher.encrypt_block((&mut s).into());
        for (byte, key_byte) in chunk.iter_mut().zip(s.iter()) {
            *byte ^= key_byte;
        }
    }
}

/// MIC of a join-request or join-accept: CMAC over the whole message
pub fn compute_join_mic(key: &AESKey, data: &[u8]) -> [u8; MIC_SIZE] {
    cmac(key, &[data])
}

/// Recover a join-accept body in place (the device side applies AES encrypt)
///
/// `data` must be a whole number of blocks.
pub fn decrypt_join_accept(key: &AESKey, data: &mut [u8]) {
    let cipher = cipher(key);
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(block.into());
    }
}

/// Network-side counterpart of [`decrypt_join_accept`]
pub fn encrypt_join_accept(key: &AESKey, data: &mut [u8]) {
    let cipher = cipher(key);
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(block.into());
    }
}

/// Derive network and application session keys from join accept
///
/// # Arguments
/// * `app_key` - Application key
/// * `app_nonce` - Application nonce from join accept
/// * `net_id` - Network ID from join accept
/// * `dev_nonce` - Device nonce from join request
pub fn derive_session_keys(app_key: &AESKey, app_nonce: &[u8; 3], net_id: &[u8; 3], dev_nonce: u16) -> (AESKey, AESKey) {
    let cipher = cipher(app_key);

    let derive = |tag: u8| {
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = tag;
        block[1..4].copy_from_slice(app_nonce);
        block[4..7].copy_from_slice(net_id);
        block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
        cipher.encrypt_block((&mut block).into());
        AESKey::new(block)
    };

    (derive(0x01), derive(0x02))
}
