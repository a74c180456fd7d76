//! Device-bound payload key.
//!
//! Host tools encrypt protected program-data payloads with a key derived
//! from the device's unique id. The derivation is a fixed two-step AES-128
//! challenge:
//!
//! 1. `deckey = AES-Decrypt(key = PREFIX || DEVICE_STRING, SALT)`
//! 2. `seed = AES-Encrypt(key = deckey, PREFIX || uid)`
//!
//! and the payload is then decrypted with `seed` as the AES-128 key.
//!
//! **This is not a secure provisioning scheme.** The salt and the device
//! string are public constants, so anybody who can read the unique id can
//! derive the key. The constants are reproduced exactly so that existing
//! host tooling can unlock existing devices.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

/// AES block size.
pub const BLOCK_SIZE: usize = 16;

/// Length of the hardware unique id.
pub const UID_SIZE: usize = 12;

/// Hardware unique id, as read from system memory.
pub type DeviceUid = [u8; UID_SIZE];

/// Derived per-device key.
pub type DeviceKey = [u8; BLOCK_SIZE];

const PREFIX: [u8; 4] = [0x80, 0x00, 0xff, 0xff];

const DEVICE_STRING: [u8; UID_SIZE] = *b"brobwind.com";

const SALT: [u8; BLOCK_SIZE] = [
    0x29, 0xf1, 0x95, 0x64, 0xcc, 0xdb, 0xde, 0xf9, 0x3b, 0xd1, 0xe7, 0x7d, 0x8a, 0x89, 0xb9, 0xbf,
];

fn devuid(tail: &[u8; UID_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block[..PREFIX.len()].copy_from_slice(&PREFIX);
    block[PREFIX.len()..].copy_from_slice(tail);
    block
}

/// Derive the payload key for a device with unique id `uid`.
pub fn derive_key(uid: &DeviceUid) -> DeviceKey {
    let unlock = Aes128::new(&devuid(&DEVICE_STRING).into());
    let mut deckey = GenericArray::from(SALT);
    unlock.decrypt_block(&mut deckey);

    let challenge = Aes128::new(&deckey);
    let mut seed = GenericArray::from(devuid(uid));
    challenge.encrypt_block(&mut seed);

    seed.into()
}

/// Decrypt `payload` in place with `key`, one 16-byte block at a time.
///
/// A trailing partial block is left as received. Returns the number of
/// bytes that were decrypted.
pub fn decrypt_payload(key: &DeviceKey, payload: &mut [u8]) -> usize {
    let cipher = Aes128::new(&(*key).into());
    let mut done = 0;

    for chunk in payload.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        done += BLOCK_SIZE;
    }

    done
}
