//! Cryptographic primitives for the ferrite RPC transport.
//!
//! Provides:
//! - AES-256-IGE encryption/decryption
//! - AES-256-CTR obfuscation keystream
//! - SHA-1 / SHA-256 hash macros
//! - `AuthKey` — the 256-byte shared secret
//! - Envelope encryption / decryption (v2 scheme: SHA-256-derived keys)
//!
//! The encrypt/decrypt pair is directional: clients seal with
//! [`encrypt_data_v2`] and open with [`decrypt_data_v2`]. The mirrored
//! server-role pair exists so the full path can be exercised without a live
//! peer.

#![deny(unsafe_code)]

pub mod ige;
mod auth_key;
mod deque_buffer;
mod obfuscation;
mod sha;

pub use auth_key::AuthKey;
pub use deque_buffer::DequeBuffer;
pub use obfuscation::ObfuscationCipher;

// ─── Envelope encrypt / decrypt ──────────────────────────────────────────────

/// Errors from [`decrypt_data_v2`].
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// Ciphertext too short or not block-aligned.
    InvalidBuffer,
    /// The `auth_key_id` in the ciphertext does not match our key.
    AuthKeyMismatch,
    /// The `msg_key` in the ciphertext does not match our computed value.
    MessageKeyMismatch,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBuffer => write!(f, "invalid ciphertext buffer length"),
            Self::AuthKeyMismatch => write!(f, "auth_key_id mismatch"),
            Self::MessageKeyMismatch => write!(f, "msg_key mismatch"),
        }
    }
}

impl std::error::Error for DecryptError {}

/// Which role's key-material slices to use when deriving per-message keys.
#[derive(Clone, Copy)]
enum Side {
    Client,
    Server,
}

impl Side {
    fn x(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Server => 8,
        }
    }
}

/// Derive the AES key and IV from the shared secret and a per-message key.
///
/// Two SHA-256 calls over disjoint slices of the auth key, mixed with the
/// msg_key, are interleaved into the 32-byte key and IV.
fn calc_key(auth_key: &AuthKey, msg_key: &[u8; 16], side: Side) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let sha_a = sha256!(msg_key, &auth_key.data[x..x + 36]);
    let sha_b = sha256!(&auth_key.data[40 + x..40 + x + 36], msg_key);

    let mut aes_key = [0u8; 32];
    aes_key[..8].copy_from_slice(&sha_a[..8]);
    aes_key[8..24].copy_from_slice(&sha_b[8..24]);
    aes_key[24..].copy_from_slice(&sha_a[24..]);

    let mut aes_iv = [0u8; 32];
    aes_iv[..8].copy_from_slice(&sha_b[..8]);
    aes_iv[8..24].copy_from_slice(&sha_a[8..24]);
    aes_iv[24..].copy_from_slice(&sha_b[24..]);

    (aes_key, aes_iv)
}

/// Random padding length for a plaintext of `len` bytes: at least 12 bytes,
/// and the padded total is a multiple of 16.
fn padding_len(len: usize) -> usize {
    (16 - ((len + 12) % 16)) % 16 + 12
}

fn encrypt_with_side(buffer: &mut DequeBuffer, auth_key: &AuthKey, rnd: &[u8; 32], side: Side) {
    let pad = padding_len(buffer.len());
    buffer.extend(rnd.iter().take(pad).copied());

    let x = side.x();
    let msg_key_large = sha256!(&auth_key.data[88 + x..88 + x + 32], buffer.as_ref());
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&msg_key_large[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, side);
    ige::ige_encrypt(buffer.as_mut(), &key, &iv);

    buffer.extend_front(&msg_key);
    buffer.extend_front(&auth_key.key_id);
}

fn decrypt_with_side<'a>(
    buffer: &'a mut [u8],
    auth_key: &AuthKey,
    side: Side,
) -> Result<&'a mut [u8], DecryptError> {
    if buffer.len() < 24 || (buffer.len() - 24) % 16 != 0 {
        return Err(DecryptError::InvalidBuffer);
    }
    if auth_key.key_id != buffer[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&buffer[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, side);
    ige::ige_decrypt(&mut buffer[24..], &key, &iv);

    let x = side.x();
    let our_key = sha256!(&auth_key.data[88 + x..88 + x + 32], &buffer[24..]);
    if msg_key != our_key[8..24] {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(&mut buffer[24..])
}

/// Encrypt `buffer` in place as a client-originated envelope.
///
/// Appends random padding, then replaces the content with
/// `key_id ‖ msg_key ‖ ciphertext`.
pub fn encrypt_data_v2(buffer: &mut DequeBuffer, auth_key: &AuthKey) {
    let mut rnd = [0u8; 32];
    getrandom::getrandom(&mut rnd).expect("getrandom failed");
    encrypt_with_side(buffer, auth_key, &rnd, Side::Client);
}

/// Decrypt a server-originated envelope.
///
/// `buffer` must contain `key_id ‖ msg_key ‖ ciphertext`. On success returns
/// the plaintext (including padding) as a sub-slice of `buffer`.
pub fn decrypt_data_v2<'a>(
    buffer: &'a mut [u8],
    auth_key: &AuthKey,
) -> Result<&'a mut [u8], DecryptError> {
    decrypt_with_side(buffer, auth_key, Side::Server)
}

/// Encrypt `buffer` in place the way the server would.
///
/// The output opens with [`decrypt_data_v2`]; this is how tests and local
/// peer emulation drive the receive path.
pub fn encrypt_server_data_v2(buffer: &mut DequeBuffer, auth_key: &AuthKey) {
    let mut rnd = [0u8; 32];
    getrandom::getrandom(&mut rnd).expect("getrandom failed");
    encrypt_with_side(buffer, auth_key, &rnd, Side::Server);
}

/// Decrypt a client-originated envelope, i.e. the server side of
/// [`encrypt_data_v2`]. For tests and local peer emulation.
pub fn decrypt_client_data_v2<'a>(
    buffer: &'a mut [u8],
    auth_key: &AuthKey,
) -> Result<&'a mut [u8], DecryptError> {
    decrypt_with_side(buffer, auth_key, Side::Client)
}
