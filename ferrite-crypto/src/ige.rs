//! AES-256 in IGE (Infinite Garble Extension) block mode.
//!
//! IGE chains both the previous ciphertext and the previous plaintext block
//! into each encryption:
//!
//! ```text
//! c[i] = E(p[i] xor c[i-1]) xor p[i-1]
//! p[i] = D(c[i] xor p[i-1]) xor c[i-1]
//! ```
//!
//! The 32-byte IV supplies `c[0]` (first half) and `p[0]` (second half).

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};

const BLOCK: usize = 16;

/// Encrypt `data` in place. The length must be a multiple of 16.
pub fn ige_encrypt(data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    assert!(data.len() % BLOCK == 0, "IGE input must be block-aligned");
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher: [u8; BLOCK] = iv[..BLOCK].try_into().unwrap();
    let mut prev_plain: [u8; BLOCK] = iv[BLOCK..].try_into().unwrap();

    for chunk in data.chunks_exact_mut(BLOCK) {
        let plain: [u8; BLOCK] = (&*chunk).try_into().unwrap();
        for (b, p) in chunk.iter_mut().zip(prev_cipher) {
            *b ^= p;
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        for (b, p) in chunk.iter_mut().zip(prev_plain) {
            *b ^= p;
        }
        prev_cipher.copy_from_slice(chunk);
        prev_plain = plain;
    }
}

/// Decrypt `data` in place. The length must be a multiple of 16.
pub fn ige_decrypt(data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    assert!(data.len() % BLOCK == 0, "IGE input must be block-aligned");
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher: [u8; BLOCK] = iv[..BLOCK].try_into().unwrap();
    let mut prev_plain: [u8; BLOCK] = iv[BLOCK..].try_into().unwrap();

    for chunk in data.chunks_exact_mut(BLOCK) {
        let encrypted: [u8; BLOCK] = (&*chunk).try_into().unwrap();
        for (b, p) in chunk.iter_mut().zip(prev_plain) {
            *b ^= p;
        }
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        for (b, p) in chunk.iter_mut().zip(prev_cipher) {
            *b ^= p;
        }
        prev_plain.copy_from_slice(chunk);
        prev_cipher = encrypted;
    }
}
