//! AES-256-CTR keystream used by the obfuscated transport layer.

use aes::Aes256;
use aes::cipher::{KeyIvInit, StreamCipher};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// A rolling AES-CTR keystream applied to every byte of one direction of an
/// obfuscated connection.
///
/// The same construction serves both directions; each direction owns its own
/// cipher instance so the keystream positions advance independently.
pub struct ObfuscationCipher {
    inner: Aes256Ctr,
}

impl ObfuscationCipher {
    /// Create a cipher from a 32-byte key and 16-byte IV.
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Self {
        Self { inner: Aes256Ctr::new(key.into(), iv.into()) }
    }

    /// XOR `data` in place with the next bytes of the keystream.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }
}

impl std::fmt::Debug for ObfuscationCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ObfuscationCipher")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cipher_with_same_key_undoes_the_stream() {
        let key = [0xabu8; 32];
        let iv = [0x01u8; 16];
        let original = b"obfuscated transport payload".to_vec();

        let mut data = original.clone();
        ObfuscationCipher::new(&key, &iv).apply(&mut data);
        assert_ne!(data, original);
        ObfuscationCipher::new(&key, &iv).apply(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn keystream_position_advances_across_calls() {
        let key = [1u8; 32];
        let iv = [2u8; 16];

        // One cipher over 32 bytes must equal two 16-byte applications.
        let mut whole = [0u8; 32];
        ObfuscationCipher::new(&key, &iv).apply(&mut whole);

        let mut split = [0u8; 32];
        let mut cipher = ObfuscationCipher::new(&key, &iv);
        cipher.apply(&mut split[..16]);
        cipher.apply(&mut split[16..]);
        assert_eq!(whole, split);
    }
}
