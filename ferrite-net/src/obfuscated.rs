//! The obfuscation layer: a keystream wrapped around the packet codec.
//!
//! A 64-byte random handshake header seeds an AES-CTR keystream for each
//! direction. The header travels mostly in the clear (it *is* the key
//! material); only its tail, which carries the protocol tag, is encrypted.
//! Every byte after the header is XOR'd with the keystream, making the
//! stream indistinguishable from noise to on-path inspection.

use ferrite_crypto::{ObfuscationCipher, sha256};

/// Handshake state for one obfuscated connection.
pub struct Obfuscation {
    header: [u8; 64],
    enc: ObfuscationCipher,
    dec: ObfuscationCipher,
}

impl Obfuscation {
    /// Build a fresh handshake embedding the codec's 4-byte protocol `tag`.
    ///
    /// `secret` is mixed into the key derivation when talking to an
    /// obfuscation-aware proxy.
    pub fn new(tag: [u8; 4], secret: Option<&[u8; 16]>) -> Self {
        let mut nonce = [0u8; 64];
        getrandom::getrandom(&mut nonce).expect("getrandom");
        nonce[56..60].copy_from_slice(&tag);

        let (enc_key, enc_iv, dec_key, dec_iv) = derive_keys(&nonce, secret);
        let mut enc = ObfuscationCipher::new(&enc_key, &enc_iv);
        let dec = ObfuscationCipher::new(&dec_key, &dec_iv);

        // Encrypt a full copy so the keystream position stays aligned with
        // the bytes actually sent, then splice in the encrypted tail.
        let mut encrypted = nonce;
        enc.apply(&mut encrypted);
        let mut header = nonce;
        header[56..].copy_from_slice(&encrypted[56..]);

        Self { header, enc, dec }
    }

    /// The 64 bytes to transmit before any framed packet.
    pub fn header(&self) -> &[u8; 64] {
        &self.header
    }

    /// Split into the header plus one cipher per direction.
    pub fn into_parts(self) -> ([u8; 64], ObfuscationCipher, ObfuscationCipher) {
        (self.header, self.enc, self.dec)
    }
}

impl std::fmt::Debug for Obfuscation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Obfuscation")
    }
}

/// Derive `(enc_key, enc_iv, dec_key, dec_iv)` from a handshake nonce.
///
/// The send direction keys off `nonce[8..40]` / `nonce[40..56]`; the
/// receive direction uses the same slices of the byte-reversed nonce.
/// Public so a peer (or a test harness) can derive the mirror ciphers from
/// a received header.
pub fn derive_keys(
    nonce: &[u8; 64],
    secret: Option<&[u8; 16]>,
) -> ([u8; 32], [u8; 16], [u8; 32], [u8; 16]) {
    let (enc_key, enc_iv) = derive_one(&nonce[8..40], &nonce[40..56], secret);

    let mut reversed = *nonce;
    reversed[8..56].reverse();
    let (dec_key, dec_iv) = derive_one(&reversed[8..40], &reversed[40..56], secret);

    (enc_key, enc_iv, dec_key, dec_iv)
}

fn derive_one(key_src: &[u8], iv_src: &[u8], secret: Option<&[u8; 16]>) -> ([u8; 32], [u8; 16]) {
    let mut key = [0u8; 32];
    match secret {
        Some(s) => key.copy_from_slice(&sha256!(key_src, s)),
        None => key.copy_from_slice(key_src),
    }
    let mut iv = [0u8; 16];
    iv.copy_from_slice(iv_src);
    (key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_keeps_key_material_clear_and_hides_the_tag() {
        let obf = Obfuscation::new([0xef; 4], None);
        let header = obf.header();
        // Bytes 8..56 are the key material the peer derives from; they must
        // travel unmodified. The tag itself must not appear in the clear.
        assert_ne!(&header[56..60], &[0xef; 4]);

        let mut nonce = [0u8; 64];
        nonce.copy_from_slice(header);
        let (rebuilt_key, ..) = derive_keys(&nonce, None);
        assert_eq!(&rebuilt_key[..], &header[8..40]);
    }

    #[test]
    fn peer_can_recover_the_tag_from_the_header() {
        let obf = Obfuscation::new([0xee; 4], None);
        let (header, _, _) = obf.into_parts();

        // The peer derives the same send-direction keystream from the clear
        // part of the header and decrypts the tail.
        let mut nonce = [0u8; 64];
        nonce.copy_from_slice(&header);
        let (enc_key, enc_iv, _, _) = derive_keys(&nonce, None);
        let mut cipher = ObfuscationCipher::new(&enc_key, &enc_iv);
        let mut copy = header;
        cipher.apply(&mut copy);
        assert_eq!(&copy[56..60], &[0xee; 4]);
    }

    #[test]
    fn secret_changes_the_derived_keys() {
        let nonce = [0x42u8; 64];
        let (plain_key, ..) = derive_keys(&nonce, None);
        let (secret_key, ..) = derive_keys(&nonce, Some(&[9u8; 16]));
        assert_ne!(plain_key, secret_key);
    }

    #[test]
    fn directions_use_distinct_keystreams() {
        let obf = Obfuscation::new([0xef; 4], None);
        let (_, mut enc, mut dec) = obf.into_parts();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        enc.apply(&mut a);
        dec.apply(&mut b);
        assert_ne!(a, b);
    }
}
