//! Per-connection session state.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use ferrite_crypto::{AuthKey, DequeBuffer, decrypt_data_v2, encrypt_data_v2};
use ferrite_wire::envelope::{GzipPacked, InvokeAfterMsg, Message};
use ferrite_wire::{MsgId, Serializable};

/// How many inbound message ids are remembered for duplicate detection.
const RECENT_MSG_ID_WINDOW: usize = 500;

/// Errors that can occur when decrypting and validating a server frame.
///
/// Every variant is fatal to the offending frame; the session itself stays
/// usable (a duplicate or mismatched frame is dropped, not retried).
#[derive(Clone, Debug, PartialEq)]
pub enum DecryptError {
    /// The crypto layer rejected the envelope.
    Crypto(ferrite_crypto::DecryptError),
    /// The decrypted plaintext is too short to hold a frame header.
    FrameTooShort,
    /// The frame carries a different session id (wrong connection or replay).
    SessionMismatch,
    /// The frame's message id was already seen in the recent window.
    DuplicateMsgId,
    /// The declared body length leaves an implausible amount of padding.
    BadPadding,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crypto(e) => write!(f, "crypto: {e}"),
            Self::FrameTooShort => write!(f, "inner plaintext too short"),
            Self::SessionMismatch => write!(f, "session_id mismatch"),
            Self::DuplicateMsgId => write!(f, "duplicate msg_id"),
            Self::BadPadding => write!(f, "padding outside 12..=1024 bytes"),
        }
    }
}

impl std::error::Error for DecryptError {}

impl From<ferrite_crypto::DecryptError> for DecryptError {
    fn from(e: ferrite_crypto::DecryptError) -> Self {
        Self::Crypto(e)
    }
}

/// Encrypted session state for one connection generation.
///
/// Tracks the session id, the rolling sequence counter, the last issued
/// message id, the clock offset against the server, and the window of
/// recently seen inbound ids. All mutation happens through two call paths:
/// the outbound flush ([`Session::write_as_message`] + [`Session::encrypt_frame`])
/// and the inbound decode ([`Session::decrypt_frame`] +
/// [`Session::update_time_offset`]).
pub struct Session {
    auth_key: AuthKey,
    session_id: i64,
    sequence: i32,
    last_msg_id: i64,
    time_offset: i32,
    recent_msg_ids: VecDeque<i64>,
    /// Current server salt included in outgoing frames. Adopted from
    /// decrypted frames and from salt-bearing service messages.
    pub salt: i64,
}

impl Session {
    /// Create a fresh session around an established key.
    pub fn new(auth_key: AuthKey, first_salt: i64, time_offset: i32) -> Self {
        Self {
            auth_key,
            session_id: random_i64(),
            sequence: 0,
            last_msg_id: 0,
            time_offset,
            recent_msg_ids: VecDeque::with_capacity(RECENT_MSG_ID_WINDOW),
            salt: first_salt,
        }
    }

    /// The current session id.
    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// The authorization key this session encrypts with.
    pub fn auth_key(&self) -> &AuthKey {
        &self.auth_key
    }

    /// Current clock offset against the server, in seconds.
    pub fn time_offset(&self) -> i32 {
        self.time_offset
    }

    /// Start a new session generation: fresh random id, zeroed counters,
    /// empty duplicate window. The auth key and clock offset survive.
    ///
    /// Used on reconnect; never mutate a generation incrementally.
    pub fn reset(&mut self) {
        self.session_id = random_i64();
        self.sequence = 0;
        self.last_msg_id = 0;
        self.recent_msg_ids.clear();
        log::debug!("session reset, new id {}", self.session_id);
    }

    /// Allocate the next message id.
    ///
    /// The high 32 bits carry epoch seconds corrected by the known offset;
    /// the low bits carry sub-second precision shifted left twice. If the
    /// clock-derived candidate does not exceed the previous id, the previous
    /// id is bumped by 4 instead.
    pub fn next_msg_id(&mut self) -> MsgId {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let secs = (now.as_secs() as i64) + i64::from(self.time_offset);
        let nanos = i64::from(now.subsec_nanos());

        let mut id = (secs << 32) | (nanos << 2);
        if self.last_msg_id >= id {
            id = self.last_msg_id + 4;
        }
        self.last_msg_id = id;
        MsgId(id)
    }

    /// The next sequence number.
    ///
    /// Content-related messages take `2n + 1` and advance the counter;
    /// anything else reads `2n` and leaves it alone.
    pub fn next_seq_no(&mut self, content_related: bool) -> i32 {
        if content_related {
            let seq = self.sequence * 2 + 1;
            self.sequence += 1;
            seq
        } else {
            self.sequence * 2
        }
    }

    /// Nudge the sequence counter after a server complaint about sequence
    /// drift (error codes 32 / 33).
    pub fn adjust_sequence(&mut self, delta: i32) {
        self.sequence += delta;
    }

    /// Serialize `body` as a framed message into `buf` and return the id
    /// assigned to it.
    ///
    /// When `after` is given the body is wrapped so the server serializes
    /// its side effects behind that message. Content-related bodies above
    /// the compression threshold travel gzip-wrapped when that is smaller.
    pub fn write_as_message(
        &mut self,
        buf: &mut Vec<u8>,
        body: &[u8],
        content_related: bool,
        after: Option<MsgId>,
    ) -> MsgId {
        let msg_id = self.next_msg_id();
        let seq_no = self.next_seq_no(content_related);

        let body = match after {
            Some(after_id) => {
                GzipPacked::gzip_if_smaller(content_related, InvokeAfterMsg::wrap(after_id, body))
            }
            None => GzipPacked::gzip_if_smaller(content_related, body.to_vec()),
        };

        msg_id.serialize(buf);
        seq_no.serialize(buf);
        (body.len() as i32).serialize(buf);
        buf.extend_from_slice(&body);
        msg_id
    }

    /// Encrypt an already-framed payload into a wire-ready envelope.
    ///
    /// Prepends `salt ‖ session_id`, pads, and seals:
    /// the result is `key_id ‖ msg_key ‖ ciphertext`.
    pub fn encrypt_frame(&mut self, payload: &[u8]) -> Vec<u8> {
        // Front capacity holds the 32-byte key_id + msg_key header.
        let mut buf = DequeBuffer::with_capacity(16 + payload.len(), 32);
        buf.extend(self.salt.to_le_bytes());
        buf.extend(self.session_id.to_le_bytes());
        buf.extend(payload.iter().copied());

        encrypt_data_v2(&mut buf, &self.auth_key);
        buf.as_ref().to_vec()
    }

    /// Decrypt an inbound envelope and validate it against the session.
    ///
    /// Checks, in order: buffer shape and key id (crypto layer), msg_key
    /// integrity (crypto layer), header length, session id, duplicate
    /// message id, and the implied padding length (12..=1024 bytes). The
    /// frame's salt, when non-zero, is adopted as the current salt.
    pub fn decrypt_frame(&mut self, frame: &mut [u8]) -> Result<Message, DecryptError> {
        let plaintext = decrypt_data_v2(frame, &self.auth_key)?;

        // salt(8) + session_id(8) + msg_id(8) + seq_no(4) + len(4)
        if plaintext.len() < 32 {
            return Err(DecryptError::FrameTooShort);
        }

        let salt = i64::from_le_bytes(plaintext[..8].try_into().unwrap());
        let session_id = i64::from_le_bytes(plaintext[8..16].try_into().unwrap());
        let msg_id = i64::from_le_bytes(plaintext[16..24].try_into().unwrap());
        let seq_no = i32::from_le_bytes(plaintext[24..28].try_into().unwrap());
        let body_len = u32::from_le_bytes(plaintext[28..32].try_into().unwrap()) as usize;

        if session_id != self.session_id {
            log::warn!("rejecting frame for session {session_id} (ours is {})", self.session_id);
            return Err(DecryptError::SessionMismatch);
        }

        if self.recent_msg_ids.contains(&msg_id) {
            log::warn!("rejecting duplicate msg_id {msg_id}");
            return Err(DecryptError::DuplicateMsgId);
        }

        let padding = plaintext
            .len()
            .checked_sub(32 + body_len)
            .ok_or(DecryptError::BadPadding)?;
        if !(12..=1024).contains(&padding) {
            return Err(DecryptError::BadPadding);
        }

        if self.recent_msg_ids.len() >= RECENT_MSG_ID_WINDOW {
            self.recent_msg_ids.pop_front();
        }
        self.recent_msg_ids.push_back(msg_id);

        if salt != 0 {
            self.salt = salt;
        }

        Ok(Message {
            msg_id: MsgId(msg_id),
            seq_no,
            body: plaintext[32..32 + body_len].to_vec(),
        })
    }

    /// Re-derive the clock offset from a server-confirmed message id.
    ///
    /// When the offset changes, the last issued id is cleared so the next
    /// one is generated fresh from the corrected clock.
    pub fn update_time_offset(&mut self, correct_msg_id: MsgId) -> i32 {
        let old = self.time_offset;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let correct = correct_msg_id.0 >> 32;
        self.time_offset = (correct - now) as i32;

        if self.time_offset != old {
            self.last_msg_id = 0;
            log::debug!(
                "time offset corrected from {old}s to {}s (confirmed id {correct_msg_id})",
                self.time_offset
            );
        }

        self.time_offset
    }

    /// The local wall-clock second a message id was generated at, undoing
    /// the session's offset. `None` before any id has been issued.
    pub fn msg_id_time_local(&self, msg_id: MsgId) -> Option<i64> {
        if self.last_msg_id == 0 {
            return None;
        }
        Some((msg_id.0 >> 32) - i64::from(self.time_offset))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("sequence", &self.sequence)
            .field("time_offset", &self.time_offset)
            .finish_non_exhaustive()
    }
}

fn random_i64() -> i64 {
    let mut b = [0u8; 8];
    getrandom::getrandom(&mut b).expect("getrandom");
    i64::from_le_bytes(b)
}
