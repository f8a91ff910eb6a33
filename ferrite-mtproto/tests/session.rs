use ferrite_crypto::{AuthKey, DequeBuffer, encrypt_server_data_v2};
use ferrite_mtproto::{DecryptError, Session};
use ferrite_wire::envelope::{GzipPacked, InvokeAfterMsg};
use ferrite_wire::MsgId;

fn test_key() -> AuthKey {
    let mut data = [0u8; 256];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(197).wrapping_add(3);
    }
    AuthKey::from_bytes(data)
}

/// Build a server-sealed frame addressed at `session`, bypassing the
/// client-side generator so msg ids and lengths can be forged.
fn server_frame(session: &Session, salt: i64, msg_id: i64, seq_no: i32, body: &[u8]) -> Vec<u8> {
    server_frame_with_len(session, salt, msg_id, seq_no, body, body.len() as u32)
}

fn server_frame_with_len(
    session: &Session,
    salt: i64,
    msg_id: i64,
    seq_no: i32,
    body: &[u8],
    declared_len: u32,
) -> Vec<u8> {
    let mut buf = DequeBuffer::with_capacity(32 + body.len(), 32);
    buf.extend(salt.to_le_bytes());
    buf.extend(session.session_id().to_le_bytes());
    buf.extend(msg_id.to_le_bytes());
    buf.extend(seq_no.to_le_bytes());
    buf.extend(declared_len.to_le_bytes());
    buf.extend(body.iter().copied());
    encrypt_server_data_v2(&mut buf, session.auth_key());
    buf.as_ref().to_vec()
}

// ── Message ids and sequence numbers ─────────────────────────────────────────

#[test]
fn msg_ids_strictly_increase() {
    let mut s = Session::new(test_key(), 0, 0);
    let mut prev = MsgId(0);
    for _ in 0..1000 {
        let id = s.next_msg_id();
        assert!(id > prev, "{id} must exceed {prev}");
        prev = id;
    }
}

#[test]
fn msg_id_high_bits_carry_the_clock() {
    let mut s = Session::new(test_key(), 0, 0);
    let before = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let id = s.next_msg_id();
    let secs = id.0 >> 32;
    assert!((secs - before).abs() <= 2, "id seconds {secs} far from clock {before}");
}

#[test]
fn content_seq_nos_are_odd_and_advance_by_two() {
    let mut s = Session::new(test_key(), 0, 0);
    let a = s.next_seq_no(true);
    let b = s.next_seq_no(true);
    let c = s.next_seq_no(true);
    assert_eq!(a % 2, 1);
    assert_eq!(b, a + 2);
    assert_eq!(c, b + 2);
}

#[test]
fn service_seq_nos_are_even_and_do_not_advance() {
    let mut s = Session::new(test_key(), 0, 0);
    assert_eq!(s.next_seq_no(false), 0);
    assert_eq!(s.next_seq_no(false), 0);
    let _ = s.next_seq_no(true);
    assert_eq!(s.next_seq_no(false), 2);
    assert_eq!(s.next_seq_no(false), 2);
}

// ── write_as_message ─────────────────────────────────────────────────────────

#[test]
fn small_bodies_are_framed_verbatim() {
    let mut s = Session::new(test_key(), 0, 0);
    let body = [0xadu8; 40];
    let mut buf = Vec::new();
    let msg_id = s.write_as_message(&mut buf, &body, true, None);

    assert_eq!(i64::from_le_bytes(buf[..8].try_into().unwrap()), msg_id.0);
    let len = i32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
    assert_eq!(len, body.len());
    assert_eq!(&buf[16..16 + len], &body);
}

#[test]
fn large_compressible_bodies_shrink_on_the_wire() {
    let mut s = Session::new(test_key(), 0, 0);
    let body = vec![0x20u8; 2000];
    let mut buf = Vec::new();
    s.write_as_message(&mut buf, &body, true, None);

    let len = i32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
    assert!(len < body.len(), "wire body {len} not smaller than {}", body.len());
    // And it must announce itself as gzip_packed.
    let ctor = u32::from_le_bytes(buf[16..20].try_into().unwrap());
    assert_eq!(ctor, GzipPacked::CONSTRUCTOR_ID);
}

#[test]
fn invoke_after_encodes_the_dependency_id() {
    let mut s = Session::new(test_key(), 0, 0);
    let mut buf = Vec::new();
    s.write_as_message(&mut buf, &[1, 2, 3, 4], true, Some(MsgId(0x0102_0304_0506_0708)));

    let ctor = u32::from_le_bytes(buf[16..20].try_into().unwrap());
    assert_eq!(ctor, InvokeAfterMsg::CONSTRUCTOR_ID);
    let after = i64::from_le_bytes(buf[20..28].try_into().unwrap());
    assert_eq!(after, 0x0102_0304_0506_0708);
    assert_eq!(&buf[28..32], &[1, 2, 3, 4]);
}

// ── Encrypt / decrypt ────────────────────────────────────────────────────────

#[test]
fn round_trip_through_a_server_sealed_frame() {
    let mut s = Session::new(test_key(), 0x1111, 0);
    let body = b"response payload".to_vec();
    let mut frame = server_frame(&s, 0x1111, 0x51e0_0000_0004, 1, &body);

    let msg = s.decrypt_frame(&mut frame).unwrap();
    assert_eq!(msg.msg_id, MsgId(0x51e0_0000_0004));
    assert_eq!(msg.seq_no, 1);
    assert_eq!(msg.body, body);
}

#[test]
fn outbound_frames_lead_with_key_id_and_are_block_aligned() {
    let mut s = Session::new(test_key(), 7, 0);
    let mut payload = Vec::new();
    s.write_as_message(&mut payload, &[0u8; 20], true, None);
    let wire = s.encrypt_frame(&payload);

    assert_eq!(&wire[..8], &s.auth_key().key_id());
    assert_eq!((wire.len() - 24) % 16, 0);
}

#[test]
fn frames_adopt_a_non_zero_salt() {
    let mut s = Session::new(test_key(), 0, 0);
    let mut frame = server_frame(&s, 0xbeef, 0x51e0_0000_0008, 1, &[0u8; 8]);
    s.decrypt_frame(&mut frame).unwrap();
    assert_eq!(s.salt, 0xbeef);
}

#[test]
fn duplicate_msg_id_is_rejected() {
    let mut s = Session::new(test_key(), 0, 0);
    let mut first = server_frame(&s, 0, 0x51e0_0000_0004, 1, &[1, 2, 3, 4]);
    s.decrypt_frame(&mut first).unwrap();

    let mut again = server_frame(&s, 0, 0x51e0_0000_0004, 3, &[5, 6, 7, 8]);
    assert_eq!(s.decrypt_frame(&mut again), Err(DecryptError::DuplicateMsgId));
}

#[test]
fn wrong_session_id_is_rejected() {
    let key = test_key();
    let sender = Session::new(key.clone(), 0, 0);
    let mut receiver = Session::new(key, 0, 0);
    // Frames carry the sender's (different, random) session id.
    let mut frame = server_frame(&sender, 0, 0x51e0_0000_0004, 1, &[0u8; 4]);
    assert_eq!(receiver.decrypt_frame(&mut frame), Err(DecryptError::SessionMismatch));
}

#[test]
fn overlong_declared_body_is_bad_padding() {
    let mut s = Session::new(test_key(), 0, 0);
    // Declared length runs past the actual plaintext.
    let mut frame = server_frame_with_len(&s, 0, 0x51e0_0000_0004, 1, &[0u8; 16], 4096);
    assert_eq!(s.decrypt_frame(&mut frame), Err(DecryptError::BadPadding));
}

#[test]
fn understated_declared_body_is_bad_padding() {
    let mut s = Session::new(test_key(), 0, 0);
    // Declaring 0 of 1040 real body bytes implies > 1024 bytes of padding.
    let mut frame = server_frame_with_len(&s, 0, 0x51e0_0000_0004, 1, &[0u8; 1040], 0);
    assert_eq!(s.decrypt_frame(&mut frame), Err(DecryptError::BadPadding));
}

#[test]
fn rejected_frames_do_not_poison_the_duplicate_window() {
    let mut s = Session::new(test_key(), 0, 0);
    let mut bad = server_frame_with_len(&s, 0, 0x51e0_0000_0004, 1, &[0u8; 16], 4096);
    assert!(s.decrypt_frame(&mut bad).is_err());

    // The same id must still be accepted once a valid frame carries it.
    let mut good = server_frame(&s, 0, 0x51e0_0000_0004, 1, &[9, 9, 9, 9]);
    assert!(s.decrypt_frame(&mut good).is_ok());
}

// ── Offset correction and reset ──────────────────────────────────────────────

#[test]
fn update_time_offset_tracks_a_confirmed_id() {
    let mut s = Session::new(test_key(), 0, 0);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    // A server id stamped 300 seconds ahead of our clock.
    let confirmed = MsgId((now + 300) << 32);
    let offset = s.update_time_offset(confirmed);
    assert!((299..=301).contains(&offset), "offset {offset} not near 300");

    // Ids issued afterwards must reflect the corrected clock.
    let id = s.next_msg_id();
    assert!((id.0 >> 32) >= now + 299);
}

#[test]
fn reset_starts_a_fresh_generation() {
    let mut s = Session::new(test_key(), 0, 0);
    let old_id = s.session_id();
    let _ = s.next_seq_no(true);
    let _ = s.next_msg_id();

    let mut frame = server_frame(&s, 0, 0x51e0_0000_0004, 1, &[0u8; 4]);
    s.decrypt_frame(&mut frame).unwrap();

    s.reset();
    assert_ne!(s.session_id(), old_id);
    assert_eq!(s.next_seq_no(false), 0);

    // The duplicate window is gone: an id seen before reset passes again
    // (re-sealed for the new session id).
    let mut frame = server_frame(&s, 0, 0x51e0_0000_0004, 1, &[0u8; 4]);
    assert!(s.decrypt_frame(&mut frame).is_ok());
}
