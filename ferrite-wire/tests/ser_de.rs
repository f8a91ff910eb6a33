use ferrite_wire::{Cursor, Deserializable, MsgId, RawVec, Serializable};

#[test]
fn ints_round_trip() {
    let mut buf = Vec::new();
    0x1234_5678i32.serialize(&mut buf);
    0xdead_beefu32.serialize(&mut buf);
    (-1i64).serialize(&mut buf);
    MsgId(7_000_000_001).serialize(&mut buf);

    let mut cur = Cursor::from_slice(&buf);
    assert_eq!(i32::deserialize(&mut cur).unwrap(), 0x1234_5678);
    assert_eq!(u32::deserialize(&mut cur).unwrap(), 0xdead_beef);
    assert_eq!(i64::deserialize(&mut cur).unwrap(), -1);
    assert_eq!(MsgId::deserialize(&mut cur).unwrap(), MsgId(7_000_000_001));
    assert_eq!(cur.remaining(), 0);
}

#[test]
fn short_bytes_are_one_byte_prefixed_and_padded() {
    let data: &[u8] = &[1, 2, 3, 4, 5];
    let wire = data.to_bytes();
    // 1 header byte + 5 data bytes + 2 padding bytes
    assert_eq!(wire.len(), 8);
    assert_eq!(wire[0], 5);
    assert_eq!(&wire[1..6], data);
    assert_eq!(&wire[6..], &[0, 0]);

    let mut cur = Cursor::from_slice(&wire);
    assert_eq!(Vec::<u8>::deserialize(&mut cur).unwrap(), data);
    assert_eq!(cur.remaining(), 0);
}

#[test]
fn long_bytes_use_the_extended_prefix() {
    let data = vec![0xabu8; 254];
    let wire = data.to_bytes();
    assert_eq!(wire[0], 0xfe);
    assert_eq!(wire[1], 254);
    assert_eq!(wire[2], 0);
    assert_eq!(wire[3], 0);
    // 4 header + 254 data + 2 padding
    assert_eq!(wire.len(), 260);

    let mut cur = Cursor::from_slice(&wire);
    assert_eq!(Vec::<u8>::deserialize(&mut cur).unwrap(), data);
    assert_eq!(cur.remaining(), 0);
}

#[test]
fn boundary_253_stays_short_form() {
    let data = vec![9u8; 253];
    let wire = data.to_bytes();
    assert_eq!(wire[0], 253);
    // 1 + 253 = 254, padded to 256
    assert_eq!(wire.len(), 256);
}

#[test]
fn boxed_and_bare_vectors() {
    let boxed = vec![1i32, 2, 3];
    let wire = boxed.to_bytes();
    assert_eq!(u32::from_le_bytes(wire[..4].try_into().unwrap()), 0x1cb5c415);

    let mut cur = Cursor::from_slice(&wire);
    assert_eq!(Vec::<i32>::deserialize(&mut cur).unwrap(), boxed);

    let bare = RawVec(vec![5i64, 6]);
    let wire = bare.to_bytes();
    // no constructor id, just the count
    assert_eq!(i32::from_le_bytes(wire[..4].try_into().unwrap()), 2);
    let mut cur = Cursor::from_slice(&wire);
    assert_eq!(RawVec::<i64>::deserialize(&mut cur).unwrap(), bare);
}

#[test]
fn truncated_input_reports_eof() {
    let mut cur = Cursor::from_slice(&[1, 2]);
    assert!(i32::deserialize(&mut cur).is_err());
}

#[test]
fn cursor_repositioning() {
    let buf = [0u8, 1, 2, 3, 4, 5, 6, 7];
    let mut cur = Cursor::from_slice(&buf);
    let _ = u32::deserialize(&mut cur).unwrap();
    assert_eq!(cur.pos(), 4);
    cur.set_pos(0);
    assert_eq!(cur.remaining(), 8);
    cur.set_pos(100);
    assert_eq!(cur.remaining(), 0);
}
