use std::time::Duration;

use ferrite_crypto::ObfuscationCipher;
use ferrite_net::{Connection, ConnectionState, InvocationError, TransportKind, derive_keys};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

async fn read_exact(stream: &mut DuplexStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn abridged_handshake_and_send() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::start(client, TransportKind::Abridged).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);

    // Init tag arrives first, exactly once.
    assert_eq!(read_exact(&mut server, 1).await, vec![0xef]);

    conn.send(vec![7u8; 16]).await.unwrap();
    assert_eq!(read_exact(&mut server, 1).await, vec![4]); // 16 bytes = 4 words
    assert_eq!(read_exact(&mut server, 16).await, vec![7u8; 16]);

    conn.send(vec![8u8; 8]).await.unwrap();
    assert_eq!(read_exact(&mut server, 1).await, vec![2]);
    assert_eq!(read_exact(&mut server, 8).await, vec![8u8; 8]);
}

#[tokio::test]
async fn intermediate_recv_delivers_framed_packets() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::start(client, TransportKind::Intermediate).await.unwrap();

    assert_eq!(read_exact(&mut server, 4).await, vec![0xee; 4]);

    let payload = vec![0x42u8; 100];
    server.write_all(&(payload.len() as u32).to_le_bytes()).await.unwrap();
    server.write_all(&payload).await.unwrap();

    let received = timeout(Duration::from_secs(1), conn.recv()).await.unwrap().unwrap();
    assert_eq!(received, payload);
}

#[tokio::test]
async fn peer_close_fails_recv_and_disconnects() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::start(client, TransportKind::Intermediate).await.unwrap();
    let _ = read_exact(&mut server, 4).await;

    drop(server);

    let err = timeout(Duration::from_secs(1), conn.recv()).await.unwrap();
    assert!(matches!(err, Err(InvocationError::NotConnected)));

    // The state settles on Disconnected and sends are refused.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(matches!(conn.send(vec![1]).await, Err(InvocationError::NotConnected)));
}

#[tokio::test]
async fn explicit_disconnect_wakes_a_parked_recv() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let conn =
        std::sync::Arc::new(Connection::start(client, TransportKind::Abridged).await.unwrap());
    let _ = read_exact(&mut server, 1).await;

    let parked = {
        let conn = std::sync::Arc::clone(&conn);
        tokio::spawn(async move { conn.recv().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!parked.is_finished());

    conn.disconnect();
    let res = timeout(Duration::from_secs(1), parked).await.unwrap().unwrap();
    assert!(matches!(res, Err(InvocationError::NotConnected)));
}

#[tokio::test]
async fn send_after_disconnect_is_refused() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::start(client, TransportKind::Abridged).await.unwrap();
    let _ = read_exact(&mut server, 1).await;

    conn.disconnect();
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(matches!(conn.send(vec![0; 4]).await, Err(InvocationError::NotConnected)));
    assert!(matches!(conn.recv().await, Err(InvocationError::NotConnected)));
}

#[tokio::test]
async fn transport_status_frame_ends_the_connection() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::start(client, TransportKind::Intermediate).await.unwrap();
    let _ = read_exact(&mut server, 4).await;

    // A 4-byte packet carrying a negative status.
    server.write_all(&4u32.to_le_bytes()).await.unwrap();
    server.write_all(&(-404i32).to_le_bytes()).await.unwrap();

    let err = timeout(Duration::from_secs(1), conn.recv()).await.unwrap();
    assert!(err.is_err());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn obfuscated_link_is_opaque_but_decipherable_by_the_peer() {
    let (client, mut server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::start(client, TransportKind::Obfuscated { secret: None })
        .await
        .unwrap();

    // The 64-byte handshake header comes first.
    let header = read_exact(&mut server, 64).await;
    let mut nonce = [0u8; 64];
    nonce.copy_from_slice(&header);
    let (enc_key, enc_iv, dec_key, dec_iv) = derive_keys(&nonce, None);

    // The peer's view of the client's send stream: same keys, but the
    // keystream already advanced over the 64 header bytes.
    let mut client_to_server = ObfuscationCipher::new(&enc_key, &enc_iv);
    client_to_server.apply(&mut [0u8; 64]);

    let payload = vec![0x5au8; 32];
    conn.send(payload.clone()).await.unwrap();

    // 1 length byte + 32 payload bytes, all XOR'd with the keystream.
    let mut wire = read_exact(&mut server, 33).await;
    assert_ne!(&wire[1..], payload.as_slice(), "payload must not be readable on the wire");
    client_to_server.apply(&mut wire);
    assert_eq!(wire[0] as usize, payload.len() / 4);
    assert_eq!(&wire[1..], payload.as_slice());

    // And the reverse direction: bytes the server enciphers with the
    // reversed-nonce keys come out of recv() in the clear.
    let mut server_to_client = ObfuscationCipher::new(&dec_key, &dec_iv);
    let reply = vec![0xa5u8; 16];
    let mut frame = vec![(reply.len() / 4) as u8];
    frame.extend_from_slice(&reply);
    server_to_client.apply(&mut frame);
    server.write_all(&frame).await.unwrap();

    let received = timeout(Duration::from_secs(1), conn.recv()).await.unwrap().unwrap();
    assert_eq!(received, reply);
}
