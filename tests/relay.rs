//! Both ends of a relay go away when either one closes.

mod common;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use throttle_bridge::relay::{DEFAULT_BUFFER_SIZE, relay};

use common::within;

/// Two connected TCP pairs: (outer_a, inner_a) and (inner_b, outer_b).
/// The relay gets the inner ends.
async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

#[tokio::test]
async fn closing_a_closes_b() {
    let (mut outer_a, inner_a) = socket_pair().await;
    let (inner_b, mut outer_b) = socket_pair().await;
    let task = tokio::spawn(relay(inner_a, inner_b, DEFAULT_BUFFER_SIZE));

    outer_a.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    within(outer_b.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"hello");

    drop(outer_a);

    let mut rest = Vec::new();
    let n = within(outer_b.read_to_end(&mut rest)).await.unwrap_or(0);
    assert_eq!(n, 0);
    let stats = within(task).await.unwrap();
    assert_eq!(stats.a_to_b, 5);
}

#[tokio::test]
async fn closing_b_closes_a() {
    let (mut outer_a, inner_a) = socket_pair().await;
    let (inner_b, mut outer_b) = socket_pair().await;
    let task = tokio::spawn(relay(inner_a, inner_b, DEFAULT_BUFFER_SIZE));

    outer_b.write_all(b"reply").await.unwrap();
    let mut buf = [0u8; 5];
    within(outer_a.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"reply");

    drop(outer_b);

    let mut rest = Vec::new();
    let n = within(outer_a.read_to_end(&mut rest)).await.unwrap_or(0);
    assert_eq!(n, 0);
    let stats = within(task).await.unwrap();
    assert_eq!(stats.b_to_a, 5);
}

#[tokio::test]
async fn half_close_tears_down_both_directions() {
    let (mut outer_a, inner_a) = socket_pair().await;
    let (inner_b, mut outer_b) = socket_pair().await;
    let task = tokio::spawn(relay(inner_a, inner_b, 8));

    // A only shuts its write side; the relay still closes B's socket
    outer_a.shutdown().await.unwrap();

    let mut rest = Vec::new();
    within(outer_b.read_to_end(&mut rest)).await.unwrap();
    assert!(rest.is_empty());
    within(task).await.unwrap();

    // and A observes EOF as well
    let mut rest = Vec::new();
    let n = within(outer_a.read_to_end(&mut rest)).await.unwrap_or(0);
    assert_eq!(n, 0);
}
