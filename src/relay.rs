//! Bidirectional splice between two byte streams.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default per-direction transfer buffer
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Bytes moved by one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Pipe `a` into `b` and `b` into `a` until either side reaches EOF or errors.
///
/// When one direction ends the other is abandoned, both write halves are
/// shut down and both streams are dropped, so neither peer is left half
/// open. I/O errors end the relay and are only logged.
pub async fn relay<A, B>(a: A, b: B, buffer_size: usize) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let buffer_size = buffer_size.max(1);
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut stats = RelayStats::default();
    {
        let forward = pump(&mut a_read, &mut b_write, buffer_size, &mut stats.a_to_b);
        let backward = pump(&mut b_read, &mut a_write, buffer_size, &mut stats.b_to_a);

        tokio::select! {
            result = forward => {
                if let Err(e) = result {
                    tracing::debug!("Relay a->b ended with error: {}", e);
                }
            }
            result = backward => {
                if let Err(e) = result {
                    tracing::debug!("Relay b->a ended with error: {}", e);
                }
            }
        }
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    tracing::debug!(
        a_to_b = stats.a_to_b,
        b_to_a = stats.b_to_a,
        "Relay closed"
    );
    stats
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, buffer_size: usize, moved: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *moved += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn bytes_flow_both_ways_until_eof() {
        let (mut client_a, relay_a) = duplex(1024);
        let (relay_b, mut client_b) = duplex(1024);

        let task = tokio::spawn(relay(relay_a, relay_b, 16));

        client_a.write_all(b"ping from a").await.unwrap();
        let mut buf = [0u8; 11];
        client_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping from a");

        client_b.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client_a);
        let stats = task.await.unwrap();
        assert_eq!(stats, RelayStats { a_to_b: 11, b_to_a: 4 });

        // The far side observes EOF once the near side went away
        let mut rest = Vec::new();
        client_b.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn large_payload_crosses_small_buffer_intact() {
        let (mut client_a, relay_a) = duplex(4096);
        let (relay_b, mut client_b) = duplex(4096);
        let task = tokio::spawn(relay(relay_a, relay_b, 7));

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                client_a.write_all(&payload).await.unwrap();
                client_a.shutdown().await.unwrap();
                client_a
            })
        };

        let mut received = Vec::new();
        client_b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);

        let _client_a = writer.await.unwrap();
        let stats = task.await.unwrap();
        assert_eq!(stats.a_to_b, payload.len() as u64);
    }
}
