//! A duplex-backed stand-in for a remote Apple TV / HomePod peer.

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// One side of an in-memory duplex pair, playing the role of the remote
/// device. Tests hold the `MockApplePeer` and hand the paired
/// `DuplexStream` to the code under test as if it were a `TcpStream`.
pub struct MockApplePeer {
    stream: DuplexStream,
}

impl MockApplePeer {
    /// Create a connected pair: `(peer, client_side)`. Give `client_side`
    /// to the connection code under test.
    #[must_use]
    pub fn pair(max_buf_size: usize) -> (Self, DuplexStream) {
        let (peer_side, client_side) = tokio::io::duplex(max_buf_size);
        (
            Self {
                stream: peer_side,
            },
            client_side,
        )
    }

    /// Read exactly `len` bytes sent by the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the duplex pair is closed before `len` bytes
    /// arrive.
    pub async fn read_exact(&mut self, len: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Write a canned response to the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the duplex pair is closed.
    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[tokio::test]
    async fn relays_bytes_both_directions() {
        let (mut peer, mut client) = MockApplePeer::pair(1024);

        client.write_all(b"hello").await.unwrap();
        let received = peer.read_exact(5).await.unwrap();
        assert_eq!(&received, b"hello");

        peer.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }
}
