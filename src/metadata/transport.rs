use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::error::FetchError;
use super::message::{encode_extended, Handshake, PeerMessage, HANDSHAKE_LEN};

const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Deadline-bounded framing over a peer connection. Every individual read
/// and write carries its own deadline.
pub struct Transport<S> {
    stream: S,
    read_buf: BytesMut,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    pub fn new(stream: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
            read_timeout,
            write_timeout,
        }
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), FetchError> {
        self.write(&handshake.encode()).await
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake, FetchError> {
        self.fill(HANDSHAKE_LEN).await?;
        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    pub async fn send_extended(&mut self, ext_id: u8, payload: &[u8]) -> Result<(), FetchError> {
        self.write(&encode_extended(ext_id, payload)).await
    }

    pub async fn receive_message(&mut self) -> Result<PeerMessage, FetchError> {
        self.fill(4).await?;
        let length = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(FetchError::Protocol(format!(
                "message too large: {}",
                length
            )));
        }

        self.fill(4 + length).await?;
        let _ = self.read_buf.split_to(4);
        let body: Bytes = self.read_buf.split_to(length).freeze();
        PeerMessage::decode(body)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), FetchError> {
        timeout(self.write_timeout, self.stream.write_all(data))
            .await
            .map_err(|_| FetchError::Timeout)??;
        Ok(())
    }

    async fn fill(&mut self, len: usize) -> Result<(), FetchError> {
        while self.read_buf.len() < len {
            let n = timeout(self.read_timeout, self.stream.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| FetchError::Timeout)??;

            if n == 0 {
                return Err(FetchError::ConnectionClosed);
            }
        }
        Ok(())
    }
}
