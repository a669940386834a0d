use std::io;
use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::trace;
use crate::error::{QueueConnError, QueueConnResult};

/// The already-negotiated, unreliable datagram connection to the peer. This is an abstraction
///  over the actual socket, introduced to facilitate mocking the I/O part away for testing.
///
/// Implementations must preserve datagram boundaries: one `send` is one `recv` on the other
///  side (or nothing, if the datagram is lost).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramTransport: Send + Sync + 'static {
    async fn send(&self, datagram: &[u8]) -> io::Result<usize>;

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A UDP socket that is `connect`ed to the peer
#[async_trait]
impl DatagramTransport for UdpSocket {
    async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, datagram).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }
}

/// The write half shared by the send loop and the NACK requester. Writes are serialized so
///  datagrams from different writers never interleave, and a partial write is reported as an
///  error.
#[derive(Clone)]
pub struct SendPipeline {
    transport: Arc<dyn DatagramTransport>,
    write_lock: Arc<Mutex<()>>,
}

impl SendPipeline {
    pub fn new(transport: Arc<dyn DatagramTransport>) -> SendPipeline {
        SendPipeline {
            transport,
            write_lock: Default::default(),
        }
    }

    pub async fn send_datagram(&self, datagram: &[u8]) -> QueueConnResult<()> {
        let _guard = self.write_lock.lock().await;

        let written = self.transport.send(datagram).await?;
        if written != datagram.len() {
            return Err(QueueConnError::ShortWrite { written, expected: datagram.len() });
        }
        trace!("sent datagram of {} bytes", written);
        Ok(())
    }
}
