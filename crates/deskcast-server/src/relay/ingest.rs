//! UDP ingest of the upstream RTP/VP8 stream

use super::Broadcaster;
use crate::error::IngestError;
use crate::media::Packet;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use webrtc::util::marshal::Unmarshal;

/// Largest datagram accepted on the ingest socket
pub const MAX_DATAGRAM_SIZE: usize = 1600;

const RTP_HEADER_LEN: usize = 12;

/// Pause after a failed receive so a broken socket cannot spin the loop
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Repeated ingest problems are logged on the first occurrence and then
/// once per this many
const LOG_EVERY: u64 = 100;

fn should_log(count: u64) -> bool {
    count == 1 || count % LOG_EVERY == 0
}

/// Parse one datagram into an RTP packet
pub fn parse_packet(datagram: &[u8]) -> Result<Packet, IngestError> {
    if datagram.len() < RTP_HEADER_LEN {
        return Err(IngestError::TooShort(datagram.len()));
    }

    let version = datagram[0] >> 6;
    if version != 2 {
        return Err(IngestError::Version(version));
    }

    let mut raw = datagram;
    Ok(Packet::unmarshal(&mut raw)?)
}

pub struct IngestListener {
    socket: UdpSocket,
}

impl IngestListener {
    /// Bind the ingest socket. Failure here is fatal for the process.
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind RTP ingest on {}", addr))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive datagrams until `shutdown` fires, broadcasting each good packet
    pub async fn run(self, broadcaster: Arc<Broadcaster>, shutdown: CancellationToken) {
        tracing::info!("Receiving RTP on {:?}", self.socket.local_addr());

        // One spare byte so an oversized datagram shows up as such instead of truncated
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        let mut dropped = 0u64;
        let mut recv_errors = 0u64;

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            let len = match received {
                Ok((len, _)) => len,
                Err(e) => {
                    recv_errors += 1;
                    if should_log(recv_errors) {
                        tracing::error!("UDP receive error ({} so far): {}", recv_errors, e);
                    }
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    continue;
                }
            };

            if len > MAX_DATAGRAM_SIZE {
                dropped += 1;
                if should_log(dropped) {
                    tracing::warn!("Discarding oversized ingest datagram ({} so far)", dropped);
                }
                continue;
            }

            match parse_packet(&buf[..len]) {
                Ok(packet) => {
                    broadcaster.on_packet(&packet).await;
                }
                Err(e) => {
                    dropped += 1;
                    if should_log(dropped) {
                        tracing::warn!("Discarding ingest datagram ({} so far): {}", dropped, e);
                    }
                }
            }
        }

        tracing::info!("RTP ingest stopped");
    }
}
