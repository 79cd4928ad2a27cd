//! Fan-out of ingested packets to every registered sink

use super::SinkRegistry;
use crate::error::SinkError;
use crate::media::Packet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Log fan-out progress once per this many packets
const LOG_EVERY: u64 = 300;

/// Longest a single sink may hold up one packet's fan-out
pub const DELIVERY_TIMEOUT: Duration = Duration::from_millis(20);

pub struct Broadcaster {
    registry: Arc<SinkRegistry>,
    packet_count: AtomicU64,
}

impl Broadcaster {
    pub fn new(registry: Arc<SinkRegistry>) -> Self {
        Self {
            registry,
            packet_count: AtomicU64::new(0),
        }
    }

    /// Deliver one packet to every sink currently registered.
    ///
    /// Must be called in ingest order; returns once every delivery attempt
    /// finished or hit [`DELIVERY_TIMEOUT`]. A failing or stalled sink is
    /// logged and skipped. Returns the number of sinks that accepted the
    /// packet.
    pub async fn on_packet(&self, packet: &Packet) -> usize {
        let packet_count = self.packet_count.fetch_add(1, Ordering::Relaxed) + 1;
        let delivered = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        let (delivered_ref, failed_ref) = (&delivered, &failed);
        self.registry
            .for_each(move |sink_id, sink| async move {
                let written = tokio::time::timeout(DELIVERY_TIMEOUT, sink.write_packet(packet))
                    .await
                    .unwrap_or(Err(SinkError::Timeout(DELIVERY_TIMEOUT)));

                match written {
                    Ok(()) => {
                        delivered_ref.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(SinkError::Closed) => {
                        failed_ref.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Sink {} closed, skipping", sink_id);
                    }
                    Err(e @ SinkError::Timeout(_)) => {
                        failed_ref.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Sink {} stalled, skipping: {}", sink_id, e);
                    }
                    Err(e) => {
                        failed_ref.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Failed to forward RTP to sink {}: {}", sink_id, e);
                    }
                }
            })
            .await;

        let delivered = delivered.into_inner();

        if packet_count % LOG_EVERY == 1 {
            tracing::debug!(
                "Forwarded packet {} (seq: {}, ts: {}, payload: {} bytes) to {} sinks, {} failed",
                packet_count,
                packet.header.sequence_number,
                packet.header.timestamp,
                packet.payload.len(),
                delivered,
                failed.into_inner()
            );
        }

        delivered
    }

    /// Number of packets handed to [`Broadcaster::on_packet`] so far
    pub fn packet_count(&self) -> u64 {
        self.packet_count.load(Ordering::Relaxed)
    }
}
