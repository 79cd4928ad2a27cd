//! Ingest-to-viewer relay
//!
//! A single UDP ingest loop parses RTP packets and hands each one to the
//! broadcaster, which writes it to every sink in the shared registry.

mod broadcast;
mod ingest;
mod registry;

pub use broadcast::{Broadcaster, DELIVERY_TIMEOUT};
pub use ingest::{parse_packet, IngestListener, MAX_DATAGRAM_SIZE};
pub use registry::{SinkId, SinkRegistry};
