//! Packet routing by flags and stream id.

use tracing::debug;

use super::{Packet, PacketFlags, PacketWriter};
use crate::SourceId;

struct Route {
    writer: Box<dyn PacketWriter + Send>,
    flags: PacketFlags,
    source: Option<SourceId>,
}

/// Routes packets between streams of one session.
///
/// Each route is selected by a flag set (e.g. `AUDIO` for source packets,
/// `REPAIR` for parity packets). The first packet delivered to a route pins
/// the route to that packet's stream id; later packets with a different id
/// are rejected, so two senders can not interleave into one session.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Create a router with no routes.
    pub fn new() -> Self {
        Router::default()
    }

    /// Add a route for packets whose flags contain `flags`.
    pub fn add_route(&mut self, flags: PacketFlags, writer: Box<dyn PacketWriter + Send>) {
        self.routes.push(Route {
            writer,
            flags,
            source: None,
        });
    }

    /// True if some route would accept a packet with the given flags and
    /// stream id.
    pub fn accepts(&self, flags: PacketFlags, source: SourceId) -> bool {
        self.routes.iter().any(|route| {
            flags.contains(route.flags)
                && match route.source {
                    Some(pinned) => pinned == source,
                    None => true,
                }
        })
    }
}

impl PacketWriter for Router {
    fn write_packet(&mut self, packet: Packet) {
        for route in &mut self.routes {
            if !packet.flags().contains(route.flags) {
                continue;
            }

            let source = packet.source();
            match route.source {
                Some(pinned) if pinned != source => {
                    debug!(
                        pinned, source,
                        "router: dropping packet with unexpected stream id"
                    );
                    return;
                }
                Some(_) => {}
                None => {
                    debug!(source, "router: pinning route to stream");
                    route.source = Some(source);
                }
            }

            route.writer.write_packet(packet);
            return;
        }

        debug!("router: dropping packet, no matching route");
    }
}
