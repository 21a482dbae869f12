//! Endpoints: where slots meet the network.
//!
//! Socket I/O itself lives outside the pipeline. A receiver endpoint is a
//! concurrent inbound queue the network loop pushes datagrams into; a sender
//! endpoint wraps an outbound packet writer provided by the network loop and
//! serializes packets on their way out.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, warn};

use rstream_rtp_core::fec::FecScheme;
use rstream_rtp_core::packet::{Packet, PacketFlags, PacketWriter, Udp};
use rstream_rtp_core::wire::{self, Parser};

use crate::error::{Error, Result};

/// Endpoint interface within a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    /// Stream of source (audio) packets.
    AudioSource,
    /// Stream of repair (parity) packets.
    AudioRepair,
    /// RTCP control exchange.
    AudioControl,
}

impl Interface {
    /// Interface name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Interface::AudioSource => "audio_source",
            Interface::AudioRepair => "audio_repair",
            Interface::AudioControl => "audio_control",
        }
    }
}

/// Endpoint protocol. Closed set; each protocol binds to exactly one
/// interface and FEC scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Bare RTP source stream.
    Rtp,
    /// RTP source stream of an RS8M FEC pair.
    RtpRs8m,
    /// RS8M repair stream.
    Rs8m,
    /// RTP source stream of an LDPC-Staircase FEC pair.
    RtpLdpc,
    /// LDPC-Staircase repair stream.
    Ldpc,
    /// RTCP control exchange.
    Rtcp,
}

impl Protocol {
    /// The interface this protocol is valid on.
    pub fn interface(&self) -> Interface {
        match self {
            Protocol::Rtp | Protocol::RtpRs8m | Protocol::RtpLdpc => Interface::AudioSource,
            Protocol::Rs8m | Protocol::Ldpc => Interface::AudioRepair,
            Protocol::Rtcp => Interface::AudioControl,
        }
    }

    /// The FEC scheme this protocol participates in.
    pub fn fec_scheme(&self) -> FecScheme {
        match self {
            Protocol::Rtp | Protocol::Rtcp => FecScheme::None,
            Protocol::RtpRs8m | Protocol::Rs8m => FecScheme::Rs8m,
            Protocol::RtpLdpc | Protocol::Ldpc => FecScheme::LdpcStaircase,
        }
    }

    /// Scheme name used in URIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Rtp => "rtp",
            Protocol::RtpRs8m => "rtp+rs8m",
            Protocol::Rs8m => "rs8m",
            Protocol::RtpLdpc => "rtp+ldpc",
            Protocol::Ldpc => "ldpc",
            Protocol::Rtcp => "rtcp",
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rtp" => Ok(Protocol::Rtp),
            "rtp+rs8m" => Ok(Protocol::RtpRs8m),
            "rs8m" => Ok(Protocol::Rs8m),
            "rtp+ldpc" => Ok(Protocol::RtpLdpc),
            "ldpc" => Ok(Protocol::Ldpc),
            "rtcp" => Ok(Protocol::Rtcp),
            _ => Err(Error::InvalidArgument(format!(
                "endpoint: unknown protocol: {s}"
            ))),
        }
    }
}

/// Endpoint URI of the form `proto://host:port[/path]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUri {
    /// Endpoint protocol.
    pub proto: Protocol,
    /// Host name or address.
    pub host: String,
    /// UDP port.
    pub port: u16,
    /// Optional path (used by tunneled transports).
    pub path: Option<String>,
}

impl FromStr for EndpointUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (proto, rest) = s.split_once("://").ok_or_else(|| {
            Error::InvalidArgument(format!("endpoint uri: missing protocol: {s}"))
        })?;
        let proto: Protocol = proto.parse()?;

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, Some(path.to_string())),
            None => (rest, None),
        };

        let (host, port) = authority.rsplit_once(':').ok_or_else(|| {
            Error::InvalidArgument(format!("endpoint uri: missing port: {s}"))
        })?;
        if host.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "endpoint uri: empty host: {s}"
            )));
        }
        let port: u16 = port.parse().map_err(|_| {
            Error::InvalidArgument(format!("endpoint uri: bad port: {s}"))
        })?;

        Ok(EndpointUri {
            proto,
            host: host.to_string(),
            port,
            path,
        })
    }
}

impl std::fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.proto.as_str(), self.host, self.port)?;
        if let Some(path) = &self.path {
            write!(f, "/{path}")?;
        }
        Ok(())
    }
}

/// Inbound datagram queue written by the network loop.
///
/// Preserves arrival order; parsing into packets happens when the pipeline
/// drains the queue during `refresh`.
#[derive(Clone)]
pub struct InboundQueue {
    datagrams: Arc<Mutex<VecDeque<(Bytes, SocketAddr, SocketAddr)>>>,
}

impl InboundQueue {
    fn new() -> Self {
        InboundQueue {
            datagrams: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Enqueue one received datagram. Callable from any thread; never
    /// blocks the pipeline.
    pub fn push(&self, data: Bytes, src_addr: SocketAddr, dst_addr: SocketAddr) {
        self.datagrams.lock().unwrap().push_back((data, src_addr, dst_addr));
    }

    fn pop(&self) -> Option<(Bytes, SocketAddr, SocketAddr)> {
        self.datagrams.lock().unwrap().pop_front()
    }
}

/// Receiver-side endpoint: protocol-specific parser plus inbound queue.
pub struct ReceiverEndpoint {
    proto: Protocol,
    parser: Option<Parser>,
    queue: InboundQueue,
    n_malformed: u64,
}

impl ReceiverEndpoint {
    /// Create an endpoint for the given protocol.
    pub fn new(proto: Protocol) -> Self {
        let parser = match proto.interface() {
            Interface::AudioSource => Some(Parser::source(proto.fec_scheme())),
            Interface::AudioRepair => Some(Parser::repair(proto.fec_scheme())),
            Interface::AudioControl => None,
        };

        ReceiverEndpoint {
            proto,
            parser,
            queue: InboundQueue::new(),
            n_malformed: 0,
        }
    }

    /// Endpoint protocol.
    pub fn proto(&self) -> Protocol {
        self.proto
    }

    /// Handle for the network loop to push datagrams into.
    pub fn inbound_queue(&self) -> InboundQueue {
        self.queue.clone()
    }

    /// Number of datagrams dropped as malformed.
    pub fn num_malformed(&self) -> u64 {
        self.n_malformed
    }

    /// Drain and parse queued datagrams, passing packets to `sink`.
    pub fn refresh(&mut self, mut sink: impl FnMut(Packet)) {
        while let Some((data, src_addr, dst_addr)) = self.queue.pop() {
            let parsed = match &self.parser {
                Some(parser) => parser.parse(data),
                None => wire::parse_control(data),
            };

            match parsed {
                Ok(mut packet) => {
                    packet.udp = Some(Udp { src_addr, dst_addr });
                    packet.add_flags(PacketFlags::UDP);
                    sink(packet);
                }
                Err(err) => {
                    self.n_malformed += 1;
                    warn!(%err, proto = self.proto.as_str(), "endpoint: dropping malformed datagram");
                }
            }
        }
    }
}

/// Sender-side endpoint: serializes packets and hands them to the outbound
/// writer provided by the network loop.
pub struct SenderEndpoint {
    proto: Protocol,
    dst_addr: SocketAddr,
    writer: Box<dyn PacketWriter + Send>,
}

impl SenderEndpoint {
    /// Create an endpoint sending to `dst_addr` through `writer`.
    pub fn new(
        proto: Protocol,
        dst_addr: SocketAddr,
        writer: Box<dyn PacketWriter + Send>,
    ) -> Self {
        debug!(proto = proto.as_str(), %dst_addr, "sender endpoint: created");
        SenderEndpoint {
            proto,
            dst_addr,
            writer,
        }
    }

    /// Endpoint protocol.
    pub fn proto(&self) -> Protocol {
        self.proto
    }

    /// Destination address.
    pub fn dst_addr(&self) -> SocketAddr {
        self.dst_addr
    }
}

impl PacketWriter for SenderEndpoint {
    fn write_packet(&mut self, mut packet: Packet) {
        if !packet.has_flags(PacketFlags::COMPOSED) {
            if let Err(err) = wire::compose(&mut packet) {
                warn!(%err, "sender endpoint: dropping uncomposable packet");
                return;
            }
        }

        if let Some(udp) = packet.udp.as_mut() {
            udp.dst_addr = self.dst_addr;
        } else {
            // The source address is filled by the socket at send time; use
            // an unspecified placeholder until then.
            packet.udp = Some(Udp {
                src_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
                dst_addr: self.dst_addr,
            });
            packet.add_flags(PacketFlags::UDP);
        }

        self.writer.write_packet(packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_parsing() {
        let uri: EndpointUri = "rtp+rs8m://192.168.0.1:10000".parse().unwrap();
        assert_eq!(uri.proto, Protocol::RtpRs8m);
        assert_eq!(uri.host, "192.168.0.1");
        assert_eq!(uri.port, 10000);
        assert_eq!(uri.path, None);

        let uri: EndpointUri = "rtcp://example.com:10002/session".parse().unwrap();
        assert_eq!(uri.proto, Protocol::Rtcp);
        assert_eq!(uri.path.as_deref(), Some("session"));

        assert!("rtp://nohost".parse::<EndpointUri>().is_err());
        assert!("http://host:80".parse::<EndpointUri>().is_err());
        assert!("rtp://:100".parse::<EndpointUri>().is_err());
    }

    #[test]
    fn test_uri_round_trip() {
        for s in ["rtp://host:1000", "ldpc://host:1002/p"] {
            let uri: EndpointUri = s.parse().unwrap();
            assert_eq!(uri.to_string(), s);
        }
    }

    #[test]
    fn test_protocol_bindings() {
        assert_eq!(Protocol::Rtp.interface(), Interface::AudioSource);
        assert_eq!(Protocol::Rs8m.interface(), Interface::AudioRepair);
        assert_eq!(Protocol::Rtcp.interface(), Interface::AudioControl);

        assert_eq!(Protocol::RtpRs8m.fec_scheme(), FecScheme::Rs8m);
        assert_eq!(Protocol::RtpLdpc.fec_scheme(), FecScheme::LdpcStaircase);
        assert_eq!(Protocol::Rtp.fec_scheme(), FecScheme::None);
    }
}
