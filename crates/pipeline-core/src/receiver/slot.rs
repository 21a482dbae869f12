//! Receiver slot: endpoint set plus session group.

use std::sync::Arc;

use tracing::{debug, warn};

use rstream_media_core::FrameReader;
use rstream_rtp_core::fec::FecScheme;
use rstream_rtp_core::format::FormatRegistry;
use rstream_rtp_core::packet::PacketWriter;
use rstream_rtp_core::Nanoseconds;

use crate::config::{ReceiverCommonConfig, ReceiverSessionConfig};
use crate::endpoint::{InboundQueue, Interface, Protocol, ReceiverEndpoint, SenderEndpoint};
use crate::error::{Error, Result};
use crate::receiver::group::SessionGroup;

/// One logical connection point of a receiver: up to three endpoints
/// (source, repair, control) sharing a FEC scheme, plus the sessions fed by
/// them.
///
/// A slot that fails a configuration call latches into the broken state;
/// every subsequent operation fails until the slot is removed.
pub struct ReceiverSlot {
    session_config: ReceiverSessionConfig,
    common_config: ReceiverCommonConfig,
    registry: Arc<FormatRegistry>,

    source_endpoint: Option<ReceiverEndpoint>,
    repair_endpoint: Option<ReceiverEndpoint>,
    control_endpoint: Option<ReceiverEndpoint>,
    control_tx: Option<SenderEndpoint>,

    group: SessionGroup,
    broken: bool,
}

impl ReceiverSlot {
    /// Create a slot with no endpoints.
    pub fn new(
        session_config: ReceiverSessionConfig,
        common_config: ReceiverCommonConfig,
        registry: Arc<FormatRegistry>,
    ) -> Self {
        let group = SessionGroup::new(
            session_config.clone(),
            common_config.clone(),
            registry.clone(),
            FecScheme::None,
        );

        ReceiverSlot {
            session_config,
            common_config,
            registry,
            source_endpoint: None,
            repair_endpoint: None,
            control_endpoint: None,
            control_tx: None,
            group,
            broken: false,
        }
    }

    /// True once a configuration call failed.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Session group of the slot.
    pub fn group(&self) -> &SessionGroup {
        &self.group
    }

    /// Add an endpoint for an interface. Returns the inbound queue the
    /// network loop pushes datagrams into.
    pub fn add_endpoint(&mut self, iface: Interface, proto: Protocol) -> Result<InboundQueue> {
        match self.try_add_endpoint(iface, proto) {
            Ok(queue) => Ok(queue),
            Err(err) => {
                warn!(%err, "receiver slot: endpoint rejected, marking slot broken");
                self.broken = true;
                Err(err)
            }
        }
    }

    fn try_add_endpoint(&mut self, iface: Interface, proto: Protocol) -> Result<InboundQueue> {
        if self.broken {
            return Err(Error::InvalidState("receiver slot: slot is broken".to_string()));
        }

        if proto.interface() != iface {
            return Err(Error::InvalidArgument(format!(
                "receiver slot: protocol {} not valid on {}",
                proto.as_str(),
                iface.as_str()
            )));
        }

        let already_set = match iface {
            Interface::AudioSource => self.source_endpoint.is_some(),
            Interface::AudioRepair => self.repair_endpoint.is_some(),
            Interface::AudioControl => self.control_endpoint.is_some(),
        };
        if already_set {
            return Err(Error::InvalidState(format!(
                "receiver slot: {} endpoint already set",
                iface.as_str()
            )));
        }

        // Source and repair must agree on the FEC scheme: a bare RTP source
        // can not pair with a repair endpoint, and the schemes must match.
        let counterpart_scheme = match iface {
            Interface::AudioSource => self.repair_endpoint.as_ref().map(|e| e.proto().fec_scheme()),
            Interface::AudioRepair => {
                Some(match &self.source_endpoint {
                    Some(endpoint) => endpoint.proto().fec_scheme(),
                    // Repair before source is allowed, checked again later.
                    None => proto.fec_scheme(),
                })
            }
            Interface::AudioControl => None,
        };
        if let Some(scheme) = counterpart_scheme {
            if scheme != proto.fec_scheme() {
                return Err(Error::InvalidArgument(format!(
                    "receiver slot: fec scheme mismatch: {} vs {}",
                    scheme,
                    proto.fec_scheme()
                )));
            }
        }

        let endpoint = ReceiverEndpoint::new(proto);
        let queue = endpoint.inbound_queue();
        let slot = match iface {
            Interface::AudioSource => &mut self.source_endpoint,
            Interface::AudioRepair => &mut self.repair_endpoint,
            Interface::AudioControl => &mut self.control_endpoint,
        };
        *slot = Some(endpoint);

        if iface == Interface::AudioSource {
            // Sessions created from now on follow the source's scheme.
            self.group = SessionGroup::new(
                self.session_config.clone(),
                self.common_config.clone(),
                self.registry.clone(),
                proto.fec_scheme(),
            );
        }

        debug!(
            iface = iface.as_str(),
            proto = proto.as_str(),
            "receiver slot: endpoint added"
        );

        Ok(queue)
    }

    /// Remove an endpoint.
    pub fn remove_endpoint(&mut self, iface: Interface) -> Result<()> {
        let slot = match iface {
            Interface::AudioSource => &mut self.source_endpoint,
            Interface::AudioRepair => &mut self.repair_endpoint,
            Interface::AudioControl => &mut self.control_endpoint,
        };

        if slot.take().is_none() {
            return Err(Error::NotFound(format!(
                "receiver slot: no {} endpoint",
                iface.as_str()
            )));
        }

        debug!(iface = iface.as_str(), "receiver slot: endpoint removed");
        Ok(())
    }

    /// Attach an outbound writer for RTCP receiver reports.
    pub fn set_control_output(
        &mut self,
        dst_addr: std::net::SocketAddr,
        writer: Box<dyn PacketWriter + Send>,
    ) {
        self.control_tx = Some(SenderEndpoint::new(Protocol::Rtcp, dst_addr, writer));
    }

    /// Pull packets from all endpoints, route them, advance sessions, and
    /// emit a due receiver report.
    pub fn refresh(&mut self, now: Nanoseconds) {
        let group = &mut self.group;

        for endpoint in [
            self.source_endpoint.as_mut(),
            self.repair_endpoint.as_mut(),
            self.control_endpoint.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            endpoint.refresh(|packet| group.route_packet(packet));
        }

        if let Some(report) = self.group.refresh(now) {
            if let Some(control_tx) = self.control_tx.as_mut() {
                control_tx.write_packet(report);
            }
        }
    }

    /// Update end-to-end latency of all sessions.
    pub fn reclock_sessions(&mut self, playback_ts: Nanoseconds) {
        self.group.reclock_sessions(playback_ts);
    }

    /// Collect the frame readers of live sessions for mixing.
    pub fn collect_readers<'a>(&'a mut self, readers: &mut Vec<&'a mut dyn FrameReader>) {
        self.group.collect_readers(readers);
    }
}
