//! Sender slot: endpoint set plus transport pipeline.

use std::net::SocketAddr;

use tracing::{debug, warn};

use rstream_media_core::{Frame, FrameWriter};
use rstream_rtp_core::fec::FecScheme;
use rstream_rtp_core::format::Format;
use rstream_rtp_core::packet::PacketWriter;
use rstream_rtp_core::rtcp::RtcpSession;
use rstream_rtp_core::Nanoseconds;

use crate::config::SenderConfig;
use crate::endpoint::{Interface, Protocol, SenderEndpoint};
use crate::error::{Error, Result};
use crate::sender::session::SenderSession;

/// One logical connection of a sender: up to three endpoints (source,
/// repair, control) and the pipeline that feeds them.
///
/// The transport pipeline is created as soon as the endpoint set is
/// complete: immediately for a bare RTP source, or once both halves of a
/// FEC pair are present. A slot that fails a configuration call latches
/// into the broken state.
pub struct SenderSlot {
    config: SenderConfig,
    format: Format,

    pending_source: Option<SenderEndpoint>,
    pending_repair: Option<SenderEndpoint>,
    control: Option<SenderEndpoint>,

    session: Option<SenderSession>,
    rtcp: Option<RtcpSession>,
    broken: bool,
}

impl SenderSlot {
    /// Create a slot with no endpoints.
    pub fn new(config: SenderConfig, format: Format) -> Self {
        SenderSlot {
            config,
            format,
            pending_source: None,
            pending_repair: None,
            control: None,
            session: None,
            rtcp: None,
            broken: false,
        }
    }

    /// True once a configuration call failed.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// True once the transport pipeline exists.
    pub fn is_complete(&self) -> bool {
        self.session.is_some()
    }

    /// Add an endpoint. `writer` is the outbound packet writer provided by
    /// the network loop for that destination.
    pub fn add_endpoint(
        &mut self,
        iface: Interface,
        proto: Protocol,
        dst_addr: SocketAddr,
        writer: Box<dyn PacketWriter + Send>,
    ) -> Result<()> {
        match self.try_add_endpoint(iface, proto, dst_addr, writer) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(%err, "sender slot: endpoint rejected, marking slot broken");
                self.broken = true;
                Err(err)
            }
        }
    }

    fn try_add_endpoint(
        &mut self,
        iface: Interface,
        proto: Protocol,
        dst_addr: SocketAddr,
        writer: Box<dyn PacketWriter + Send>,
    ) -> Result<()> {
        if self.broken {
            return Err(Error::InvalidState("sender slot: slot is broken".to_string()));
        }
        if self.session.is_some() && iface != Interface::AudioControl {
            return Err(Error::InvalidState(
                "sender slot: transport endpoints already bound".to_string(),
            ));
        }

        if proto.interface() != iface {
            return Err(Error::InvalidArgument(format!(
                "sender slot: protocol {} not valid on {}",
                proto.as_str(),
                iface.as_str()
            )));
        }

        let endpoint = SenderEndpoint::new(proto, dst_addr, writer);

        match iface {
            Interface::AudioSource => {
                if self.pending_source.is_some() {
                    return Err(Error::InvalidState(
                        "sender slot: source endpoint already set".to_string(),
                    ));
                }
                if let Some(repair) = &self.pending_repair {
                    if repair.proto().fec_scheme() != proto.fec_scheme() {
                        return Err(Error::InvalidArgument(
                            "sender slot: fec scheme mismatch".to_string(),
                        ));
                    }
                }
                self.pending_source = Some(endpoint);
            }
            Interface::AudioRepair => {
                if self.pending_repair.is_some() {
                    return Err(Error::InvalidState(
                        "sender slot: repair endpoint already set".to_string(),
                    ));
                }
                if let Some(source) = &self.pending_source {
                    if source.proto().fec_scheme() != proto.fec_scheme() {
                        return Err(Error::InvalidArgument(
                            "sender slot: fec scheme mismatch".to_string(),
                        ));
                    }
                }
                self.pending_repair = Some(endpoint);
            }
            Interface::AudioControl => {
                if self.control.is_some() {
                    return Err(Error::InvalidState(
                        "sender slot: control endpoint already set".to_string(),
                    ));
                }
                self.control = Some(endpoint);
                self.rtcp = Some(RtcpSession::new(self.config.rtcp.clone()));
            }
        }

        self.maybe_create_session()
    }

    fn maybe_create_session(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let Some(source) = &self.pending_source else {
            return Ok(());
        };

        let scheme = source.proto().fec_scheme();
        match scheme {
            FecScheme::None => {
                let source = self.pending_source.take().unwrap();
                self.build_session(FecScheme::None, source, None)
            }
            _ => {
                // Wait for the repair half of the pair.
                if self.pending_repair.is_none() {
                    return Ok(());
                }
                let source = self.pending_source.take().unwrap();
                let repair = self.pending_repair.take().unwrap();
                self.build_session(scheme, source, Some(repair))
            }
        }
    }

    fn build_session(
        &mut self,
        scheme: FecScheme,
        source: SenderEndpoint,
        repair: Option<SenderEndpoint>,
    ) -> Result<()> {
        let session = SenderSession::new(
            &self.config,
            self.format,
            scheme,
            Box::new(source),
            repair.map(|repair| Box::new(repair) as Box<dyn PacketWriter + Send>),
        )?;

        self.session = Some(session);

        debug!(fec = %scheme, "sender slot: transport pipeline ready");
        Ok(())
    }

    /// Generate a due RTCP sender report.
    pub fn refresh(&mut self, now: Nanoseconds, report_time: Nanoseconds) {
        let (Some(rtcp), Some(session)) = (self.rtcp.as_mut(), self.session.as_mut()) else {
            return;
        };

        if now < rtcp.generation_deadline(now) {
            return;
        }

        if let Some(packet) = rtcp.generate_sender_report(now, report_time, session) {
            if let Some(control) = self.control.as_mut() {
                control.write_packet(packet);
            }
        }
    }
}

impl FrameWriter for SenderSlot {
    fn write_frame(&mut self, frame: &Frame<'_>) {
        if let Some(session) = self.session.as_mut() {
            session.write_frame(frame);
        }
    }
}
