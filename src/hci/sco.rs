//! Synchronous (SCO/eSCO) data channel ([Vol 4] Part E, Section 4.1.1).
//!
//! Unlike ACL, outbound packets are pulled from the active connection only
//! when the controller has buffer space. The controller's SCO data path
//! serves one connection at a time, so the channel configures it through the
//! transport whenever the active connection changes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::mem;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::host::{self, Link, PacketType};

use super::*;


/// Audio coding format of a synchronous connection.
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum::Display)]
pub enum CodingFormat {
    /// CVSD air coding with linear PCM on the host interface.
    Cvsd,
    /// mSBC, transparent air coding.
    Msbc,
    /// Transparent data.
    Transparent,
}

/// Negotiated parameters of a synchronous connection that determine the
/// controller's SCO data path configuration.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub struct ScoParameters {
    pub coding_format: CodingFormat,
    /// Bits per sample on the host interface.
    pub encoding_bits: u8,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl ScoParameters {
    #[inline]
    #[must_use]
    pub const fn new(coding_format: CodingFormat, encoding_bits: u8, sample_rate: u32) -> Self {
        Self {
            coding_format,
            encoding_bits,
            sample_rate,
        }
    }
}

/// Synchronous connection served by a [`ScoDataChannel`].
pub trait ScoConnection {
    /// Returns the connection handle.
    fn handle(&self) -> ConnHandle;

    /// Returns the negotiated connection parameters.
    fn parameters(&self) -> ScoParameters;

    /// Removes and returns the next outbound packet.
    fn next_outbound_packet(&self) -> Option<ScoDataPacket>;

    /// Delivers an inbound packet.
    fn receive_inbound_packet(&self, pkt: ScoDataPacket);

    /// Reports an unrecoverable error. The connection is already
    /// unregistered when this is called.
    fn on_hci_error(&self);
}

/// SCO data channel counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct ScoStats {
    /// Packets sent and not yet completed.
    pub in_flight: usize,
    /// Number Of Completed Packets entries that reported more packets than
    /// were outstanding for the handle.
    pub excess_completions: u64,
}

/// SCO data channel. Clones refer to the same channel.
#[derive(Clone)]
pub struct ScoDataChannel(Rc<Inner>);

struct Inner {
    link: Rc<Link>,
    cmd: CommandChannel,
    info: DataBufferInfo,
    state: RefCell<State>,
}

#[derive(Default)]
struct State {
    closed: bool,
    /// Registered connections in registration order. The first one is
    /// configured or active.
    conns: Vec<Registered>,
    active: Active,
    /// Whether the controller data path holds a configuration that must be
    /// reset once no connections remain.
    configured: bool,
    /// Generation of the data path configuration. Results of earlier
    /// configuration requests are ignored.
    gen: u64,
    in_flight: usize,
    /// Outstanding packet counts. Entries outlive connection registration
    /// until the controller confirms that the link buffers were flushed.
    tracked: HashMap<ConnHandle, usize>,
    excess: u64,
    handler: Option<HandlerId>,
}

struct Registered {
    hdl: ConnHandle,
    conn: Weak<dyn ScoConnection>,
}

/// Controller data path state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum Active {
    /// Not configured for any connection.
    #[default]
    None,
    Configuring(ConnHandle),
    Ready(ConnHandle),
}

impl Active {
    #[inline]
    const fn handle(self) -> Option<ConnHandle> {
        match self {
            Self::None => None,
            Self::Configuring(hdl) | Self::Ready(hdl) => Some(hdl),
        }
    }
}

/// Pending data path request.
enum Request {
    Configure(ConnHandle, Rc<dyn ScoConnection>),
    Reset,
}

impl ScoDataChannel {
    /// Creates a SCO data channel that sends packets to `link` and receives
    /// buffer credits from `cmd`.
    pub fn new(link: Rc<Link>, cmd: CommandChannel, info: DataBufferInfo) -> Result<Self> {
        if !info.is_available() {
            return Err(Error::BufferUnavailable);
        }
        debug!("SCO data channel with buffer {info:?}");
        let this = Self(Rc::new(Inner {
            link,
            cmd: cmd.clone(),
            info,
            state: RefCell::default(),
        }));
        let weak = Rc::downgrade(&this.0);
        let id = cmd.add_event_handler(EventCode::NUMBER_OF_COMPLETED_PACKETS, move |evt| {
            let Some(inner) = weak.upgrade() else {
                return EventCallbackResult::Remove;
            };
            Self(inner).on_completed_packets(evt);
            EventCallbackResult::Continue
        })?;
        this.0.state.borrow_mut().handler = Some(id);
        Ok(this)
    }

    /// Returns the maximum payload length of one packet.
    #[inline]
    #[must_use]
    pub fn max_data_len(&self) -> u16 {
        self.0.info.max_data_len
    }

    /// Returns the controller buffer pool parameters.
    #[inline]
    #[must_use]
    pub fn buffer_info(&self) -> DataBufferInfo {
        self.0.info
    }

    /// Returns the handle of the connection that the controller data path is
    /// configured for.
    #[must_use]
    pub fn active_connection(&self) -> Option<ConnHandle> {
        match self.0.state.borrow().active {
            Active::Ready(hdl) => Some(hdl),
            _ => None,
        }
    }

    /// Returns the number of sent packets that were not yet completed.
    #[inline]
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.0.state.borrow().in_flight
    }

    /// Returns channel counters.
    #[must_use]
    pub fn stats(&self) -> ScoStats {
        let s = self.0.state.borrow();
        ScoStats {
            in_flight: s.in_flight,
            excess_completions: s.excess,
        }
    }

    /// Registers a connection. The connection is unregistered automatically
    /// when it is dropped. The first registered connection becomes active
    /// once the controller data path is configured for it.
    pub fn register_connection(&self, conn: Rc<dyn ScoConnection>) -> Result<()> {
        let hdl = conn.handle();
        {
            let mut s = self.0.state.borrow_mut();
            if s.closed {
                return Err(Error::Closed);
            }
            if s.conns.iter().any(|r| r.hdl == hdl) {
                return Err(Error::ConnectionExists(hdl));
            }
            s.conns.push(Registered {
                hdl,
                conn: Rc::downgrade(&conn),
            });
            s.tracked.entry(hdl).or_default();
            debug!("Registered SCO connection {hdl}");
        }
        self.update_active();
        Ok(())
    }

    /// Unregisters a connection. Packets that were already sent keep using
    /// controller credit until [`Self::clear_controller_packet_count`] is
    /// called.
    pub fn unregister_connection(&self, hdl: ConnHandle) -> Result<()> {
        let r = {
            let mut s = self.0.state.borrow_mut();
            let Some(i) = s.conns.iter().position(|r| r.hdl == hdl) else {
                return Err(Error::UnknownConnection(hdl));
            };
            s.remove(i)
        };
        debug!("Unregistered SCO connection {hdl}");
        drop(r);
        self.update_active();
        Ok(())
    }

    /// Returns the controller credit of packets that were sent on a
    /// connection before it was disconnected. This must only be called after
    /// the controller reports the disconnection and the connection is
    /// unregistered.
    pub fn clear_controller_packet_count(&self, hdl: ConnHandle) {
        {
            let mut s = self.0.state.borrow_mut();
            if s.conns.iter().any(|r| r.hdl == hdl) {
                warn!("Ignoring packet count reset for registered SCO connection {hdl}");
                return;
            }
            let Some(n) = s.tracked.remove(&hdl) else { return };
            s.in_flight = s.in_flight.saturating_sub(n);
            debug!("Cleared {n} outstanding SCO packets of {hdl}");
        }
        self.try_send();
    }

    /// Notifies the channel that the active connection may have new outbound
    /// packets.
    #[inline]
    pub fn on_outbound_packet_readable(&self) {
        self.try_send();
    }

    /// Drops all connections and stops processing events. The channel
    /// refuses all further operations.
    pub fn shutdown(&self) {
        let (id, conns) = {
            let mut s = self.0.state.borrow_mut();
            if s.closed {
                return;
            }
            s.closed = true;
            s.gen += 1;
            s.active = Active::None;
            (s.handler.take(), mem::take(&mut s.conns))
        };
        if let Some(id) = id {
            self.0.cmd.remove_event_handler(id);
        }
        debug!("SCO data channel shut down ({} connections)", conns.len());
    }

    /// Delivers an inbound packet to its connection. Packets for unknown
    /// connections and malformed packets are dropped.
    pub(crate) fn receive(&self, raw: &[u8]) {
        let Some(pkt) = ScoDataPacket::parse(raw) else {
            return;
        };
        let conn = {
            let s = self.0.state.borrow();
            if s.closed {
                return;
            }
            (s.conns.iter())
                .find(|r| r.hdl == pkt.handle())
                .and_then(|r| r.conn.upgrade())
        };
        match conn {
            Some(conn) => conn.receive_inbound_packet(pkt),
            None => trace!("Dropped SCO packet for unknown connection {}", pkt.handle()),
        }
    }

    /// Returns controller credit for completed packets.
    fn on_completed_packets(&self, evt: &EventPacket) {
        let mut credited = false;
        {
            let mut s = self.0.state.borrow_mut();
            let s = &mut *s;
            if s.closed {
                return;
            }
            for (hdl, n) in evt.completed_packets() {
                // Unknown handles may belong to ACL links
                let Some(count) = s.tracked.get_mut(&hdl) else { continue };
                let mut n = usize::from(n);
                if n > *count {
                    warn!("SCO {hdl} completed {n} packets, but only {count} were outstanding");
                    s.excess += 1;
                    n = *count;
                }
                *count -= n;
                s.in_flight = s.in_flight.saturating_sub(n);
                credited |= n > 0;
            }
        }
        if credited {
            self.try_send();
        }
    }

    /// Pulls packets from the active connection while the controller has
    /// buffer space.
    fn try_send(&self) {
        loop {
            let (gen, hdl, conn) = {
                let s = self.0.state.borrow();
                if s.closed || self.0.link.is_closed() {
                    return;
                }
                let Active::Ready(hdl) = s.active else { return };
                if s.in_flight >= usize::from(self.0.info.max_num_packets) {
                    return;
                }
                (s.gen, hdl, s.conns.first().and_then(|r| r.conn.upgrade()))
            };
            let Some(conn) = conn else {
                debug!("SCO connection {hdl} was dropped");
                let _ = self.unregister_connection(hdl);
                return;
            };
            let Some(pkt) = conn.next_outbound_packet() else {
                return;
            };
            {
                let mut s = self.0.state.borrow_mut();
                // The connection may have been unregistered by the callback
                if s.closed || s.gen != gen {
                    return;
                }
                let max = usize::from(self.0.info.max_data_len);
                if pkt.handle() != hdl || pkt.payload().len() > max {
                    warn!("Dropped invalid outbound SCO packet for {hdl}: {pkt:?}");
                    continue;
                }
                s.in_flight += 1;
                *s.tracked.entry(hdl).or_default() += 1;
            }
            self.0.link.send(PacketType::Sco, pkt.as_ref());
        }
    }

    /// Selects the active connection after a registration change and sends
    /// the matching data path request to the transport.
    fn update_active(&self) {
        let (gen, req) = {
            let mut s = self.0.state.borrow_mut();
            if s.closed {
                return;
            }
            // Forget connections that were dropped without unregistering
            s.conns.retain(|r| r.conn.strong_count() > 0);
            let first = (s.conns.first()).and_then(|r| Some((r.hdl, r.conn.upgrade()?)));
            let req = match first {
                Some((hdl, _)) if s.active.handle() == Some(hdl) => return,
                Some((hdl, conn)) => {
                    s.active = Active::Configuring(hdl);
                    s.configured = true;
                    Request::Configure(hdl, conn)
                }
                None if !s.configured => return,
                None => {
                    s.active = Active::None;
                    s.configured = false;
                    Request::Reset
                }
            };
            s.gen += 1;
            (s.gen, req)
        };
        let transport = Rc::clone(self.0.link.transport());
        let done = self.done_callback(gen);
        match req {
            Request::Configure(hdl, conn) => {
                let params = conn.parameters();
                debug!("Configuring SCO data path for {hdl}: {params:?}");
                transport.configure_sco(params, done);
            }
            Request::Reset => {
                debug!("Resetting SCO data path");
                transport.reset_sco(done);
            }
        }
    }

    /// Returns a transport completion callback that posts the result of
    /// data path request `gen` to the dispatcher.
    fn done_callback(&self, gen: u64) -> host::Done {
        let weak = Rc::downgrade(&self.0);
        let dispatcher = self.0.link.dispatcher().clone();
        Box::new(move |r| {
            dispatcher.post(move || {
                if let Some(inner) = weak.upgrade() {
                    Self(inner).on_data_path_result(gen, r);
                }
            });
        })
    }

    /// Handles the result of a data path request.
    fn on_data_path_result(&self, gen: u64, r: host::Result<()>) {
        let failed = {
            let mut s = self.0.state.borrow_mut();
            if s.closed || s.gen != gen {
                trace!("Ignoring stale SCO data path result: {r:?}");
                return;
            }
            match (s.active, r) {
                (Active::Configuring(hdl), Ok(())) => {
                    debug!("SCO connection {hdl} is active");
                    s.active = Active::Ready(hdl);
                    None
                }
                (Active::Configuring(hdl), Err(e)) => {
                    warn!("Failed to configure SCO data path for {hdl}: {e}");
                    s.active = Active::None;
                    let i = s.conns.iter().position(|r| r.hdl == hdl);
                    Some(i.and_then(|i| s.remove(i).conn.upgrade()))
                }
                (_, Err(e)) => {
                    warn!("Failed to reset SCO data path: {e}");
                    return;
                }
                (_, Ok(())) => return,
            }
        };
        match failed {
            Some(conn) => {
                if let Some(conn) = conn {
                    conn.on_hci_error();
                }
                self.update_active();
            }
            None => self.try_send(),
        }
    }
}

impl State {
    /// Removes registration `i`. The data path no longer serves the removed
    /// connection.
    fn remove(&mut self, i: usize) -> Registered {
        let r = self.conns.remove(i);
        if self.active.handle() == Some(r.hdl) {
            self.active = Active::None;
            // The configuration is reset unless another connection is
            // activated
            self.gen += 1;
        }
        r
    }
}

impl Debug for ScoDataChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = self.0.state.borrow();
        f.debug_struct("ScoDataChannel")
            .field("info", &self.0.info)
            .field("conns", &s.conns.len())
            .field("active", &s.active)
            .field("in_flight", &s.in_flight)
            .field("closed", &s.closed)
            .finish()
    }
}
