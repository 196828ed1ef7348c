//! ACL data channel ([Vol 4] Part E, Section 4.1).
//!
//! Outbound packets are queued per `(link, channel)` and sent against the
//! controller's BR/EDR and LE buffer pools. Each pool has its own credit,
//! which is returned by Number Of Completed Packets events. Controllers
//! without a dedicated LE buffer share the BR/EDR pool between both link
//! types.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::mem;
use std::rc::Rc;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::host::{Link, PacketType};

use self::queue::Scheduler;
use super::*;

mod queue;
#[cfg(test)]
mod tests;

/// Controller data buffer pool parameters ([Vol 4] Part E, Sections 7.4.5
/// and 7.8.2).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct DataBufferInfo {
    /// Maximum payload length of one data packet.
    pub max_data_len: u16,
    /// Total number of data packets that the controller can buffer.
    pub max_num_packets: u16,
}

impl DataBufferInfo {
    /// Creates pool parameters from controller-reported values.
    #[inline]
    #[must_use]
    pub const fn new(max_data_len: u16, max_num_packets: u16) -> Self {
        Self {
            max_data_len,
            max_num_packets,
        }
    }

    /// Returns whether the controller reported a usable pool.
    #[inline]
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.max_data_len > 0 && self.max_num_packets > 0
    }
}

/// Outbound ACL data packet priority.
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Priority {
    /// Sent before any Low priority packet, in FIFO order.
    High,
    #[default]
    Low,
}

/// ACL data channel counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct AclStats {
    /// Packets waiting for controller credit.
    pub queued: usize,
    /// Packets sent from the BR/EDR pool and not yet completed.
    pub in_flight: usize,
    /// Packets sent from the dedicated LE pool and not yet completed.
    pub le_in_flight: usize,
    /// Low priority packets dropped because their channel queue was full.
    pub dropped: u64,
    /// Number Of Completed Packets entries that reported more packets than
    /// were outstanding for the handle.
    pub excess_completions: u64,
}

/// Inbound ACL data packet handler.
pub type DataRxHandler = Box<dyn FnMut(AclDataPacket)>;

const BREDR: usize = 0;
const LE: usize = 1;

/// ACL data channel. Clones refer to the same channel.
#[derive(Clone)]
pub struct AclDataChannel(Rc<Inner>);

struct Inner {
    link: Rc<Link>,
    cmd: CommandChannel,
    state: RefCell<State>,
}

struct State {
    closed: bool,
    pools: [Pool; 2],
    has_le: bool,
    sched: Scheduler,
    /// Outstanding packet counts. Entries outlive link registration until
    /// the controller confirms that the link buffers were flushed.
    tracked: HashMap<ConnHandle, Tracked>,
    rx: Option<DataRxHandler>,
    handlers: SmallVec<[HandlerId; 2]>,
    dropped: u64,
    excess: u64,
}

/// Controller buffer pool.
#[derive(Clone, Copy, Debug, Default)]
struct Pool {
    info: DataBufferInfo,
    in_flight: usize,
}

impl Pool {
    #[inline]
    fn has_credit(&self) -> bool {
        self.in_flight < usize::from(self.info.max_num_packets)
    }
}

#[derive(Clone, Copy, Debug)]
struct Tracked {
    pool: usize,
    count: usize,
}

impl AclDataChannel {
    /// Minimum automatic flush timeout ([Vol 4] Part E, Section 7.3.30).
    pub const MIN_FLUSH_TIMEOUT: Duration = Duration::from_millis(1);
    /// Maximum automatic flush timeout.
    pub const MAX_FLUSH_TIMEOUT: Duration = Duration::from_millis(1279);

    /// Creates an ACL data channel that sends packets to `link` and receives
    /// buffer credits from `cmd`. If the controller has no BR/EDR buffer, the
    /// LE buffer is shared by all links.
    pub fn new(
        link: Rc<Link>,
        cmd: CommandChannel,
        cfg: &Config,
        bredr: DataBufferInfo,
        le: DataBufferInfo,
    ) -> Result<Self> {
        let (bredr, le) = match (bredr.is_available(), le.is_available()) {
            (true, true) => (bredr, Some(le)),
            (true, false) => (bredr, None),
            (false, true) => (le, None),
            (false, false) => return Err(Error::BufferUnavailable),
        };
        debug!("ACL data channel with BR/EDR buffer {bredr:?} and LE buffer {le:?}");
        let this = Self(Rc::new(Inner {
            link,
            cmd: cmd.clone(),
            state: RefCell::new(State {
                closed: false,
                pools: [
                    Pool {
                        info: bredr,
                        in_flight: 0,
                    },
                    Pool {
                        info: le.unwrap_or_default(),
                        in_flight: 0,
                    },
                ],
                has_le: le.is_some(),
                sched: Scheduler::new(cfg.max_channel_queue_len),
                tracked: HashMap::new(),
                rx: None,
                handlers: SmallVec::new(),
                dropped: 0,
                excess: 0,
            }),
        }));
        let weak = Rc::downgrade(&this.0);
        let nocp = cmd.add_event_handler(EventCode::NUMBER_OF_COMPLETED_PACKETS, move |evt| {
            let Some(inner) = weak.upgrade() else {
                return EventCallbackResult::Remove;
            };
            Self(inner).on_completed_packets(evt);
            EventCallbackResult::Continue
        })?;
        let overflow = cmd.add_event_handler(EventCode::DATA_BUFFER_OVERFLOW, |evt| {
            // [Vol 4] Part E, Section 7.7.26
            match evt.params().first() {
                Some(0x00) => warn!("Controller SCO data buffer overflow"),
                Some(0x01) => warn!("Controller ACL data buffer overflow"),
                _ => warn!("Controller data buffer overflow: {evt:?}"),
            }
            EventCallbackResult::Continue
        });
        let overflow = match overflow {
            Ok(id) => id,
            Err(e) => {
                cmd.remove_event_handler(nocp);
                return Err(e);
            }
        };
        this.0.state.borrow_mut().handlers = SmallVec::from_slice(&[nocp, overflow]);
        Ok(this)
    }

    /// Returns the BR/EDR buffer pool parameters.
    #[inline]
    #[must_use]
    pub fn buffer_info(&self) -> DataBufferInfo {
        self.0.state.borrow().pools[BREDR].info
    }

    /// Returns the buffer pool parameters used by LE links, which are the
    /// BR/EDR ones if the controller has no dedicated LE buffer.
    #[inline]
    #[must_use]
    pub fn le_buffer_info(&self) -> DataBufferInfo {
        let s = self.0.state.borrow();
        s.pools[s.pool(LinkType::Le)].info
    }

    /// Returns channel counters.
    #[must_use]
    pub fn stats(&self) -> AclStats {
        let s = self.0.state.borrow();
        AclStats {
            queued: s.sched.len(),
            in_flight: s.pools[BREDR].in_flight,
            le_in_flight: s.pools[LE].in_flight,
            dropped: s.dropped,
            excess_completions: s.excess,
        }
    }

    /// Registers a logical link, allowing packets to be sent on it.
    pub fn register_link(&self, hdl: ConnHandle, typ: LinkType) -> Result<()> {
        let mut s = self.0.state.borrow_mut();
        if s.closed {
            return Err(Error::Closed);
        }
        let pool = s.pool(typ);
        if !s.sched.register(hdl, typ, pool) {
            return Err(Error::ConnectionExists(hdl));
        }
        let t = s.tracked.entry(hdl).or_insert(Tracked { pool, count: 0 });
        if t.count > 0 {
            warn!(
                "Registered {hdl} with {} packets outstanding from a previous link",
                t.count
            );
        } else {
            t.pool = pool;
        }
        debug!("Registered {typ} link {hdl}");
        Ok(())
    }

    /// Unregisters a logical link and discards its unsent packets. Packets
    /// that were already sent keep using controller credit until
    /// [`Self::clear_controller_packet_count`] is called.
    pub fn unregister_link(&self, hdl: ConnHandle) -> Result<()> {
        let dropped = self.0.state.borrow_mut().sched.remove(hdl);
        let Some(n) = dropped else {
            return Err(Error::UnknownConnection(hdl));
        };
        debug!("Unregistered link {hdl} ({n} unsent packets discarded)");
        // Another link may be able to use the credit of a partial PDU
        self.try_send();
        Ok(())
    }

    /// Returns the controller credit of packets that were sent on a link
    /// before it was disconnected. This must only be called after the
    /// controller reports the disconnection and the link is unregistered.
    pub fn clear_controller_packet_count(&self, hdl: ConnHandle) {
        {
            let mut s = self.0.state.borrow_mut();
            if s.sched.link_type(hdl).is_some() {
                warn!("Ignoring packet count reset for registered link {hdl}");
                return;
            }
            let Some(t) = s.tracked.remove(&hdl) else { return };
            let p = &mut s.pools[t.pool];
            p.in_flight = p.in_flight.saturating_sub(t.count);
            debug!("Cleared {} outstanding packets of {hdl}", t.count);
        }
        self.try_send();
    }

    /// Queues a complete PDU for channel `cid` of the packet's link.
    #[inline]
    pub fn send_packet(&self, pkt: AclDataPacket, cid: Cid, pri: Priority) -> Result<()> {
        self.send_packets(vec![pkt], cid, pri)
    }

    /// Queues all fragments of one PDU for channel `cid`. The first packet
    /// must start the PDU and all others must continue it on the same link.
    pub fn send_packets(&self, pkts: Vec<AclDataPacket>, cid: Cid, pri: Priority) -> Result<()> {
        let Some(first) = pkts.first() else {
            return Err(Error::InvalidFragments);
        };
        let hdl = first.handle();
        if !first.boundary().is_first()
            || (pkts[1..].iter()).any(|p| p.handle() != hdl || p.boundary().is_first())
        {
            return Err(Error::InvalidFragments);
        }
        {
            let mut s = self.0.state.borrow_mut();
            let s = &mut *s;
            if s.closed {
                return Err(Error::Closed);
            }
            let Some(typ) = s.sched.link_type(hdl) else {
                return Err(Error::UnknownConnection(hdl));
            };
            let max = usize::from(s.pools[s.pool(typ)].info.max_data_len);
            if let Some(len) = (pkts.iter().map(|p| p.payload().len())).find(|&n| n > max) {
                return Err(Error::PayloadTooLarge { len, max });
            }
            trace!("Queued {} packets for {hdl}/{cid} [{pri:?}]", pkts.len());
            let dropped = s.sched.push(hdl, cid, pri, pkts.into_iter());
            if dropped > 0 {
                warn!("Dropped {dropped} oldest packets of {hdl}/{cid} (queue full)");
                s.dropped += dropped as u64;
            }
        }
        self.try_send();
        Ok(())
    }

    /// Removes all unsent PDUs whose first fragment satisfies the predicate.
    /// Returns the number of removed packets.
    pub fn drop_queued_packets(&self, mut f: impl FnMut(&AclDataPacket, Cid) -> bool) -> usize {
        let n = (self.0.state.borrow_mut().sched).retain(|pkt, cid| !f(pkt, cid));
        if n > 0 {
            debug!("Dropped {n} queued packets");
            self.try_send();
        }
        n
    }

    /// Sets the handler of inbound ACL data packets.
    pub fn set_data_rx_handler(&self, f: impl FnMut(AclDataPacket) + 'static) {
        let mut s = self.0.state.borrow_mut();
        if !s.closed {
            s.rx = Some(Box::new(f));
        }
    }

    /// Sets the automatic flush timeout of a BR/EDR link. `None` disables
    /// automatic flushing. The timeout is rounded up to the next multiple of
    /// 0.625 ms, so the controller never flushes earlier than requested.
    /// `done` is called with the command result.
    pub fn set_bredr_automatic_flush_timeout(
        &self,
        timeout: Option<Duration>,
        hdl: ConnHandle,
        done: impl FnOnce(Result<()>) + 'static,
    ) -> Result<()> {
        let typ = {
            let s = self.0.state.borrow();
            if s.closed {
                return Err(Error::Closed);
            }
            s.sched.link_type(hdl)
        };
        match typ {
            Some(LinkType::BrEdr) => {}
            Some(typ) => return Err(Error::WrongLinkType { hdl, typ }),
            None => return Err(Error::UnknownConnection(hdl)),
        }
        // [Vol 4] Part E, Section 7.3.30 (N * 0.625 ms)
        let ticks = match timeout {
            None => 0,
            Some(t) if (Self::MIN_FLUSH_TIMEOUT..=Self::MAX_FLUSH_TIMEOUT).contains(&t) => {
                let ticks = (t.as_micros() + 624) / 625;
                u16::try_from(ticks).map_err(|_| Error::InvalidFlushTimeout)?
            }
            Some(_) => return Err(Error::InvalidFlushTimeout),
        };
        let pkt = CommandPacket::new(Opcode::WRITE_AUTOMATIC_FLUSH_TIMEOUT, |p| {
            p.u16(hdl).u16(ticks);
        });
        let mut done = Some(done);
        (self.0.cmd).send_command(pkt, EventCode::COMMAND_COMPLETE, move |_, evt| {
            let Some(f) = done.take() else { return };
            let status = evt.status();
            f(if status.is_ok() {
                Ok(())
            } else {
                Err(Error::CommandFailed {
                    opcode: Opcode::WRITE_AUTOMATIC_FLUSH_TIMEOUT,
                    status,
                })
            });
        })?;
        Ok(())
    }

    /// Drops all queued packets and stops processing events. The channel
    /// refuses all further operations.
    pub fn shutdown(&self) {
        let (handlers, dropped) = {
            let mut s = self.0.state.borrow_mut();
            if s.closed {
                return;
            }
            s.closed = true;
            let sched = mem::replace(&mut s.sched, Scheduler::new(0));
            (mem::take(&mut s.handlers), (sched, s.rx.take()))
        };
        for id in handlers {
            self.0.cmd.remove_event_handler(id);
        }
        debug!("ACL data channel shut down ({} queued)", dropped.0.len());
        drop(dropped);
    }

    /// Processes an inbound ACL data packet. Malformed packets are dropped.
    pub(crate) fn receive(&self, raw: &[u8]) {
        let Some(pkt) = AclDataPacket::parse(raw) else {
            return;
        };
        let rx = {
            let mut s = self.0.state.borrow_mut();
            if s.closed {
                return;
            }
            s.rx.take()
        };
        let Some(mut f) = rx else {
            warn!("No handler for {pkt:?}");
            return;
        };
        f(pkt);
        let mut s = self.0.state.borrow_mut();
        if !s.closed && s.rx.is_none() {
            s.rx = Some(f);
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
                // Unknown handles may belong to SCO links
                let Some(t) = s.tracked.get_mut(&hdl) else { continue };
                let mut n = usize::from(n);
                if n > t.count {
                    warn!(
                        "{hdl} completed {n} packets, but only {} were outstanding",
                        t.count
                    );
                    s.excess += 1;
                    n = t.count;
                }
                t.count -= n;
                let p = &mut s.pools[t.pool];
                p.in_flight = p.in_flight.saturating_sub(n);
                credited |= n > 0;
            }
        }
        if credited {
            self.try_send();
        }
    }

    /// Sends queued packets while the controller has buffer space.
    fn try_send(&self) {
        loop {
            let pkt = {
                let mut s = self.0.state.borrow_mut();
                let s = &mut *s;
                if s.closed || self.0.link.is_closed() {
                    return;
                }
                let credit = [s.pools[BREDR].has_credit(), s.pools[LE].has_credit()];
                let Some((pool, pkt)) = s.sched.pop(credit) else {
                    return;
                };
                s.pools[pool].in_flight += 1;
                if let Some(t) = s.tracked.get_mut(&pkt.handle()) {
                    t.count += 1;
                }
                pkt
            };
            self.0.link.send(PacketType::Acl, pkt.as_ref());
        }
    }
}

impl State {
    /// Returns the index of the buffer pool used by links of type `typ`.
    #[inline]
    const fn pool(&self, typ: LinkType) -> usize {
        match typ {
            LinkType::Le if self.has_le => LE,
            _ => BREDR,
        }
    }
}

impl Debug for AclDataChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = self.0.state.borrow();
        f.debug_struct("AclDataChannel")
            .field("bredr", &s.pools[BREDR])
            .field("le", &s.has_le.then_some(s.pools[LE]))
            .field("queued", &s.sched.len())
            .field("closed", &s.closed)
            .finish()
    }
}
