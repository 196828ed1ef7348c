//! Test-only controller link and event builders.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use crate::dispatch::Dispatcher;
use crate::hci::*;
use crate::host::{self, Done, Link, PacketType, Transport};

/// Controller link that records every written packet and holds SCO
/// configuration requests until the test completes them.
#[derive(Default)]
pub(crate) struct MockTransport {
    sent: RefCell<Vec<(PacketType, Vec<u8>)>>,
    fail: Cell<bool>,
    sco: RefCell<VecDeque<(Option<ScoParameters>, Done)>>,
}

impl MockTransport {
    pub fn new() -> Rc<Self> {
        init_tracing();
        Rc::default()
    }

    /// Makes all further writes fail or succeed.
    pub fn fail_writes(&self, v: bool) {
        self.fail.set(v);
    }

    /// Returns all written packets.
    pub fn sent(&self) -> Vec<(PacketType, Vec<u8>)> {
        self.sent.borrow().clone()
    }

    /// Removes and returns the written packets of type `typ`.
    pub fn take(&self, typ: PacketType) -> Vec<Vec<u8>> {
        let mut all = self.sent.borrow_mut();
        let (this, other): (Vec<_>, Vec<_>) = all.drain(..).partition(|(t, _)| *t == typ);
        *all = other;
        this.into_iter().map(|(_, p)| p).collect()
    }

    /// Removes and returns the opcodes of written commands.
    pub fn take_commands(&self) -> Vec<Opcode> {
        (self.take(PacketType::Command).iter())
            .map(|p| Opcode::from(u16::from_le_bytes([p[0], p[1]])))
            .collect()
    }

    /// Returns the number of outstanding SCO configuration requests.
    pub fn sco_requests(&self) -> usize {
        self.sco.borrow().len()
    }

    /// Completes the oldest SCO configuration request, returning its
    /// parameters (`None` for a reset).
    pub fn complete_sco(&self, r: host::Result<()>) -> Option<ScoParameters> {
        let (params, done) = self.sco.borrow_mut().pop_front()?;
        done(r);
        params
    }
}

impl Transport for MockTransport {
    fn send(&self, typ: PacketType, pkt: &[u8]) -> host::Result<()> {
        if self.fail.get() {
            return Err(host::Error::Write { typ });
        }
        self.sent.borrow_mut().push((typ, pkt.to_vec()));
        Ok(())
    }

    fn configure_sco(&self, params: ScoParameters, done: Done) {
        self.sco.borrow_mut().push_back((Some(params), done));
    }

    fn reset_sco(&self, done: Done) {
        self.sco.borrow_mut().push_back((None, done));
    }
}

impl Debug for MockTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("sent", &self.sent.borrow().len())
            .finish_non_exhaustive()
    }
}

/// Returns a dispatcher, a mock transport, and a link using both.
pub(crate) fn link() -> (Dispatcher, Rc<MockTransport>, Rc<Link>) {
    let d = Dispatcher::new();
    let t = MockTransport::new();
    let link = Link::new(t.clone(), d.clone());
    (d, t, link)
}

/// Initializes test logging.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

pub(crate) fn hdl(v: u16) -> ConnHandle {
    ConnHandle::new(v).unwrap()
}

pub(crate) fn cmd(opcode: Opcode) -> CommandPacket {
    CommandPacket::from_params(opcode, &[])
}

pub(crate) fn cmd_complete(opcode: Opcode, quota: u8, status: Status) -> EventPacket {
    let op = u16::from(opcode).to_le_bytes();
    EventPacket::from_params(
        EventCode::COMMAND_COMPLETE,
        &[quota, op[0], op[1], status as u8],
    )
}

pub(crate) fn cmd_status(opcode: Opcode, quota: u8, status: Status) -> EventPacket {
    let op = u16::from(opcode).to_le_bytes();
    EventPacket::from_params(
        EventCode::COMMAND_STATUS,
        &[status as u8, quota, op[0], op[1]],
    )
}

pub(crate) fn le_meta(sub: SubeventCode, params: &[u8]) -> EventPacket {
    let mut v = vec![u8::from(sub)];
    v.extend_from_slice(params);
    EventPacket::from_params(EventCode::LE_META, &v)
}

pub(crate) fn nocp(entries: &[(u16, u16)]) -> EventPacket {
    let mut v = vec![u8::try_from(entries.len()).unwrap()];
    for &(h, n) in entries {
        v.extend_from_slice(&h.to_le_bytes());
        v.extend_from_slice(&n.to_le_bytes());
    }
    EventPacket::from_params(EventCode::NUMBER_OF_COMPLETED_PACKETS, &v)
}
