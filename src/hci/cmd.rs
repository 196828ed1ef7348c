//! HCI command channel ([Vol 4] Part E, Section 4.4).
//!
//! Serializes outbound commands against the controller's command credit and
//! routes every inbound event either to the transaction that awaits it or to
//! the registered event handlers.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::{Debug, Display, Formatter};
use std::mem;
use std::num::NonZeroU64;
use std::rc::Rc;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use crate::dispatch::TimerId;
use crate::host::{Link, PacketType};

use super::*;


/// Command transaction identifier, unique for the lifetime of the channel.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct TransactionId(NonZeroU64);

/// Event handler identifier, unique for the lifetime of the channel.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct HandlerId(NonZeroU64);

/// Command transaction callback. It is called for every event of the
/// transaction: Command Status (if any), followed by the terminal event.
pub type CommandCallback = Box<dyn FnMut(TransactionId, &EventPacket)>;

/// Long-lived event handler.
pub type EventCallback = Box<dyn FnMut(&EventPacket) -> EventCallbackResult>;

/// Event handler return value.
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EventCallbackResult {
    #[default]
    Continue,
    /// Unregisters the handler.
    Remove,
}

/// Event selector for handlers and asynchronous commands.
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKey {
    Event(EventCode),
    LeMeta(SubeventCode),
    /// Vendor-specific event with the specified first parameter.
    Vendor(u8),
}

impl Display for EventKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Event(code) => Display::fmt(&code, f),
            Self::LeMeta(sub) => write!(f, "LeMeta({sub})"),
            Self::Vendor(sub) => write!(f, "Vendor({sub:#04X})"),
        }
    }
}

/// Terminal event of a command transaction.
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Completion {
    /// Terminated by Command Complete (or a Command Status error).
    Sync,
    /// Acknowledged by Command Status and terminated by the specified event.
    Async(EventCode),
    /// Acknowledged by Command Status and terminated by the specified LE meta
    /// subevent.
    LeAsync(SubeventCode),
}

impl Completion {
    /// Returns the completion for a command terminated by event `code`.
    #[inline]
    #[must_use]
    pub fn from_code(code: EventCode) -> Self {
        if code == EventCode::COMMAND_COMPLETE {
            Self::Sync
        } else {
            Self::Async(code)
        }
    }

    /// Returns the key of the terminal event of an asynchronous command.
    #[inline]
    const fn key(self) -> Option<EventKey> {
        match self {
            Self::Sync => None,
            Self::Async(code) => Some(EventKey::Event(code)),
            Self::LeAsync(sub) => Some(EventKey::LeMeta(sub)),
        }
    }
}

impl Default for Completion {
    #[inline]
    fn default() -> Self {
        Self::Sync
    }
}

/// Returns whether events with this code are routed by a subevent code and
/// must be awaited or handled through the corresponding key.
#[inline]
const fn routed_by_subevent(code: EventCode) -> bool {
    matches!(code, EventCode::LE_META | EventCode::VENDOR)
}

/// HCI command channel. Clones refer to the same channel.
#[derive(Clone)]
pub struct CommandChannel(Rc<Inner>);

struct Inner {
    link: Rc<Link>,
    timeout: Duration,
    state: RefCell<State>,
}

/// Command transaction.
struct Transaction {
    id: TransactionId,
    opcode: Opcode,
    completion: Completion,
    exclusions: SmallVec<[Opcode; 2]>,
    cb: Option<CommandCallback>,
    timer: Option<TimerId>,
}

/// Command waiting for dispatch.
struct Queued {
    pkt: CommandPacket,
    t: Transaction,
}

struct Handler {
    id: HandlerId,
    key: EventKey,
    cb: Option<EventCallback>,
}

#[derive(Default)]
struct State {
    closed: bool,
    stalled: bool,
    quota: u8,
    last_id: u64,
    queue: VecDeque<Queued>,
    pending: Vec<Transaction>,
    handlers: Vec<Handler>,
    on_timeout: Option<Box<dyn FnOnce()>>,
}

impl CommandChannel {
    /// Creates a command channel that writes commands to `link`.
    #[must_use]
    pub fn new(link: Rc<Link>, cfg: &Config) -> Self {
        Self(Rc::new(Inner {
            link,
            timeout: cfg.command_timeout,
            state: RefCell::new(State {
                // [Vol 4] Part E, Section 4.4
                quota: 1,
                ..State::default()
            }),
        }))
    }

    /// Returns the number of commands that the controller is currently willing
    /// to accept.
    #[inline]
    #[must_use]
    pub fn allowed_command_packets(&self) -> u8 {
        self.0.state.borrow().quota
    }

    /// Returns whether the channel no longer accepts commands, either because
    /// it was shut down or because a command timed out.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        let s = self.0.state.borrow();
        s.closed || s.stalled
    }

    /// Sends a command that terminates with event `completion`, which is
    /// Command Complete for synchronous commands. The callback is called for
    /// every event of the transaction.
    #[inline]
    pub fn send_command(
        &self,
        pkt: CommandPacket,
        completion: EventCode,
        cb: impl FnMut(TransactionId, &EventPacket) + 'static,
    ) -> Result<TransactionId> {
        self.send(pkt, Completion::from_code(completion), &[], Box::new(cb))
    }

    /// Sends a command that will not be dispatched while a command with any of
    /// the `exclusions` opcodes is outstanding.
    #[inline]
    pub fn send_exclusive_command(
        &self,
        pkt: CommandPacket,
        completion: EventCode,
        exclusions: &[Opcode],
        cb: impl FnMut(TransactionId, &EventPacket) + 'static,
    ) -> Result<TransactionId> {
        self.send(pkt, Completion::from_code(completion), exclusions, Box::new(cb))
    }

    /// Sends an LE command that terminates with an LE meta event `subevent`.
    #[inline]
    pub fn send_le_async_command(
        &self,
        pkt: CommandPacket,
        subevent: SubeventCode,
        cb: impl FnMut(TransactionId, &EventPacket) + 'static,
    ) -> Result<TransactionId> {
        self.send(pkt, Completion::LeAsync(subevent), &[], Box::new(cb))
    }

    /// Sends an exclusive LE command that terminates with an LE meta event
    /// `subevent`.
    #[inline]
    pub fn send_le_async_exclusive_command(
        &self,
        pkt: CommandPacket,
        subevent: SubeventCode,
        exclusions: &[Opcode],
        cb: impl FnMut(TransactionId, &EventPacket) + 'static,
    ) -> Result<TransactionId> {
        self.send(pkt, Completion::LeAsync(subevent), exclusions, Box::new(cb))
    }

    /// Queues a command and dispatches it if the controller credit and the
    /// ordering constraints allow.
    pub fn send(
        &self,
        pkt: CommandPacket,
        completion: Completion,
        exclusions: &[Opcode],
        cb: CommandCallback,
    ) -> Result<TransactionId> {
        let opcode = pkt.opcode();
        let id = {
            let mut s = self.0.state.borrow_mut();
            if s.closed || s.stalled {
                return Err(Error::Closed);
            }
            match completion {
                Completion::Sync => {}
                Completion::Async(code) => {
                    if code.is_reserved() || routed_by_subevent(code) {
                        return Err(Error::ReservedEventCode(code));
                    }
                    let key = EventKey::Event(code);
                    if s.has_handler(key) {
                        return Err(Error::EventHandlerExists(key));
                    }
                }
                Completion::LeAsync(sub) => {
                    let key = EventKey::LeMeta(sub);
                    if s.has_handler(key) {
                        return Err(Error::EventHandlerExists(key));
                    }
                    if s.awaits(key) {
                        return Err(Error::AsyncCommandPending(key));
                    }
                }
            }
            let id = TransactionId(s.next_id());
            debug!("Queued {opcode} command [{id:?}, {completion:?}]");
            let t = Transaction {
                id,
                opcode,
                completion,
                exclusions: SmallVec::from_slice(exclusions),
                cb: Some(cb),
                timer: None,
            };
            s.queue.push_back(Queued { pkt, t });
            id
        };
        self.try_send_queued();
        Ok(id)
    }

    /// Removes a command that was not yet sent to the controller. Returns
    /// `false` if the command was already sent or the transaction is unknown.
    pub fn remove_queued_command(&self, id: TransactionId) -> bool {
        let q = {
            let mut s = self.0.state.borrow_mut();
            let Some(i) = s.queue.iter().position(|q| q.t.id == id) else {
                return false;
            };
            s.queue.remove(i)
        };
        if let Some(ref q) = q {
            debug!("Removed queued {} command [{id:?}]", q.t.opcode);
        }
        drop(q);
        // Removal may unblock a later command with the same opcode
        self.try_send_queued();
        true
    }

    /// Registers a handler for event `code`. Command Complete, Command Status,
    /// LE meta, and vendor events can't be handled this way.
    pub fn add_event_handler(
        &self,
        code: EventCode,
        f: impl FnMut(&EventPacket) -> EventCallbackResult + 'static,
    ) -> Result<HandlerId> {
        if code.is_reserved() || routed_by_subevent(code) {
            return Err(Error::ReservedEventCode(code));
        }
        self.add_handler(EventKey::Event(code), Box::new(f))
    }

    /// Registers a handler for LE meta events with the specified subevent
    /// code.
    #[inline]
    pub fn add_le_meta_event_handler(
        &self,
        subevent: SubeventCode,
        f: impl FnMut(&EventPacket) -> EventCallbackResult + 'static,
    ) -> Result<HandlerId> {
        self.add_handler(EventKey::LeMeta(subevent), Box::new(f))
    }

    /// Registers a handler for vendor-specific events with the specified
    /// vendor subevent code (first parameter).
    #[inline]
    pub fn add_vendor_event_handler(
        &self,
        subevent: u8,
        f: impl FnMut(&EventPacket) -> EventCallbackResult + 'static,
    ) -> Result<HandlerId> {
        self.add_handler(EventKey::Vendor(subevent), Box::new(f))
    }

    fn add_handler(&self, key: EventKey, cb: EventCallback) -> Result<HandlerId> {
        let mut s = self.0.state.borrow_mut();
        if s.closed {
            return Err(Error::Closed);
        }
        if s.awaits(key) {
            return Err(Error::AsyncCommandPending(key));
        }
        let id = HandlerId(s.next_id());
        trace!("Added {key} handler [{id:?}]");
        s.handlers.push(Handler {
            id,
            key,
            cb: Some(cb),
        });
        Ok(id)
    }

    /// Unregisters an event handler. Returns `false` if the handler is
    /// unknown.
    pub fn remove_event_handler(&self, id: HandlerId) -> bool {
        let h = {
            let mut s = self.0.state.borrow_mut();
            let Some(i) = s.handlers.iter().position(|h| h.id == id) else {
                return false;
            };
            s.handlers.remove(i)
        };
        trace!("Removed {} handler [{id:?}]", h.key);
        true
    }

    /// Sets the callback that is called when a command is not acknowledged by
    /// the controller within the command timeout. The channel stops sending
    /// commands after a timeout.
    pub fn set_channel_timeout_callback(&self, f: impl FnOnce() + 'static) {
        self.0.state.borrow_mut().on_timeout = Some(Box::new(f));
    }

    /// Drops all queued commands, outstanding transactions, and event
    /// handlers without calling them. All further events are ignored.
    pub fn shutdown(&self) {
        let dropped = {
            let mut s = self.0.state.borrow_mut();
            if s.closed {
                return;
            }
            s.closed = true;
            for timer in s.pending.iter().filter_map(|t| t.timer) {
                self.0.link.dispatcher().cancel(timer);
            }
            (
                mem::take(&mut s.queue),
                mem::take(&mut s.pending),
                mem::take(&mut s.handlers),
                s.on_timeout.take(),
            )
        };
        debug!(
            "Command channel shut down ({} queued, {} pending)",
            dropped.0.len(),
            dropped.1.len()
        );
        // Callbacks are dropped without the state borrow
        drop(dropped);
    }

    /// Processes an inbound event.
    pub fn on_event(&self, evt: &EventPacket) {
        if self.0.state.borrow().closed {
            return;
        }
        trace!("{evt:?}");
        let code = evt.code();
        let key = match code {
            EventCode::COMMAND_COMPLETE | EventCode::COMMAND_STATUS => {
                return self.on_cmd_event(evt);
            }
            EventCode::LE_META => match evt.subevent_code() {
                Some(sub) => EventKey::LeMeta(sub),
                None => return,
            },
            EventCode::VENDOR => match evt.params().first() {
                Some(&sub) => EventKey::Vendor(sub),
                None => {
                    warn!("Vendor event without a subevent code");
                    return;
                }
            },
            _ => EventKey::Event(code),
        };
        if !self.complete_async(key, evt) {
            self.notify_handlers(key, evt);
        }
    }

    /// Handles Command Complete and Command Status events.
    fn on_cmd_event(&self, evt: &EventPacket) {
        let Some(info) = evt.cmd_info() else { return };
        let is_status = evt.code() == EventCode::COMMAND_STATUS;
        let next = {
            let mut s = self.0.state.borrow_mut();
            s.quota = info.quota;
            let i = if info.opcode == Opcode::NOP {
                None
            } else {
                let i = s.pending.iter().position(|t| t.opcode == info.opcode);
                if i.is_none() {
                    warn!("Unexpected {} for {}", evt.code(), info.opcode);
                }
                i
            };
            i.map(|i| {
                let t = &mut s.pending[i];
                if let Some(timer) = t.timer.take() {
                    self.0.link.dispatcher().cancel(timer);
                }
                let terminal =
                    matches!(t.completion, Completion::Sync) || !is_status || !info.status.is_ok();
                if !info.status.is_ok() {
                    debug!("{} command failed: {}", info.opcode, info.status);
                }
                let id = t.id;
                let cb = if terminal {
                    s.pending.remove(i).cb
                } else {
                    s.pending[i].cb.take()
                };
                (id, terminal, cb)
            })
        };
        if let Some((id, terminal, cb)) = next {
            if !self.invoke(id, terminal, cb, evt) {
                return;
            }
        }
        self.try_send_queued();
    }

    /// Completes the asynchronous transaction awaiting event `key`. Returns
    /// `false` if there is no such transaction.
    fn complete_async(&self, key: EventKey, evt: &EventPacket) -> bool {
        let (id, cb) = {
            let mut s = self.0.state.borrow_mut();
            let Some(i) = s.pending.iter().position(|t| t.completion.key() == Some(key)) else {
                return false;
            };
            let t = s.pending.remove(i);
            if let Some(timer) = t.timer {
                self.0.link.dispatcher().cancel(timer);
            }
            debug!("{} command completed by {key} [{:?}]", t.opcode, t.id);
            (t.id, t.cb)
        };
        if self.invoke(id, true, cb, evt) {
            self.try_send_queued();
        }
        true
    }

    /// Calls a transaction callback without holding the state borrow. The
    /// callback of a non-terminal event is restored if the transaction is still
    /// outstanding. Returns `false` if the channel was shut down by the
    /// callback.
    fn invoke(
        &self,
        id: TransactionId,
        terminal: bool,
        cb: Option<CommandCallback>,
        evt: &EventPacket,
    ) -> bool {
        let Some(mut cb) = cb else {
            return !self.0.state.borrow().closed;
        };
        cb(id, evt);
        let mut s = self.0.state.borrow_mut();
        if s.closed {
            return false;
        }
        if !terminal {
            if let Some(t) = s.pending.iter_mut().find(|t| t.id == id) {
                t.cb = Some(cb);
            }
        }
        true
    }

    /// Calls all handlers registered for `key` in registration order.
    fn notify_handlers(&self, key: EventKey, evt: &EventPacket) {
        let ids: SmallVec<[HandlerId; 4]> = (self.0.state.borrow().handlers.iter())
            .filter(|h| h.key == key)
            .map(|h| h.id)
            .collect();
        if ids.is_empty() {
            trace!("Unhandled {key} event");
            return;
        }
        for id in ids {
            let cb = {
                let mut s = self.0.state.borrow_mut();
                if s.closed {
                    return;
                }
                (s.handlers.iter_mut())
                    .find(|h| h.id == id)
                    .and_then(|h| h.cb.take())
            };
            // Removed by an earlier handler
            let Some(mut cb) = cb else { continue };
            let r = cb(evt);
            let mut s = self.0.state.borrow_mut();
            if s.closed {
                return;
            }
            if let Some(i) = s.handlers.iter().position(|h| h.id == id) {
                match r {
                    EventCallbackResult::Continue => s.handlers[i].cb = Some(cb),
                    EventCallbackResult::Remove => {
                        trace!("Removed {key} handler [{id:?}]");
                        s.handlers.remove(i);
                    }
                }
            }
        }
    }

    /// Sends as many queued commands as the controller credit and ordering
    /// constraints allow.
    fn try_send_queued(&self) {
        loop {
            let pkt = {
                let mut s = self.0.state.borrow_mut();
                if s.closed || s.stalled || s.quota == 0 {
                    return;
                }
                let Some(Queued { pkt, mut t }) = s.next_sendable().and_then(|i| s.queue.remove(i))
                else {
                    return;
                };
                s.quota -= 1;
                let (id, weak) = (t.id, Rc::downgrade(&self.0));
                let timer = self.0.link.dispatcher().post_delayed(self.0.timeout, move || {
                    if let Some(inner) = weak.upgrade() {
                        Self(inner).on_timeout(id);
                    }
                });
                t.timer = Some(timer);
                debug!("Sending {} command [{id:?}]", t.opcode);
                s.pending.push(t);
                pkt
            };
            // A failed write closes the link, which shuts down the host
            self.0.link.send(PacketType::Command, pkt.as_ref());
        }
    }

    /// Handles a command acknowledgment timeout.
    fn on_timeout(&self, id: TransactionId) {
        let f = {
            let mut s = self.0.state.borrow_mut();
            if s.closed || s.stalled {
                return;
            }
            let Some(t) = s.pending.iter_mut().find(|t| t.id == id) else {
                return;
            };
            t.timer = None;
            error!(
                "{} command timed out after {:?} [{id:?}]",
                t.opcode, self.0.timeout
            );
            s.stalled = true;
            s.on_timeout.take()
        };
        if let Some(f) = f {
            f();
        }
    }
}

impl State {
    /// Returns a new non-zero identifier.
    #[inline]
    fn next_id(&mut self) -> NonZeroU64 {
        self.last_id += 1;
        // SAFETY: last_id starts at 0 and is incremented before use
        unsafe { NonZeroU64::new_unchecked(self.last_id) }
    }

    /// Returns whether a handler is registered for `key`.
    #[inline]
    fn has_handler(&self, key: EventKey) -> bool {
        self.handlers.iter().any(|h| h.key == key)
    }

    /// Returns whether a queued or outstanding asynchronous command awaits
    /// `key`.
    fn awaits(&self, key: EventKey) -> bool {
        let k = Some(key);
        (self.queue.iter().any(|q| q.t.completion.key() == k))
            || (self.pending.iter().any(|t| t.completion.key() == k))
    }

    /// Returns the index of the first queued command that may be sent now.
    /// Commands are skipped while they conflict with an outstanding command.
    /// Later commands with the same opcode or asynchronous completion event as
    /// a skipped command are skipped as well to preserve their order.
    fn next_sendable(&self) -> Option<usize> {
        let mut held: SmallVec<[(Opcode, Completion); 4]> = SmallVec::new();
        for (i, q) in self.queue.iter().enumerate() {
            let t = &q.t;
            let blocked = held.iter().any(|&(op, c)| {
                op == t.opcode || (matches!(c, Completion::Async(_)) && c == t.completion)
            });
            if !blocked && self.pending.iter().all(|p| !conflicts(p, t)) {
                return Some(i);
            }
            held.push((t.opcode, t.completion));
        }
        None
    }
}

/// Returns whether queued command `t` must wait for outstanding command `p`.
fn conflicts(p: &Transaction, t: &Transaction) -> bool {
    p.opcode == t.opcode
        || t.exclusions.contains(&p.opcode)
        || p.exclusions.contains(&t.opcode)
        || (matches!(t.completion, Completion::Async(_)) && p.completion == t.completion)
}

impl Debug for CommandChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = self.0.state.borrow();
        f.debug_struct("CommandChannel")
            .field("quota", &s.quota)
            .field("queued", &s.queue.len())
            .field("pending", &s.pending.len())
            .field("handlers", &s.handlers.len())
            .field("closed", &s.closed)
            .field("stalled", &s.stalled)
            .finish()
    }
}
