//! Controller link boundary ([Vol 4] Parts A-D).

use std::cell::{Cell, RefCell};
use std::fmt::Debug;
use std::rc::Rc;

use tracing::{debug, error, trace};

use crate::dispatch::Dispatcher;
use crate::hci::ScoParameters;

/// Local host errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("controller link closed")]
    Closed,
    #[error("operation not supported by the transport")]
    Unsupported,
    #[error("{typ} write failed")]
    Write { typ: PacketType },
}

/// Common host result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Completion callback of a transport side-channel operation.
pub type Done = Box<dyn FnOnce(Result<()>)>;

/// HCI packet indicators of the UART transport layer ([Vol 4] Part A,
/// Section 2), used to tag every packet that crosses the link.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
    strum::Display,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum PacketType {
    Command = 0x01,
    Acl = 0x02,
    Sco = 0x03,
    Event = 0x04,
}

/// HCI transport layer. Inbound packets are delivered by the driver through
/// [`crate::hci::PacketSink`].
pub trait Transport: Debug {
    /// Writes one complete packet of the specified type.
    fn send(&self, typ: PacketType, pkt: &[u8]) -> Result<()>;

    /// Configures the controller's SCO data path (codec, air coding, sample
    /// rate) for a newly active connection. `done` may be called
    /// synchronously.
    fn configure_sco(&self, params: ScoParameters, done: Done) {
        let _ = params;
        done(Err(Error::Unsupported));
    }

    /// Resets the controller's SCO data path after the last SCO connection is
    /// unregistered.
    fn reset_sco(&self, done: Done) {
        done(Ok(()));
    }
}

/// Shared write side of the controller link. After the first write failure
/// or stream closure, all further writes are refused and the closed callback
/// is posted exactly once.
pub struct Link {
    transport: Rc<dyn Transport>,
    dispatcher: Dispatcher,
    closed: Cell<bool>,
    on_closed: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl Link {
    /// Creates a new open link.
    #[inline]
    #[must_use]
    pub fn new(transport: Rc<dyn Transport>, dispatcher: Dispatcher) -> Rc<Self> {
        Rc::new(Self {
            transport,
            dispatcher,
            closed: Cell::new(false),
            on_closed: RefCell::new(None),
        })
    }

    /// Returns the underlying transport.
    #[inline]
    #[must_use]
    pub fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    /// Returns the dispatcher that runs all link callbacks.
    #[inline]
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Returns whether the link no longer accepts writes.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Sets the callback that is posted once when the link closes. If the link
    /// is already closed, the callback is posted immediately.
    pub fn set_closed_callback(&self, f: impl FnOnce() + 'static) {
        if self.is_closed() {
            self.dispatcher.post(f);
        } else {
            *self.on_closed.borrow_mut() = Some(Box::new(f));
        }
    }

    /// Writes a packet to the controller. Returns `false` if the link is
    /// closed or the write failed, in which case the link is now closed.
    pub fn send(&self, typ: PacketType, pkt: &[u8]) -> bool {
        if self.is_closed() {
            debug!("{typ} packet dropped on closed link");
            return false;
        }
        trace!("{typ} TX: {pkt:02X?}");
        match self.transport.send(typ, pkt) {
            Ok(()) => true,
            Err(e) => {
                error!("{typ} write error: {e}");
                self.close();
                false
            }
        }
    }

    /// Closes the link.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        debug!("Controller link closed");
        // The callback may close the host, so it never runs from within a
        // channel method.
        if let Some(f) = self.on_closed.borrow_mut().take() {
            self.dispatcher.post(f);
        }
    }
}

impl Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("transport", &self.transport)
            .field("closed", &self.closed.get())
            .finish_non_exhaustive()
    }
}
