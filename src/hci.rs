//! Host Controller Interface ([Vol 4] Part E).
//!
//! [`Host`] owns the shared controller link and the channels built on top of
//! it. A transport driver delivers inbound packets through a [`PacketSink`],
//! and the upper layers use the [`CommandChannel`], [`AclDataChannel`], and
//! [`ScoDataChannel`] handles.

use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, error, warn};

pub use {acl::*, cmd::*, consts::*, handle::*, packet::*, sco::*, seq::*};

use crate::dispatch::Dispatcher;
use crate::host::{self, Link, PacketType};

mod acl;
mod cmd;
mod consts;
mod handle;
mod packet;
mod sco;
mod seq;


/// Error type returned by the HCI layer.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Host(#[from] host::Error),
    #[error("HCI error: {status}")]
    Hci {
        #[from]
        status: Status,
    },
    #[error("invalid event: {0:02X?}")]
    InvalidEvent(Vec<u8>),
    #[error("channel closed")]
    Closed,
    #[error("event code {0} is reserved for the command channel")]
    ReservedEventCode(EventCode),
    #[error("event handler already registered for {0}")]
    EventHandlerExists(EventKey),
    #[error("asynchronous command pending for {0}")]
    AsyncCommandPending(EventKey),
    #[error("{opcode} command failed: {status}")]
    CommandFailed { opcode: Opcode, status: Status },
    #[error("operation canceled")]
    Canceled,
    #[error("unknown connection {0}")]
    UnknownConnection(ConnHandle),
    #[error("connection {0} already registered")]
    ConnectionExists(ConnHandle),
    #[error("payload too large [len={len}, max={max}]")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("invalid PDU fragments")]
    InvalidFragments,
    #[error("flush timeout out of range")]
    InvalidFlushTimeout,
    #[error("operation not supported on {typ} link {hdl}")]
    WrongLinkType { hdl: ConnHandle, typ: LinkType },
    #[error("data channel already initialized")]
    AlreadyInitialized,
    #[error("controller buffer unavailable")]
    BufferUnavailable,
}

impl Error {
    /// Returns the HCI status code, if any.
    #[must_use]
    pub const fn status(&self) -> Option<Status> {
        match *self {
            Self::Hci { status } | Self::CommandFailed { status, .. } => Some(status),
            _ => None,
        }
    }
}

/// Common HCI result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Host transport configuration.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct Config {
    /// Time allowed for the controller to acknowledge a command.
    pub command_timeout: Duration,
    /// Maximum number of Low priority packets queued per ACL
    /// `(handle, channel)` pair before the oldest PDU is dropped.
    pub max_channel_queue_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(10),
            max_channel_queue_len: 64,
        }
    }
}

/// Host-side of a Host Controller Interface. Dropping the host shuts down all
/// channels.
pub struct Host(Rc<Shared>);

struct Shared {
    link: Rc<Link>,
    cfg: Config,
    cmd: CommandChannel,
    acl: RefCell<Option<AclDataChannel>>,
    sco: RefCell<Option<ScoDataChannel>>,
}

impl Host {
    /// Creates an HCI host that uses transport `t` and runs all callbacks on
    /// dispatcher `d`.
    #[must_use]
    pub fn new(t: Rc<dyn host::Transport>, d: Dispatcher, cfg: Config) -> Self {
        let link = Link::new(t, d);
        let cmd = CommandChannel::new(Rc::clone(&link), &cfg);
        Self(Rc::new(Shared {
            link,
            cfg,
            cmd,
            acl: RefCell::default(),
            sco: RefCell::default(),
        }))
    }

    /// Returns the dispatcher that runs all callbacks.
    #[inline]
    pub fn dispatcher(&self) -> &Dispatcher {
        self.0.link.dispatcher()
    }

    /// Returns the command channel.
    #[inline]
    #[must_use]
    pub fn command_channel(&self) -> &CommandChannel {
        &self.0.cmd
    }

    /// Creates the ACL data channel from the controller's BR/EDR and LE buffer
    /// information.
    pub fn initialize_acl_data_channel(
        &self,
        bredr: DataBufferInfo,
        le: DataBufferInfo,
    ) -> Result<AclDataChannel> {
        let s = &self.0;
        if s.acl.borrow().is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let acl = AclDataChannel::new(Rc::clone(&s.link), s.cmd.clone(), &s.cfg, bredr, le)?;
        *s.acl.borrow_mut() = Some(acl.clone());
        Ok(acl)
    }

    /// Creates the SCO data channel from the controller's synchronous buffer
    /// information.
    pub fn initialize_sco_data_channel(&self, info: DataBufferInfo) -> Result<ScoDataChannel> {
        let s = &self.0;
        if s.sco.borrow().is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let sco = ScoDataChannel::new(Rc::clone(&s.link), s.cmd.clone(), info)?;
        *s.sco.borrow_mut() = Some(sco.clone());
        Ok(sco)
    }

    /// Returns the ACL data channel, if initialized.
    #[inline]
    #[must_use]
    pub fn acl_data_channel(&self) -> Option<AclDataChannel> {
        self.0.acl.borrow().clone()
    }

    /// Returns the SCO data channel, if initialized.
    #[inline]
    #[must_use]
    pub fn sco_data_channel(&self) -> Option<ScoDataChannel> {
        self.0.sco.borrow().clone()
    }

    /// Sets the callback that is posted once when any packet stream closes or
    /// a write fails.
    #[inline]
    pub fn set_channel_closed_callback(&self, f: impl FnOnce() + 'static) {
        self.0.link.set_closed_callback(f);
    }

    /// Returns the inbound side of the link for the transport driver.
    #[inline]
    #[must_use]
    pub fn sink(&self) -> PacketSink {
        PacketSink(Rc::downgrade(&self.0))
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

impl Debug for Host {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("link", &self.0.link)
            .field("cmd", &self.0.cmd)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn shutdown(&self) {
        let acl = self.acl.borrow().clone();
        let sco = self.sco.borrow().clone();
        if let Some(acl) = acl {
            acl.shutdown();
        }
        if let Some(sco) = sco {
            sco.shutdown();
        }
        self.cmd.shutdown();
    }
}

/// Inbound side of the controller link. It does not keep the host alive.
#[derive(Clone, Debug)]
pub struct PacketSink(Weak<Shared>);

impl PacketSink {
    /// Delivers one complete inbound packet. A malformed event is a framing
    /// violation that closes the host. Malformed data packets are dropped.
    pub fn receive(&self, typ: PacketType, pkt: &[u8]) -> Result<()> {
        let Some(s) = self.0.upgrade() else {
            return Err(Error::Closed);
        };
        if s.link.is_closed() {
            return Err(Error::Closed);
        }
        match typ {
            PacketType::Event => match EventPacket::new(pkt) {
                Ok(evt) => s.cmd.on_event(&evt),
                Err(e) => {
                    error!("Event stream framing violation: {e}");
                    s.shutdown();
                    s.link.close();
                    return Err(e);
                }
            },
            PacketType::Acl => {
                let acl = s.acl.borrow().clone();
                match acl {
                    Some(acl) => acl.receive(pkt),
                    None => warn!("ACL packet without a data channel: {pkt:02X?}"),
                }
            }
            PacketType::Sco => {
                let sco = s.sco.borrow().clone();
                match sco {
                    Some(sco) => sco.receive(pkt),
                    None => warn!("SCO packet without a data channel: {pkt:02X?}"),
                }
            }
            _ => warn!("Ignoring inbound {typ} packet: {pkt:02X?}"),
        }
        Ok(())
    }

    /// Signals that the transport closed the stream of type `typ`.
    pub fn close(&self, typ: PacketType) {
        if let Some(s) = self.0.upgrade() {
            debug!("{typ} stream closed");
            s.link.close();
        }
    }
}

impl Debug for Shared {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}
