use std::fmt::{Debug, Display, Formatter};

/// Connection handle ([Vol 4] Part E, Section 5.4.2).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct ConnHandle(u16);

impl ConnHandle {
    /// Number of meaningful bits.
    pub(crate) const BITS: u16 = 12;
    /// Maximum valid connection handle.
    pub const MAX: u16 = 0xEFF;

    /// Wraps a raw connection handle. Returns `None` if the handle is invalid.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Option<Self> {
        if v <= Self::MAX {
            Some(Self(v))
        } else {
            None
        }
    }

    /// Extracts the handle from the first header field of an ACL or SCO data
    /// packet.
    #[inline]
    #[must_use]
    pub(crate) const fn from_hdr(v: u16) -> Option<Self> {
        Self::new(v & ((1 << Self::BITS) - 1))
    }
}

impl From<ConnHandle> for u16 {
    #[inline]
    fn from(h: ConnHandle) -> Self {
        h.0
    }
}

impl Debug for ConnHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnHandle({:#05X})", self.0)
    }
}

impl Display for ConnHandle {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Upper-layer channel identifier that owns a queued ACL packet. The ACL data
/// channel only uses it for queue separation and fairness; it does not have to
/// match the L2CAP CID inside the payload.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Cid(u16);

impl Cid {
    /// ACL-U signaling channel ([Vol 3] Part A, Section 2.1).
    pub const SIGNAL: Self = Self(0x0001);
    /// Attribute protocol.
    pub const ATT: Self = Self(0x0004);
    /// LE-U signaling channel.
    pub const LE_SIGNAL: Self = Self(0x0005);
    /// Security Manager protocol.
    pub const SMP: Self = Self(0x0006);
    /// First dynamically allocated channel.
    pub const DYNAMIC_MIN: Self = Self(0x0040);

    /// Wraps a raw channel identifier.
    #[inline(always)]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        Self(v)
    }
}

impl From<Cid> for u16 {
    #[inline]
    fn from(c: Cid) -> Self {
        c.0
    }
}

impl Debug for Cid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cid({:#06X})", self.0)
    }
}

impl Display for Cid {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Logical transport type of an ACL link, which selects the controller
/// buffer pool used for its packets.
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum::Display)]
pub enum LinkType {
    /// BR/EDR ACL-U link.
    BrEdr,
    /// LE-U link.
    Le,
}
