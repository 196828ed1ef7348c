//! Generic packet framing ([Vol 4] Part E, Section 5.4).
//!
//! Only the headers are interpreted. Payload semantics belong to the layers
//! that own each command, event, or channel.

use std::fmt::{Debug, Formatter};

use smallvec::SmallVec;
use structbuf::{Pack, Packer, StructBuf, Unpacker};
use tracing::warn;

use super::*;

/// Command packet header size.
pub const COMMAND_HDR: usize = 3;
/// Event packet header size.
pub const EVENT_HDR: usize = 2;
/// ACL data packet header size.
pub const ACL_HDR: usize = 4;
/// Synchronous data packet header size.
pub const SCO_HDR: usize = 3;

/// Outbound HCI command packet ([Vol 4] Part E, Section 5.4.1).
#[must_use]
pub struct CommandPacket(StructBuf);

impl CommandPacket {
    /// Maximum parameter length.
    pub const MAX_PARAMS: usize = u8::MAX as usize;

    /// Creates a command packet, calling `f` to append the parameters.
    ///
    /// # Panics
    ///
    /// Panics if the parameters exceed [`Self::MAX_PARAMS`] bytes.
    pub fn new(opcode: Opcode, f: impl FnOnce(&mut Packer)) -> Self {
        let mut b = StructBuf::new(COMMAND_HDR + Self::MAX_PARAMS);
        b.append().u16(opcode).u8(0);
        f(&mut b.append());
        #[allow(clippy::cast_possible_truncation)]
        let n = (b.len() - COMMAND_HDR) as u8;
        b[COMMAND_HDR - 1] = n;
        Self(b)
    }

    /// Creates a command packet with raw parameters.
    #[inline]
    pub fn from_params(opcode: Opcode, params: &[u8]) -> Self {
        Self::new(opcode, |p| {
            p.put(params);
        })
    }

    /// Returns the command opcode.
    #[inline]
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        Opcode::from(Unpacker::new(&self.0[..]).u16())
    }

    /// Returns the command parameters.
    #[inline]
    #[must_use]
    pub fn params(&self) -> &[u8] {
        &self.0[COMMAND_HDR..]
    }
}

impl AsRef<[u8]> for CommandPacket {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for CommandPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPacket")
            .field("opcode", &self.opcode())
            .field("params", &format_args!("{:02X?}", self.params()))
            .finish()
    }
}

/// Command Complete or Command Status header fields.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct CmdInfo {
    /// `Num_HCI_Command_Packets`.
    pub quota: u8,
    pub opcode: Opcode,
    pub status: Status,
}

/// Inbound HCI event packet ([Vol 4] Part E, Section 5.4.4) with a validated
/// header.
#[derive(Clone, Eq, PartialEq)]
#[must_use]
pub struct EventPacket(Vec<u8>);

impl EventPacket {
    /// Validates the framing of a received event. The declared parameter
    /// length must match the actual length, and events consumed by the
    /// transport itself must carry their fixed fields.
    pub fn new(raw: &[u8]) -> Result<Self> {
        let mut p = Unpacker::new(raw);
        let (code, len) = (EventCode::from(p.u8()), p.u8());
        if !p.is_ok() || p.len() != usize::from(len) {
            return Err(Error::InvalidEvent(Vec::from(raw)));
        }
        let min = match code {
            EventCode::COMMAND_COMPLETE => 3,
            EventCode::COMMAND_STATUS => 4,
            EventCode::LE_META => 1,
            _ => 0,
        };
        if usize::from(len) < min {
            return Err(Error::InvalidEvent(Vec::from(raw)));
        }
        Ok(Self(Vec::from(raw)))
    }

    /// Creates an event from its code and parameters.
    ///
    /// # Panics
    ///
    /// Panics if the parameters are longer than 255 bytes.
    pub fn from_params(code: EventCode, params: &[u8]) -> Self {
        let len = u8::try_from(params.len()).expect("event parameters too long");
        let mut v = Vec::with_capacity(EVENT_HDR + params.len());
        v.extend_from_slice(&[u8::from(code), len]);
        v.extend_from_slice(params);
        Self(v)
    }

    /// Returns the event code.
    #[inline]
    pub fn code(&self) -> EventCode {
        EventCode::from(self.0[0])
    }

    /// Returns the event parameters.
    #[inline]
    #[must_use]
    pub fn params(&self) -> &[u8] {
        &self.0[EVENT_HDR..]
    }

    /// Returns the subevent code of an LE meta event.
    #[inline]
    #[must_use]
    pub fn subevent_code(&self) -> Option<SubeventCode> {
        if self.code() != EventCode::LE_META {
            return None;
        }
        self.params().first().map(|&v| SubeventCode::from(v))
    }

    /// Returns the command information of a Command Complete or Command Status
    /// event ([Vol 4] Part E, Sections 7.7.14 and 7.7.15).
    #[must_use]
    pub fn cmd_info(&self) -> Option<CmdInfo> {
        let mut p = Unpacker::new(self.params());
        match self.code() {
            EventCode::COMMAND_COMPLETE => {
                let (quota, opcode) = (p.u8(), Opcode::from(p.u16()));
                let status = if p.is_empty() {
                    Status::Success
                } else {
                    Status::from(p.u8())
                };
                Some(CmdInfo {
                    quota,
                    opcode,
                    status,
                })
            }
            EventCode::COMMAND_STATUS => {
                let (status, quota) = (Status::from(p.u8()), p.u8());
                Some(CmdInfo {
                    quota,
                    opcode: Opcode::from(p.u16()),
                    status,
                })
            }
            _ => None,
        }
    }

    /// Returns the status of a command completion event. By convention, this
    /// is the first parameter of most completion events. Events without any
    /// parameters report success.
    #[must_use]
    pub fn status(&self) -> Status {
        let p = self.params();
        let v = match self.code() {
            EventCode::COMMAND_COMPLETE => p.get(3),
            EventCode::LE_META => p.get(1),
            _ => p.first(),
        };
        v.map_or(Status::Success, |&v| Status::from(v))
    }

    /// Returns the `(handle, count)` pairs of a Number Of Completed Packets
    /// event ([Vol 4] Part E, Section 7.7.19). Parsing stops at the first
    /// truncated entry and invalid handles are skipped.
    #[must_use]
    pub fn completed_packets(&self) -> SmallVec<[(ConnHandle, u16); 4]> {
        let mut v = SmallVec::new();
        if self.code() != EventCode::NUMBER_OF_COMPLETED_PACKETS {
            return v;
        }
        let mut p = Unpacker::new(self.params());
        let n = p.u8();
        for _ in 0..n {
            let (hdl, count) = (p.u16(), p.u16());
            if !p.is_ok() {
                warn!("Truncated Number Of Completed Packets event: {:02X?}", self.0);
                break;
            }
            match ConnHandle::new(hdl) {
                Some(hdl) => v.push((hdl, count)),
                None => warn!("Completed packets for invalid handle {hdl:#06X}"),
            }
        }
        v
    }
}

impl AsRef<[u8]> for EventPacket {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for EventPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPacket")
            .field("code", &self.code())
            .field("params", &format_args!("{:02X?}", self.params()))
            .finish()
    }
}

/// ACL data packet boundary flag ([Vol 4] Part E, Section 5.4.2).
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PacketBoundary {
    /// First non-automatically-flushable fragment of a PDU.
    FirstNonFlushable = 0b00,
    /// Continuing fragment.
    Continuing = 0b01,
    /// First automatically-flushable fragment of a PDU.
    FirstFlushable = 0b10,
    /// Complete automatically-flushable PDU (not allowed on LE-U).
    Complete = 0b11,
}

impl PacketBoundary {
    /// Returns whether the fragment starts a new PDU.
    #[inline]
    #[must_use]
    pub const fn is_first(self) -> bool {
        !matches!(self, Self::Continuing)
    }

    #[inline]
    const fn from_bits(v: u16) -> Self {
        match v & 0b11 {
            0b00 => Self::FirstNonFlushable,
            0b01 => Self::Continuing,
            0b10 => Self::FirstFlushable,
            _ => Self::Complete,
        }
    }
}

/// ACL data packet broadcast flag.
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum BroadcastFlag {
    PointToPoint = 0b00,
    BrEdrBroadcast = 0b01,
}

/// ACL data packet ([Vol 4] Part E, Section 5.4.2).
#[must_use]
pub struct AclDataPacket {
    hdl: ConnHandle,
    buf: StructBuf,
}

impl AclDataPacket {
    /// Creates an outbound packet.
    ///
    /// # Panics
    ///
    /// Panics if the payload is longer than 65535 bytes.
    pub fn new(
        hdl: ConnHandle,
        boundary: PacketBoundary,
        broadcast: BroadcastFlag,
        payload: &[u8],
    ) -> Self {
        let len = u16::try_from(payload.len()).expect("ACL payload too long");
        let mut buf = StructBuf::new(ACL_HDR + payload.len());
        let flags = (boundary as u16) << ConnHandle::BITS | (broadcast as u16) << 14;
        buf.append().u16(u16::from(hdl) | flags).u16(len).put(payload);
        Self { hdl, buf }
    }

    /// Parses a received packet. Returns `None` if the packet is malformed.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let mut p = Unpacker::new(raw);
        let (hdr, len) = (p.u16(), p.u16());
        if !p.is_ok() || p.len() != usize::from(len) {
            warn!("ACL data packet length mismatch: {raw:02X?}");
            return None;
        }
        if hdr >> 14 > BroadcastFlag::BrEdrBroadcast as u16 {
            warn!("ACL data packet with reserved broadcast flag: {raw:02X?}");
            return None;
        }
        let Some(hdl) = ConnHandle::from_hdr(hdr) else {
            warn!("ACL data packet with invalid handle: {raw:02X?}");
            return None;
        };
        let mut buf = StructBuf::new(raw.len());
        buf.put_at(0, raw);
        Some(Self { hdl, buf })
    }

    /// Returns the connection handle.
    #[inline(always)]
    pub const fn handle(&self) -> ConnHandle {
        self.hdl
    }

    /// Returns the packet boundary flag.
    #[inline]
    pub fn boundary(&self) -> PacketBoundary {
        PacketBoundary::from_bits(self.hdr() >> ConnHandle::BITS)
    }

    /// Returns the broadcast flag.
    #[inline]
    pub fn broadcast(&self) -> BroadcastFlag {
        if self.hdr() >> 14 == 0 {
            BroadcastFlag::PointToPoint
        } else {
            BroadcastFlag::BrEdrBroadcast
        }
    }

    /// Returns the packet payload.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf[ACL_HDR..]
    }

    #[inline]
    fn hdr(&self) -> u16 {
        Unpacker::new(&self.buf[..]).u16()
    }
}

impl AsRef<[u8]> for AclDataPacket {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl Debug for AclDataPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AclDataPacket")
            .field("hdl", &self.hdl)
            .field("boundary", &self.boundary())
            .field("len", &self.payload().len())
            .finish()
    }
}

/// Packet status flag of a received synchronous data packet.
#[allow(clippy::exhaustive_enums)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ScoPacketStatus {
    CorrectlyReceived = 0b00,
    PossiblyInvalid = 0b01,
    NoData = 0b10,
    PartiallyLost = 0b11,
}

impl ScoPacketStatus {
    #[inline]
    const fn from_bits(v: u16) -> Self {
        match v & 0b11 {
            0b00 => Self::CorrectlyReceived,
            0b01 => Self::PossiblyInvalid,
            0b10 => Self::NoData,
            _ => Self::PartiallyLost,
        }
    }
}

/// Synchronous data packet ([Vol 4] Part E, Section 5.4.3).
#[must_use]
pub struct ScoDataPacket {
    hdl: ConnHandle,
    buf: StructBuf,
}

impl ScoDataPacket {
    /// Maximum payload length.
    pub const MAX_PAYLOAD: usize = u8::MAX as usize;

    /// Creates an outbound packet.
    ///
    /// # Panics
    ///
    /// Panics if the payload is longer than 255 bytes.
    pub fn new(hdl: ConnHandle, status: ScoPacketStatus, payload: &[u8]) -> Self {
        let len = u8::try_from(payload.len()).expect("SCO payload too long");
        let mut buf = StructBuf::new(SCO_HDR + payload.len());
        let flags = (status as u16) << ConnHandle::BITS;
        buf.append().u16(u16::from(hdl) | flags).u8(len).put(payload);
        Self { hdl, buf }
    }

    /// Parses a received packet. Returns `None` if the packet is malformed.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let mut p = Unpacker::new(raw);
        let (hdr, len) = (p.u16(), p.u8());
        if !p.is_ok() || p.len() != usize::from(len) {
            warn!("SCO data packet length mismatch: {raw:02X?}");
            return None;
        }
        let Some(hdl) = ConnHandle::from_hdr(hdr) else {
            warn!("SCO data packet with invalid handle: {raw:02X?}");
            return None;
        };
        let mut buf = StructBuf::new(raw.len());
        buf.put_at(0, raw);
        Some(Self { hdl, buf })
    }

    /// Returns the connection handle.
    #[inline(always)]
    pub const fn handle(&self) -> ConnHandle {
        self.hdl
    }

    /// Returns the packet status flag.
    #[inline]
    pub fn status(&self) -> ScoPacketStatus {
        ScoPacketStatus::from_bits(Unpacker::new(&self.buf[..]).u16() >> ConnHandle::BITS)
    }

    /// Returns the packet payload.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf[SCO_HDR..]
    }
}

impl AsRef<[u8]> for ScoDataPacket {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl Debug for ScoDataPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoDataPacket")
            .field("hdl", &self.hdl)
            .field("len", &self.payload().len())
            .finish()
    }
}
