#![allow(clippy::use_self)]

use std::fmt::{Debug, Display, Formatter};

/// HCI command opcode ([Vol 4] Part E, Section 5.4.1). Only the opcodes used
/// by the transport itself are named; any other value can be constructed with
/// [`Opcode::new`].
///
/// This is a newtype over the raw value instead of a `num_enum` enum because
/// the command channel must accept and match any opcode, including vendor
/// commands that have no named constant.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Opcode(u16);

// Opcode group fields.
const LINK_CONTROL: u8 = 0x01;
const HCI_CONTROL: u8 = 0x03;
const INFO_PARAMS: u8 = 0x04;
const LE: u8 = 0x08;
const VENDOR: u8 = 0x3F;

impl Opcode {
    /// Opcode 0x0000 is used to update `Num_HCI_Command_Packets`
    /// ([Vol 4] Part E, Section 7.7.14).
    pub const NOP: Self = Self(0);

    pub const INQUIRY: Self = Self::new(LINK_CONTROL, 0x0001);
    pub const INQUIRY_CANCEL: Self = Self::new(LINK_CONTROL, 0x0002);
    pub const CREATE_CONNECTION: Self = Self::new(LINK_CONTROL, 0x0005);
    pub const DISCONNECT: Self = Self::new(LINK_CONTROL, 0x0006);
    pub const CREATE_CONNECTION_CANCEL: Self = Self::new(LINK_CONTROL, 0x0008);
    pub const REMOTE_NAME_REQUEST: Self = Self::new(LINK_CONTROL, 0x0019);
    pub const READ_REMOTE_SUPPORTED_FEATURES: Self = Self::new(LINK_CONTROL, 0x001B);
    pub const READ_REMOTE_VERSION_INFORMATION: Self = Self::new(LINK_CONTROL, 0x001D);

    pub const SET_EVENT_MASK: Self = Self::new(HCI_CONTROL, 0x0001);
    pub const RESET: Self = Self::new(HCI_CONTROL, 0x0003);
    pub const WRITE_AUTOMATIC_FLUSH_TIMEOUT: Self = Self::new(HCI_CONTROL, 0x0028);

    pub const READ_LOCAL_VERSION_INFORMATION: Self = Self::new(INFO_PARAMS, 0x0001);
    pub const READ_BUFFER_SIZE: Self = Self::new(INFO_PARAMS, 0x0005);
    pub const READ_BD_ADDR: Self = Self::new(INFO_PARAMS, 0x0009);

    pub const LE_SET_EVENT_MASK: Self = Self::new(LE, 0x0001);
    pub const LE_READ_BUFFER_SIZE: Self = Self::new(LE, 0x0002);
    pub const LE_CREATE_CONNECTION: Self = Self::new(LE, 0x000D);
    pub const LE_CREATE_CONNECTION_CANCEL: Self = Self::new(LE, 0x000E);
    pub const LE_READ_REMOTE_FEATURES: Self = Self::new(LE, 0x0016);

    /// Combines the 6-bit opcode group field (OGF) with the 10-bit opcode
    /// command field (OCF). Excess bits are discarded.
    #[inline]
    #[must_use]
    pub const fn new(ogf: u8, ocf: u16) -> Self {
        Self(((ogf as u16 & 0x3F) << 10) | (ocf & 0x3FF))
    }

    /// Returns the opcode group field.
    #[inline]
    #[must_use]
    pub const fn ogf(self) -> u8 {
        (self.0 >> 10) as u8
    }

    /// Returns the opcode command field.
    #[inline]
    #[must_use]
    pub const fn ocf(self) -> u16 {
        self.0 & 0x3FF
    }

    /// Returns whether this is a vendor-specific command.
    #[inline]
    #[must_use]
    pub const fn is_vendor(self) -> bool {
        self.ogf() == VENDOR
    }

    /// Returns whether this is an LE controller command.
    #[inline]
    #[must_use]
    pub const fn is_le(self) -> bool {
        self.ogf() == LE
    }
}

impl From<u16> for Opcode {
    #[inline]
    fn from(v: u16) -> Self {
        Self(v)
    }
}

impl From<Opcode> for u16 {
    #[inline]
    fn from(op: Opcode) -> Self {
        op.0
    }
}

impl Debug for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Opcode({:#06X})", self.0)
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Opcode({:#04X}|{:#05X})", self.ogf(), self.ocf())
    }
}

/// HCI event code ([Vol 4] Part E, Section 7.7). Unnamed codes are still
/// routable through event handlers.
///
/// Like [`Opcode`], this is a newtype rather than an enum, so an event with a
/// code the transport does not know is routed instead of rejected at parsing.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct EventCode(u8);

impl EventCode {
    pub const INQUIRY_COMPLETE: Self = Self(0x01);
    pub const INQUIRY_RESULT: Self = Self(0x02);
    pub const CONNECTION_COMPLETE: Self = Self(0x03);
    pub const CONNECTION_REQUEST: Self = Self(0x04);
    pub const DISCONNECTION_COMPLETE: Self = Self(0x05);
    pub const AUTHENTICATION_COMPLETE: Self = Self(0x06);
    pub const REMOTE_NAME_REQUEST_COMPLETE: Self = Self(0x07);
    pub const ENCRYPTION_CHANGE: Self = Self(0x08);
    pub const READ_REMOTE_SUPPORTED_FEATURES_COMPLETE: Self = Self(0x0B);
    pub const READ_REMOTE_VERSION_INFORMATION_COMPLETE: Self = Self(0x0C);
    pub const COMMAND_COMPLETE: Self = Self(0x0E);
    pub const COMMAND_STATUS: Self = Self(0x0F);
    pub const HARDWARE_ERROR: Self = Self(0x10);
    pub const NUMBER_OF_COMPLETED_PACKETS: Self = Self(0x13);
    pub const DATA_BUFFER_OVERFLOW: Self = Self(0x1A);
    pub const SYNCHRONOUS_CONNECTION_COMPLETE: Self = Self(0x2C);
    pub const LE_META: Self = Self(0x3E);
    /// [Vol 4] Part E, Section 5.4.4
    pub const VENDOR: Self = Self(0xFF);

    /// Returns whether the code is consumed by the command channel itself and
    /// can't be awaited or handled by anyone else.
    #[inline]
    #[must_use]
    pub const fn is_reserved(self) -> bool {
        matches!(self, Self::COMMAND_COMPLETE | Self::COMMAND_STATUS)
    }
}

impl From<u8> for EventCode {
    #[inline]
    fn from(v: u8) -> Self {
        Self(v)
    }
}

impl From<EventCode> for u8 {
    #[inline]
    fn from(c: EventCode) -> Self {
        c.0
    }
}

impl Debug for EventCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventCode({:#04X})", self.0)
    }
}

impl Display for EventCode {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// LE meta event subevent code ([Vol 4] Part E, Section 7.7.65).
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct SubeventCode(u8);

impl SubeventCode {
    pub const CONNECTION_COMPLETE: Self = Self(0x01);
    pub const ADVERTISING_REPORT: Self = Self(0x02);
    pub const CONNECTION_UPDATE_COMPLETE: Self = Self(0x03);
    pub const READ_REMOTE_FEATURES_COMPLETE: Self = Self(0x04);
    pub const LONG_TERM_KEY_REQUEST: Self = Self(0x05);
    pub const ENHANCED_CONNECTION_COMPLETE: Self = Self(0x0A);
}

impl From<u8> for SubeventCode {
    #[inline]
    fn from(v: u8) -> Self {
        Self(v)
    }
}

impl From<SubeventCode> for u8 {
    #[inline]
    fn from(c: SubeventCode) -> Self {
        c.0
    }
}

impl Debug for SubeventCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SubeventCode({:#04X})", self.0)
    }
}

impl Display for SubeventCode {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// HCI status codes ([Vol 1] Part F, Section 1.3).
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, num_enum::FromPrimitive, strum::Display, thiserror::Error,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum Status {
    Success = 0x00,
    UnknownCommand = 0x01,
    UnknownConnectionIdentifier = 0x02,
    HardwareFailure = 0x03,
    PageTimeout = 0x04,
    AuthenticationFailure = 0x05,
    PinOrKeyMissing = 0x06,
    MemoryCapacityExceeded = 0x07,
    ConnectionTimeout = 0x08,
    ConnectionLimitExceeded = 0x09,
    SynchronousConnectionLimitToADeviceExceeded = 0x0A,
    ConnectionAlreadyExists = 0x0B,
    CommandDisallowed = 0x0C,
    ConnectionRejectedDueToLimitedResources = 0x0D,
    ConnectionRejectedDueToSecurityReasons = 0x0E,
    ConnectionRejectedDueToUnacceptableBdAddr = 0x0F,
    ConnectionAcceptTimeoutExceeded = 0x10,
    UnsupportedFeatureOrParameterValue = 0x11,
    InvalidCommandParameters = 0x12,
    RemoteUserTerminatedConnection = 0x13,
    RemoteDeviceTerminatedConnectionDueToLowResources = 0x14,
    RemoteDeviceTerminatedConnectionDueToPowerOff = 0x15,
    ConnectionTerminatedByLocalHost = 0x16,
    RepeatedAttempts = 0x17,
    PairingNotAllowed = 0x18,
    UnknownLmpPdu = 0x19,
    UnsupportedRemoteFeature = 0x1A,
    ScoOffsetRejected = 0x1B,
    ScoIntervalRejected = 0x1C,
    ScoAirModeRejected = 0x1D,
    InvalidLmpLlParameters = 0x1E,
    #[num_enum(default)] // [Vol 4] Part E, Section 1.2
    UnspecifiedError = 0x1F,
    UnsupportedLmpLlParameterValue = 0x20,
    RoleChangeNotAllowed = 0x21,
    LmpLlResponseTimeout = 0x22,
    LmpLlErrorTransactionCollision = 0x23,
    LmpPduNotAllowed = 0x24,
    EncryptionModeNotAcceptable = 0x25,
    LinkKeyCannotBeChanged = 0x26,
    RequestedQosNotSupported = 0x27,
    InstantPassed = 0x28,
    PairingWithUnitKeyNotSupported = 0x29,
    DifferentTransactionCollision = 0x2A,
    QosUnacceptableParameter = 0x2C,
    QosRejected = 0x2D,
    ChannelClassificationNotSupported = 0x2E,
    InsufficientSecurity = 0x2F,
    ParameterOutOfMandatoryRange = 0x30,
    RoleSwitchPending = 0x32,
    ReservedSlotViolation = 0x34,
    RoleSwitchFailed = 0x35,
    ExtendedInquiryResponseTooLarge = 0x36,
    SecureSimplePairingNotSupportedByHost = 0x37,
    HostBusyPairing = 0x38,
    ConnectionRejectedDueToNoSuitableChannelFound = 0x39,
    ControllerBusy = 0x3A,
    UnacceptableConnectionParameters = 0x3B,
    AdvertisingTimeout = 0x3C,
    ConnectionTerminatedDueToMicFailure = 0x3D,
    ConnectionFailedToBeEstablished = 0x3E,
    CoarseClockAdjustmentRejected = 0x40,
    Type0SubmapNotDefined = 0x41,
    UnknownAdvertisingIdentifier = 0x42,
    LimitReached = 0x43,
    OperationCancelledByHost = 0x44,
    PacketTooLong = 0x45,
}

impl Status {
    /// Returns whether status is `Success`.
    #[inline]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Status::Success)
    }
}

impl Default for Status {
    #[inline]
    fn default() -> Self {
        Self::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_fields() {
        assert_eq!(u16::from(Opcode::RESET), 0x0C03);
        assert_eq!(Opcode::RESET.ogf(), 0x03);
        assert_eq!(Opcode::RESET.ocf(), 0x0003);
        assert_eq!(u16::from(Opcode::LE_CREATE_CONNECTION), 0x200D);
        assert!(Opcode::LE_CREATE_CONNECTION.is_le());
        assert!(Opcode::new(0x3F, 0x0001).is_vendor());
        assert_eq!(Opcode::new(0xFF, 0xFFFF), Opcode::from(0xFFFF));
        assert_eq!(format!("{:?}", Opcode::RESET), "Opcode(0x0C03)");
    }

    #[test]
    fn status() {
        assert_eq!(Status::from(0x00), Status::Success);
        assert_eq!(Status::from(0x0C), Status::CommandDisallowed);
        assert_eq!(Status::from(0xFF), Status::UnspecifiedError);
        assert!(!Status::PageTimeout.is_ok());
    }
}
