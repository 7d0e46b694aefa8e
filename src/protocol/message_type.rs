//! Message type definitions for the coordinator serial protocol.
//!
//! Every frame carries a 16-bit message type. Types sent by the host are in
//! the low range; most types sent by the coordinator have the top bit set.
//! Only [`MessageType::Status`] and [`MessageType::Log`] have meaning to the
//! link layer itself, the rest are listed so callers and log output can name
//! the common ones.

/// Well-known message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    // Host to coordinator
    /// Request firmware version.
    GetVersion = 0x0010,
    /// Reset the coordinator.
    Reset = 0x0011,
    /// Erase persistent network data.
    ErasePersistentData = 0x0012,
    /// Set the channel mask.
    SetChannelMask = 0x0021,
    /// Set the device type (coordinator/router).
    SetDeviceType = 0x0023,
    /// Form or join a network.
    StartNetwork = 0x0024,
    /// Open the network for joining.
    PermitJoiningRequest = 0x0049,
    /// On/off cluster command.
    OnOff = 0x0092,
    /// Read attribute request.
    ReadAttributeRequest = 0x0100,

    // Coordinator to host
    /// Device announce (unsolicited).
    DeviceAnnounce = 0x004D,
    /// Acknowledgement of a host command.
    Status = 0x8000,
    /// Coordinator log line.
    Log = 0x8001,
    /// Firmware version response.
    VersionList = 0x8010,
    /// Network joined or formed.
    NetworkJoinedFormed = 0x8024,
    /// Device left the network.
    LeaveIndication = 0x8048,
    /// Read attribute response.
    ReadAttributeResponse = 0x8100,
    /// ZCL default response.
    DefaultResponse = 0x8101,
    /// Attribute report (unsolicited).
    AttributeReport = 0x8102,
}

impl MessageType {
    /// Parses a message type from its wire value.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0010 => Some(Self::GetVersion),
            0x0011 => Some(Self::Reset),
            0x0012 => Some(Self::ErasePersistentData),
            0x0021 => Some(Self::SetChannelMask),
            0x0023 => Some(Self::SetDeviceType),
            0x0024 => Some(Self::StartNetwork),
            0x0049 => Some(Self::PermitJoiningRequest),
            0x0092 => Some(Self::OnOff),
            0x0100 => Some(Self::ReadAttributeRequest),
            0x004D => Some(Self::DeviceAnnounce),
            0x8000 => Some(Self::Status),
            0x8001 => Some(Self::Log),
            0x8010 => Some(Self::VersionList),
            0x8024 => Some(Self::NetworkJoinedFormed),
            0x8048 => Some(Self::LeaveIndication),
            0x8100 => Some(Self::ReadAttributeResponse),
            0x8101 => Some(Self::DefaultResponse),
            0x8102 => Some(Self::AttributeReport),
            _ => None,
        }
    }

    /// Returns the wire value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns true for types the link layer interprets itself.
    #[must_use]
    pub const fn is_reserved(self) -> bool {
        matches!(self, Self::Status | Self::Log)
    }
}

impl From<MessageType> for u16 {
    fn from(msg_type: MessageType) -> Self {
        msg_type as Self
    }
}

/// Wire value of the acknowledgement type.
pub const STATUS: u16 = MessageType::Status.as_u16();

/// Wire value of the coordinator log type.
pub const LOG: u16 = MessageType::Log.as_u16();
