use num_enum::{IntoPrimitive, TryFromPrimitive};

/// First byte of offline messages (handshake and discovery) and of connected messages carried
///  inside frames. The values are fixed by the RakNet protocol.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum MessageId {
    ConnectedPing = 0x00,
    UnconnectedPing = 0x01,
    UnconnectedPingOpenConnections = 0x02,
    ConnectedPong = 0x03,
    OpenConnectionRequest1 = 0x05,
    OpenConnectionReply1 = 0x06,
    OpenConnectionRequest2 = 0x07,
    OpenConnectionReply2 = 0x08,
    ConnectionRequest = 0x09,
    ConnectionRequestAccepted = 0x10,
    AlreadyConnected = 0x12,
    NewIncomingConnection = 0x13,
    NoFreeIncomingConnections = 0x14,
    DisconnectionNotification = 0x15,
    ConnectionBanned = 0x17,
    IncompatibleProtocolVersion = 0x19,
    UnconnectedPong = 0x1c,
}

pub const ID_CUSTOM_0: u8 = 0x80;
/// custom packet id used for all outgoing datagrams
pub const ID_CUSTOM_4: u8 = 0x84;
pub const ID_CUSTOM_F: u8 = 0x8f;
pub const ID_NACK: u8 = 0xa0;
pub const ID_ACK: u8 = 0xc0;

/// Classification of a datagram by its first byte, used for dispatching inbound traffic
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DatagramKind {
    /// a datagram carrying frames for an established session
    Custom,
    Ack,
    Nack,
    /// a message outside of any session
    Offline(MessageId),
    Unknown(u8),
}

impl DatagramKind {
    pub fn classify(first_byte: u8) -> DatagramKind {
        match first_byte {
            ID_CUSTOM_0..=ID_CUSTOM_F => DatagramKind::Custom,
            ID_ACK => DatagramKind::Ack,
            ID_NACK => DatagramKind::Nack,
            b => match MessageId::try_from(b) {
                Ok(id) => DatagramKind::Offline(id),
                Err(_) => DatagramKind::Unknown(b),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::custom_0(0x80, DatagramKind::Custom)]
    #[case::custom_4(0x84, DatagramKind::Custom)]
    #[case::custom_f(0x8f, DatagramKind::Custom)]
    #[case::after_custom(0x90, DatagramKind::Unknown(0x90))]
    #[case::ack(0xc0, DatagramKind::Ack)]
    #[case::nack(0xa0, DatagramKind::Nack)]
    #[case::ping(0x01, DatagramKind::Offline(MessageId::UnconnectedPing))]
    #[case::open_connections_ping(0x02, DatagramKind::Offline(MessageId::UnconnectedPingOpenConnections))]
    #[case::request_1(0x05, DatagramKind::Offline(MessageId::OpenConnectionRequest1))]
    #[case::request_2(0x07, DatagramKind::Offline(MessageId::OpenConnectionRequest2))]
    #[case::banned(0x17, DatagramKind::Offline(MessageId::ConnectionBanned))]
    #[case::pong(0x1c, DatagramKind::Offline(MessageId::UnconnectedPong))]
    #[case::unassigned(0x04, DatagramKind::Unknown(0x04))]
    #[case::game(0xfe, DatagramKind::Unknown(0xfe))]
    fn test_classify(#[case] first_byte: u8, #[case] expected: DatagramKind) {
        assert_eq!(DatagramKind::classify(first_byte), expected);
    }
}
