use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::buf_ext::{BufExt, BufMutExt};
use crate::error::DecodeError;
use crate::message_id::MessageId;

/// Number of 'system addresses' in the connection request accepted / new incoming connection
///  messages. They are a historical artifact and carry no meaning, but they are part of the layout.
pub const NUM_SYSTEM_ADDRESSES: usize = 10;

const PLACEHOLDER_ADDRESS: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

/// Messages that travel as frame payloads inside an established session, as opposed to
///  application payloads. They complete the login after the open connection handshake, keep the
///  session alive and end it.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ConnectedMessage {
    ConnectedPing(ConnectedPingData),
    ConnectedPong(ConnectedPongData),
    ConnectionRequest(ConnectionRequestData),
    ConnectionRequestAccepted(ConnectionRequestAcceptedData),
    NewIncomingConnection(NewIncomingConnectionData),
    DisconnectionNotification,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ConnectedPingData {
    pub timestamp: u64,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ConnectedPongData {
    pub ping_timestamp: u64,
    pub pong_timestamp: u64,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ConnectionRequestData {
    pub client_guid: u64,
    pub timestamp: u64,
    pub use_security: bool,
}

/// ```ascii
/// 0: id (u8)
/// 1: client address
/// *: reserved 'system index' (u16 BE)
/// *: 10 placeholder addresses
/// *: client timestamp (u64 BE)
/// *: server timestamp (u64 BE)
/// ```
///
/// A malformed address anywhere in the message invalidates all of it.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ConnectionRequestAcceptedData {
    pub client_address: SocketAddr,
    pub system_index: u16,
    pub client_timestamp: u64,
    pub server_timestamp: u64,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct NewIncomingConnectionData {
    pub server_address: SocketAddr,
    pub client_timestamp: u64,
    pub server_timestamp: u64,
}

impl ConnectedMessage {
    /// Checks if a frame payload starting with this byte is handled by the session itself rather
    ///  than passed on to the application
    pub fn is_connected_message_id(id: u8) -> bool {
        matches!(MessageId::try_from(id), Ok(
            MessageId::ConnectedPing
            | MessageId::ConnectedPong
            | MessageId::ConnectionRequest
            | MessageId::ConnectionRequestAccepted
            | MessageId::NewIncomingConnection
            | MessageId::DisconnectionNotification
        ))
    }

    pub fn id(&self) -> MessageId {
        match self {
            ConnectedMessage::ConnectedPing(_) => MessageId::ConnectedPing,
            ConnectedMessage::ConnectedPong(_) => MessageId::ConnectedPong,
            ConnectedMessage::ConnectionRequest(_) => MessageId::ConnectionRequest,
            ConnectedMessage::ConnectionRequestAccepted(_) => MessageId::ConnectionRequestAccepted,
            ConnectedMessage::NewIncomingConnection(_) => MessageId::NewIncomingConnection,
            ConnectedMessage::DisconnectionNotification => MessageId::DisconnectionNotification,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.id().into());
        match self {
            ConnectedMessage::ConnectedPing(data) => {
                buf.put_u64(data.timestamp);
            }
            ConnectedMessage::ConnectedPong(data) => {
                buf.put_u64(data.ping_timestamp);
                buf.put_u64(data.pong_timestamp);
            }
            ConnectedMessage::ConnectionRequest(data) => {
                buf.put_u64(data.client_guid);
                buf.put_u64(data.timestamp);
                buf.put_bool(data.use_security);
            }
            ConnectedMessage::ConnectionRequestAccepted(data) => Self::ser_connection_request_accepted(data, buf),
            ConnectedMessage::NewIncomingConnection(data) => Self::ser_new_incoming_connection(data, buf),
            ConnectedMessage::DisconnectionNotification => {}
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    fn ser_connection_request_accepted(data: &ConnectionRequestAcceptedData, buf: &mut impl BufMut) {
        buf.put_address(&data.client_address);
        buf.put_u16(data.system_index);
        for _ in 0..NUM_SYSTEM_ADDRESSES {
            buf.put_address(&PLACEHOLDER_ADDRESS);
        }
        buf.put_u64(data.client_timestamp);
        buf.put_u64(data.server_timestamp);
    }

    fn ser_new_incoming_connection(data: &NewIncomingConnectionData, buf: &mut impl BufMut) {
        buf.put_address(&data.server_address);
        for _ in 0..NUM_SYSTEM_ADDRESSES {
            buf.put_address(&PLACEHOLDER_ADDRESS);
        }
        buf.put_u64(data.client_timestamp);
        buf.put_u64(data.server_timestamp);
    }

    pub fn deser(mut buf: &[u8]) -> Result<ConnectedMessage, DecodeError> {
        let id = buf.try_get_u8()?;
        match MessageId::try_from(id) {
            Ok(MessageId::ConnectedPing) => Ok(ConnectedMessage::ConnectedPing(ConnectedPingData {
                timestamp: buf.try_get_u64()?,
            })),
            Ok(MessageId::ConnectedPong) => Ok(ConnectedMessage::ConnectedPong(ConnectedPongData {
                ping_timestamp: buf.try_get_u64()?,
                pong_timestamp: buf.try_get_u64()?,
            })),
            Ok(MessageId::ConnectionRequest) => Ok(ConnectedMessage::ConnectionRequest(ConnectionRequestData {
                client_guid: buf.try_get_u64()?,
                timestamp: buf.try_get_u64()?,
                use_security: buf.try_get_bool()?,
            })),
            Ok(MessageId::ConnectionRequestAccepted) => Self::deser_connection_request_accepted(&mut buf),
            Ok(MessageId::NewIncomingConnection) => Self::deser_new_incoming_connection(&mut buf),
            Ok(MessageId::DisconnectionNotification) => Ok(ConnectedMessage::DisconnectionNotification),
            _ => Err(DecodeError::UnknownMessageId(id)),
        }
    }

    fn skip_system_addresses(buf: &mut impl Buf) -> Result<(), DecodeError> {
        for _ in 0..NUM_SYSTEM_ADDRESSES {
            buf.try_get_address()?;
        }
        Ok(())
    }

    fn deser_connection_request_accepted(buf: &mut impl Buf) -> Result<ConnectedMessage, DecodeError> {
        let client_address = buf.try_get_address()?;
        let system_index = buf.try_get_u16()?;
        Self::skip_system_addresses(buf)?;
        let client_timestamp = buf.try_get_u64()?;
        let server_timestamp = buf.try_get_u64()?;
        Ok(ConnectedMessage::ConnectionRequestAccepted(ConnectionRequestAcceptedData {
            client_address,
            system_index,
            client_timestamp,
            server_timestamp,
        }))
    }

    fn deser_new_incoming_connection(buf: &mut impl Buf) -> Result<ConnectedMessage, DecodeError> {
        let server_address = buf.try_get_address()?;
        Self::skip_system_addresses(buf)?;
        let client_timestamp = buf.try_get_u64()?;
        let server_timestamp = buf.try_get_u64()?;
        Ok(ConnectedMessage::NewIncomingConnection(NewIncomingConnectionData {
            server_address,
            client_timestamp,
            server_timestamp,
        }))
    }
}
