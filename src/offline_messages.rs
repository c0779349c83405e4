use std::net::SocketAddr;

use bytes::{Buf, BufMut, BytesMut};

use crate::buf_ext::{BufExt, BufMutExt, OFFLINE_MESSAGE_MAGIC};
use crate::datagram::UDP_IP_HEADER_SIZE;
use crate::error::DecodeError;
use crate::message_id::MessageId;

/// message id, magic and protocol version
const OPEN_CONNECTION_REQUEST_1_HEADER_SIZE: usize = 1 + OFFLINE_MESSAGE_MAGIC.len() + 1;

/// Messages exchanged outside of a session: discovery and the two phase open connection handshake.
///  Each is a single datagram starting with its [MessageId].
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum OfflineMessage {
    UnconnectedPing(UnconnectedPingData),
    /// Like [OfflineMessage::UnconnectedPing], but servers answer only while they have free
    ///  incoming connections
    UnconnectedPingOpenConnections(UnconnectedPingData),
    UnconnectedPong(UnconnectedPongData),
    OpenConnectionRequest1(OpenConnectionRequest1Data),
    OpenConnectionReply1(OpenConnectionReply1Data),
    OpenConnectionRequest2(OpenConnectionRequest2Data),
    OpenConnectionReply2(OpenConnectionReply2Data),
    AlreadyConnected,
    NoFreeIncomingConnections,
    ConnectionBanned(ConnectionBannedData),
    IncompatibleProtocolVersion(IncompatibleProtocolVersionData),
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct UnconnectedPingData {
    pub timestamp: u64,
    /// older clients do not send their guid
    pub client_guid: Option<u64>,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct UnconnectedPongData {
    pub ping_timestamp: u64,
    pub server_guid: u64,
    pub identifier: String,
}

/// The client's MTU is not transmitted explicitly: the request is padded so that the datagram
///  has exactly the size the MTU allows, and only arrives if the path supports that size.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct OpenConnectionRequest1Data {
    pub protocol_version: u8,
    pub mtu: u16,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct OpenConnectionReply1Data {
    pub server_guid: u64,
    pub use_security: bool,
    pub mtu: u16,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct OpenConnectionRequest2Data {
    pub server_address: SocketAddr,
    pub mtu: u16,
    pub client_guid: u64,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct OpenConnectionReply2Data {
    pub server_guid: u64,
    pub client_address: SocketAddr,
    pub mtu: u16,
    pub encryption_enabled: bool,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ConnectionBannedData {
    pub server_guid: u64,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct IncompatibleProtocolVersionData {
    pub protocol_version: u8,
    pub server_guid: u64,
}

/// id + magic + protocol version
const OPEN_CONNECTION_REQUEST_1_UNPADDED_LEN: usize = 1 + OFFLINE_MESSAGE_MAGIC.len() + 1;

impl OfflineMessage {
    pub fn id(&self) -> MessageId {
        match self {
            OfflineMessage::UnconnectedPing(_) => MessageId::UnconnectedPing,
            OfflineMessage::UnconnectedPingOpenConnections(_) => MessageId::UnconnectedPingOpenConnections,
            OfflineMessage::UnconnectedPong(_) => MessageId::UnconnectedPong,
            OfflineMessage::OpenConnectionRequest1(_) => MessageId::OpenConnectionRequest1,
            OfflineMessage::OpenConnectionReply1(_) => MessageId::OpenConnectionReply1,
            OfflineMessage::OpenConnectionRequest2(_) => MessageId::OpenConnectionRequest2,
            OfflineMessage::OpenConnectionReply2(_) => MessageId::OpenConnectionReply2,
            OfflineMessage::AlreadyConnected => MessageId::AlreadyConnected,
            OfflineMessage::NoFreeIncomingConnections => MessageId::NoFreeIncomingConnections,
            OfflineMessage::ConnectionBanned(_) => MessageId::ConnectionBanned,
            OfflineMessage::IncompatibleProtocolVersion(_) => MessageId::IncompatibleProtocolVersion,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.id().into());
        match self {
            OfflineMessage::UnconnectedPing(data) => Self::ser_unconnected_ping(data, buf),
            OfflineMessage::UnconnectedPingOpenConnections(data) => Self::ser_unconnected_ping(data, buf),
            OfflineMessage::UnconnectedPong(data) => Self::ser_unconnected_pong(data, buf),
            OfflineMessage::OpenConnectionRequest1(data) => Self::ser_open_connection_request_1(data, buf),
            OfflineMessage::OpenConnectionReply1(data) => Self::ser_open_connection_reply_1(data, buf),
            OfflineMessage::OpenConnectionRequest2(data) => Self::ser_open_connection_request_2(data, buf),
            OfflineMessage::OpenConnectionReply2(data) => Self::ser_open_connection_reply_2(data, buf),
            OfflineMessage::AlreadyConnected => {}
            OfflineMessage::NoFreeIncomingConnections => {}
            OfflineMessage::ConnectionBanned(data) => Self::ser_connection_banned(data, buf),
            OfflineMessage::IncompatibleProtocolVersion(data) => Self::ser_incompatible_protocol_version(data, buf),
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf
    }

    fn ser_unconnected_ping(data: &UnconnectedPingData, buf: &mut impl BufMut) {
        buf.put_u64(data.timestamp);
        buf.put_magic();
        if let Some(guid) = data.client_guid {
            buf.put_u64(guid);
        }
    }

    fn ser_unconnected_pong(data: &UnconnectedPongData, buf: &mut impl BufMut) {
        buf.put_u64(data.ping_timestamp);
        buf.put_u64(data.server_guid);
        buf.put_magic();
        buf.put_string(&data.identifier);
    }

    /// Writes everything after the message id, padding the datagram to the requested MTU
    fn ser_open_connection_request_1(data: &OpenConnectionRequest1Data, buf: &mut impl BufMut) {
        buf.put_magic();
        buf.put_u8(data.protocol_version);

        let datagram_len = usize::from(data.mtu).saturating_sub(UDP_IP_HEADER_SIZE);
        buf.put_bytes(0, datagram_len.saturating_sub(OPEN_CONNECTION_REQUEST_1_HEADER_SIZE));
    }

    fn ser_open_connection_reply_1(data: &OpenConnectionReply1Data, buf: &mut impl BufMut) {
        buf.put_magic();
        buf.put_u64(data.server_guid);
        buf.put_bool(data.use_security);
        buf.put_u16(data.mtu);
    }

    fn ser_open_connection_request_2(data: &OpenConnectionRequest2Data, buf: &mut impl BufMut) {
        buf.put_magic();
        buf.put_address(&data.server_address);
        buf.put_u16(data.mtu);
        buf.put_u64(data.client_guid);
    }

    fn ser_open_connection_reply_2(data: &OpenConnectionReply2Data, buf: &mut impl BufMut) {
        buf.put_magic();
        buf.put_u64(data.server_guid);
        buf.put_address(&data.client_address);
        buf.put_u16(data.mtu);
        buf.put_bool(data.encryption_enabled);
    }

    fn ser_connection_banned(data: &ConnectionBannedData, buf: &mut impl BufMut) {
        buf.put_magic();
        buf.put_u64(data.server_guid);
    }

    fn ser_incompatible_protocol_version(data: &IncompatibleProtocolVersionData, buf: &mut impl BufMut) {
        buf.put_u8(data.protocol_version);
        buf.put_magic();
        buf.put_u64(data.server_guid);
    }

    /// Decodes a complete datagram. The whole datagram is needed (rather than just a [Buf]) because
    ///  the length of an open connection request 1 is its payload.
    pub fn deser(datagram: &[u8]) -> Result<OfflineMessage, DecodeError> {
        let mut buf = datagram;
        let id = buf.try_get_u8()?;
        let id = MessageId::try_from(id)
            .map_err(|_| DecodeError::UnknownMessageId(id))?;

        match id {
            MessageId::UnconnectedPing => Ok(OfflineMessage::UnconnectedPing(Self::deser_unconnected_ping(&mut buf)?)),
            MessageId::UnconnectedPingOpenConnections => Ok(OfflineMessage::UnconnectedPingOpenConnections(Self::deser_unconnected_ping(&mut buf)?)),
            MessageId::UnconnectedPong => Self::deser_unconnected_pong(&mut buf),
            MessageId::OpenConnectionRequest1 => Self::deser_open_connection_request_1(&mut buf, datagram.len()),
            MessageId::OpenConnectionReply1 => Self::deser_open_connection_reply_1(&mut buf),
            MessageId::OpenConnectionRequest2 => Self::deser_open_connection_request_2(&mut buf),
            MessageId::OpenConnectionReply2 => Self::deser_open_connection_reply_2(&mut buf),
            MessageId::AlreadyConnected => Ok(OfflineMessage::AlreadyConnected),
            MessageId::NoFreeIncomingConnections => Ok(OfflineMessage::NoFreeIncomingConnections),
            MessageId::ConnectionBanned => Self::deser_connection_banned(&mut buf),
            MessageId::IncompatibleProtocolVersion => Self::deser_incompatible_protocol_version(&mut buf),
            other => Err(DecodeError::UnknownMessageId(other.into())),
        }
    }

    fn deser_unconnected_ping(buf: &mut impl Buf) -> Result<UnconnectedPingData, DecodeError> {
        let timestamp = buf.try_get_u64()?;
        buf.try_get_magic()?;
        let client_guid = if buf.remaining() >= 8 {
            Some(buf.get_u64())
        }
        else {
            None
        };
        Ok(UnconnectedPingData { timestamp, client_guid })
    }

    fn deser_unconnected_pong(buf: &mut impl Buf) -> Result<OfflineMessage, DecodeError> {
        let ping_timestamp = buf.try_get_u64()?;
        let server_guid = buf.try_get_u64()?;
        buf.try_get_magic()?;
        let identifier = buf.try_get_string()?;
        Ok(OfflineMessage::UnconnectedPong(UnconnectedPongData { ping_timestamp, server_guid, identifier }))
    }

    fn deser_open_connection_request_1(buf: &mut impl Buf, datagram_len: usize) -> Result<OfflineMessage, DecodeError> {
        buf.try_get_magic()?;
        let protocol_version = buf.try_get_u8()?;
        let mtu = (datagram_len + UDP_IP_HEADER_SIZE).min(u16::MAX as usize) as u16;
        Ok(OfflineMessage::OpenConnectionRequest1(OpenConnectionRequest1Data { protocol_version, mtu }))
    }

    fn deser_open_connection_reply_1(buf: &mut impl Buf) -> Result<OfflineMessage, DecodeError> {
        buf.try_get_magic()?;
        let server_guid = buf.try_get_u64()?;
        let use_security = buf.try_get_bool()?;
        let mtu = buf.try_get_u16()?;
        Ok(OfflineMessage::OpenConnectionReply1(OpenConnectionReply1Data { server_guid, use_security, mtu }))
    }

    fn deser_open_connection_request_2(buf: &mut impl Buf) -> Result<OfflineMessage, DecodeError> {
        buf.try_get_magic()?;
        let server_address = buf.try_get_address()?;
        let mtu = buf.try_get_u16()?;
        let client_guid = buf.try_get_u64()?;
        Ok(OfflineMessage::OpenConnectionRequest2(OpenConnectionRequest2Data { server_address, mtu, client_guid }))
    }

    fn deser_open_connection_reply_2(buf: &mut impl Buf) -> Result<OfflineMessage, DecodeError> {
        buf.try_get_magic()?;
        let server_guid = buf.try_get_u64()?;
        let client_address = buf.try_get_address()?;
        let mtu = buf.try_get_u16()?;
        let encryption_enabled = buf.try_get_bool()?;
        Ok(OfflineMessage::OpenConnectionReply2(OpenConnectionReply2Data { server_guid, client_address, mtu, encryption_enabled }))
    }

    fn deser_connection_banned(buf: &mut impl Buf) -> Result<OfflineMessage, DecodeError> {
        buf.try_get_magic()?;
        let server_guid = buf.try_get_u64()?;
        Ok(OfflineMessage::ConnectionBanned(ConnectionBannedData { server_guid }))
    }

    fn deser_incompatible_protocol_version(buf: &mut impl Buf) -> Result<OfflineMessage, DecodeError> {
        let protocol_version = buf.try_get_u8()?;
        buf.try_get_magic()?;
        let server_guid = buf.try_get_u64()?;
        Ok(OfflineMessage::IncompatibleProtocolVersion(IncompatibleProtocolVersionData { protocol_version, server_guid }))
    }
}
