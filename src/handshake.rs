//! The two phase open connection handshake that precedes a session.
//!
//! The client sends OPEN_CONNECTION_REQUEST_1 padded to the MTU it would like to use, and
//!  the server confirms the MTU and sends its guid. The client then sends OPEN_CONNECTION_REQUEST_2
//!  with the agreed MTU and its own guid, and the server creates the session before it replies.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::{RakNetConfig, MINIMUM_MTU};
use crate::error::{DecodeError, HandshakeError};
use crate::message_id::MessageId;
use crate::offline_messages::{ConnectionBannedData, IncompatibleProtocolVersionData, OfflineMessage, OpenConnectionReply1Data, OpenConnectionReply2Data, OpenConnectionRequest1Data, OpenConnectionRequest2Data};
use crate::send_socket::SendSocket;
use crate::session::{Session, SessionRole, SessionState};
use crate::session_registry::SessionRegistry;

const PHASE_1: usize = 0;
const PHASE_2: usize = 1;

/// The client's state of a single connection attempt. It is fed all offline datagrams from the
///  server and turns into a [Session] once both phases completed successfully.
///
/// Any validation failure cancels the attempt for good, and the cancellation reason is kept for
///  the caller to inspect.
pub struct SessionPreparation {
    client_guid: u64,
    max_mtu: u16,
    protocol_version: u8,

    server_guid: Option<u64>,
    mtu: Option<u16>,
    server_address: Option<SocketAddr>,
    phases_done: [bool; 2],
    cancel_reason: Option<HandshakeError>,
}

impl SessionPreparation {
    pub fn new(client_guid: u64, max_mtu: u16, protocol_version: u8) -> SessionPreparation {
        SessionPreparation {
            client_guid,
            max_mtu,
            protocol_version,
            server_guid: None,
            mtu: None,
            server_address: None,
            phases_done: [false; 2],
            cancel_reason: None,
        }
    }

    pub fn request_1(&self, mtu: u16) -> OfflineMessage {
        OfflineMessage::OpenConnectionRequest1(OpenConnectionRequest1Data {
            protocol_version: self.protocol_version,
            mtu,
        })
    }

    /// `None` until phase 1 is done
    pub fn request_2(&self) -> Option<OfflineMessage> {
        Some(OfflineMessage::OpenConnectionRequest2(OpenConnectionRequest2Data {
            server_address: self.server_address?,
            mtu: self.mtu?,
            client_guid: self.client_guid,
        }))
    }

    pub fn state(&self) -> SessionState {
        match self.phases_done {
            [_, true] => SessionState::Handshaking,
            [true, false] => SessionState::Connecting,
            [false, false] => SessionState::Unconnected,
        }
    }

    pub fn is_phase_1_done(&self) -> bool {
        self.phases_done[PHASE_1]
    }
    pub fn is_phase_2_done(&self) -> bool {
        self.phases_done[PHASE_2]
    }
    pub fn cancel_reason(&self) -> Option<&HandshakeError> {
        self.cancel_reason.as_ref()
    }
    pub fn is_cancelled(&self) -> bool {
        self.cancel_reason.is_some()
    }
    pub fn mtu(&self) -> Option<u16> {
        self.mtu
    }
    pub fn server_guid(&self) -> Option<u64> {
        self.server_guid
    }

    fn cancel(&mut self, reason: HandshakeError) {
        debug!("cancelling connection attempt: {}", reason);
        self.cancel_reason = Some(reason);
    }

    /// Processes an offline datagram from the server. Datagrams that play no role in the handshake
    ///  are ignored.
    pub fn handle_datagram(&mut self, sender: SocketAddr, datagram: &[u8]) {
        if self.is_cancelled() {
            return;
        }

        let message = match OfflineMessage::deser(datagram) {
            Ok(message) => message,
            Err(e) => {
                let is_reply = matches!(
                    datagram.first().map(|&id| MessageId::try_from(id)),
                    Some(Ok(MessageId::OpenConnectionReply1 | MessageId::OpenConnectionReply2))
                );
                if is_reply {
                    self.cancel(match e {
                        DecodeError::MagicMismatch => HandshakeError::MagicMismatch,
                        e => HandshakeError::FrameDecodeFailure(e),
                    });
                }
                else {
                    trace!("ignoring undecodable datagram from {:?}: {}", sender, e);
                }
                return;
            }
        };

        match message {
            OfflineMessage::OpenConnectionReply1(data) => self.on_reply_1(sender, data),
            OfflineMessage::OpenConnectionReply2(data) => self.on_reply_2(data),
            OfflineMessage::AlreadyConnected => self.cancel(HandshakeError::AlreadyConnected),
            OfflineMessage::NoFreeIncomingConnections => self.cancel(HandshakeError::NoFreeIncomingConnections),
            OfflineMessage::ConnectionBanned(data) => {
                if self.is_from_server(data.server_guid) {
                    self.cancel(HandshakeError::ConnectionBanned);
                }
            }
            OfflineMessage::IncompatibleProtocolVersion(data) => {
                if self.is_from_server(data.server_guid) {
                    self.cancel(HandshakeError::IncompatibleProtocolVersion { server: data.protocol_version, client: self.protocol_version });
                }
            }
            other => trace!("ignoring {:?} during handshake", other.id()),
        }
    }

    /// Rejections can arrive before the server's guid is known
    fn is_from_server(&self, guid: u64) -> bool {
        self.server_guid.map_or(true, |server_guid| server_guid == guid)
    }

    fn on_reply_1(&mut self, sender: SocketAddr, data: OpenConnectionReply1Data) {
        if self.is_phase_1_done() {
            trace!("ignoring duplicate open connection reply 1");
            return;
        }
        if data.mtu < MINIMUM_MTU || data.mtu > self.max_mtu {
            self.cancel(HandshakeError::MtuOutOfRange { mtu: data.mtu, min: MINIMUM_MTU, max: self.max_mtu });
            return;
        }

        self.server_guid = Some(data.server_guid);
        self.mtu = Some(data.mtu);
        self.server_address = Some(sender);
        self.phases_done[PHASE_1] = true;
    }

    fn on_reply_2(&mut self, data: OpenConnectionReply2Data) {
        let (Some(server_guid), Some(agreed)) = (self.server_guid, self.mtu) else {
            trace!("ignoring open connection reply 2 before reply 1");
            return;
        };

        if data.server_guid != server_guid {
            self.cancel(HandshakeError::GuidMismatch { expected: server_guid, actual: data.server_guid });
            return;
        }
        if data.mtu > agreed {
            self.cancel(HandshakeError::MtuRenegotiationViolation { agreed, requested: data.mtu });
            return;
        }
        if data.mtu < MINIMUM_MTU {
            self.cancel(HandshakeError::MtuOutOfRange { mtu: data.mtu, min: MINIMUM_MTU, max: agreed });
            return;
        }

        self.mtu = Some(data.mtu);
        self.phases_done[PHASE_2] = true;
    }

    pub fn ready_for_session(&self) -> bool {
        !self.is_cancelled()
            && self.server_guid.is_some()
            && self.mtu.is_some()
            && self.server_address.is_some()
            && self.phases_done.iter().all(|&done| done)
    }

    /// The client side session, if the handshake completed successfully
    pub fn into_session(self, socket: Arc<dyn SendSocket>, config: &RakNetConfig, epoch: Instant, now: Instant) -> Option<Session> {
        if !self.ready_for_session() {
            return None;
        }
        Some(Session::new(SessionRole::Client, self.server_address?, self.server_guid?, self.mtu?, socket, config, epoch, now))
    }
}

/// The server side of the open connection handshake
pub struct HandshakeResponder {
    server_guid: u64,
    protocol_version: u8,
    max_mtu: u16,
    max_connections: usize,
}

impl HandshakeResponder {
    pub fn new(server_guid: u64, config: &RakNetConfig) -> HandshakeResponder {
        HandshakeResponder {
            server_guid,
            protocol_version: config.protocol_version,
            max_mtu: config.max_mtu,
            max_connections: config.max_connections,
        }
    }

    /// Checks common to both requests, in order of priority. Returns the rejection to send if any.
    fn validate_sender(&self, registry: &mut SessionRegistry, sender: SocketAddr, now: Instant) -> Option<OfflineMessage> {
        if registry.get(&sender).map_or(false, Session::is_connected) {
            registry.remove_session(sender, "Client re-instantiated connection", now);
        }

        if registry.has_session(&sender) {
            Some(OfflineMessage::AlreadyConnected)
        }
        else if registry.len() >= self.max_connections {
            Some(OfflineMessage::NoFreeIncomingConnections)
        }
        else if registry.is_blocked(sender.ip(), now) {
            Some(OfflineMessage::ConnectionBanned(ConnectionBannedData { server_guid: self.server_guid }))
        }
        else {
            None
        }
    }

    fn is_acceptable_mtu(&self, mtu: u16) -> bool {
        (MINIMUM_MTU..=self.max_mtu).contains(&mtu)
    }

    pub fn on_open_connection_request_1(&self, registry: &mut SessionRegistry, sender: SocketAddr, data: &OpenConnectionRequest1Data, now: Instant) -> Option<OfflineMessage> {
        if let Some(rejection) = self.validate_sender(registry, sender, now) {
            debug!("rejecting open connection request 1 from {:?}: {:?}", sender, rejection.id());
            return Some(rejection);
        }

        if data.protocol_version != self.protocol_version {
            debug!("open connection request 1 from {:?} with protocol version {}", sender, data.protocol_version);
            return Some(OfflineMessage::IncompatibleProtocolVersion(IncompatibleProtocolVersionData {
                protocol_version: self.protocol_version,
                server_guid: self.server_guid,
            }));
        }

        if !self.is_acceptable_mtu(data.mtu) {
            trace!("ignoring open connection request 1 from {:?} with MTU {}", sender, data.mtu);
            return None;
        }

        Some(OfflineMessage::OpenConnectionReply1(OpenConnectionReply1Data {
            server_guid: self.server_guid,
            use_security: false,
            mtu: data.mtu,
        }))
    }

    /// Creates the session on success, before the reply is sent
    pub fn on_open_connection_request_2(&self, registry: &mut SessionRegistry, sender: SocketAddr, data: &OpenConnectionRequest2Data, now: Instant) -> Option<OfflineMessage> {
        if let Some(rejection) = self.validate_sender(registry, sender, now) {
            debug!("rejecting open connection request 2 from {:?}: {:?}", sender, rejection.id());
            return Some(rejection);
        }

        if registry.has_guid(data.client_guid) {
            debug!("guid {} from {:?} is already connected", data.client_guid, sender);
            return Some(OfflineMessage::AlreadyConnected);
        }

        if !self.is_acceptable_mtu(data.mtu) {
            trace!("ignoring open connection request 2 from {:?} with MTU {}", sender, data.mtu);
            return None;
        }

        registry.create_session(sender, data.client_guid, data.mtu, now);

        Some(OfflineMessage::OpenConnectionReply2(OpenConnectionReply2Data {
            server_guid: self.server_guid,
            client_address: sender,
            mtu: data.mtu,
            encryption_enabled: false,
        }))
    }
}
