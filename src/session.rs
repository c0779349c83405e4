use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::RakNetConfig;
use crate::datagram::{Acknowledge, AcknowledgeKind, CustomPacket};
use crate::error::{DecodeError, SessionError};
use crate::frame::Frame;
use crate::login_messages::{ConnectedMessage, ConnectedPingData, ConnectedPongData, ConnectionRequestAcceptedData, ConnectionRequestData, NewIncomingConnectionData};
use crate::message_id::{DatagramKind, ID_CUSTOM_4};
use crate::receive_window::{max_acknowledge_ranges, ReceiveWindow};
use crate::reliability::Reliability;
use crate::send_socket::SendSocket;
use crate::send_window::{Receipt, SendWindow};

const PACKET_COUNTER_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Handshaking,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionRole {
    Server,
    Client,
}

/// An application message, reassembled and in order
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceivedMessage {
    pub reliability: Reliability,
    pub channel: u8,
    pub payload: Bytes,
}

/// Things that happened to a session while it handled a datagram or was updated. The owner of the
///  session turns them into listener callbacks.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionEvent {
    Connected,
    /// the peer sent a disconnection notification
    Disconnected,
    Message(ReceivedMessage),
    Acknowledged(u32),
    Lost(u32),
}

impl From<Receipt> for SessionEvent {
    fn from(value: Receipt) -> Self {
        match value {
            Receipt::Acknowledged(id) => SessionEvent::Acknowledged(id),
            Receipt::Lost(id) => SessionEvent::Lost(id),
        }
    }
}

/// The connection to a single peer after the open connection handshake: the connected login,
///  keepalive, reliability in both directions and idle timeout.
///
/// A session does no I/O except sending through its socket. Inbound datagrams are passed in by its
///  owner, and time advances only through the `now` parameters, so a session behaves
///  deterministically in tests.
///
/// Frame payloads whose first byte is a connected message id (ping, pong, login, disconnect) are
///  handled by the session itself, all other payloads are application messages.
pub struct Session {
    role: SessionRole,
    address: SocketAddr,
    guid: u64,
    mtu: u16,
    state: SessionState,
    was_connected: bool,
    socket: Arc<dyn SendSocket>,

    send_window: SendWindow,
    receive_window: ReceiveWindow,
    max_ack_ranges: usize,

    epoch: Instant,
    created_at: Instant,
    last_activity: Instant,
    last_ping_sent: Instant,
    latency: Option<Duration>,

    packets_this_second: u32,
    packet_counter_reset_at: Instant,

    session_timeout: Duration,
    keepalive_interval: Duration,
}

impl Session {
    /// `guid` is the peer's guid. Timestamps on the wire are milliseconds since `epoch`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(role: SessionRole, address: SocketAddr, guid: u64, mtu: u16, socket: Arc<dyn SendSocket>, config: &RakNetConfig, epoch: Instant, now: Instant) -> Session {
        debug!("new {:?} session with {:?}, guid {}, MTU {}", role, address, guid, mtu);
        Session {
            role,
            address,
            guid,
            mtu,
            state: SessionState::Handshaking,
            was_connected: false,
            socket,
            send_window: SendWindow::new(mtu, config),
            receive_window: ReceiveWindow::new(config),
            max_ack_ranges: max_acknowledge_ranges(mtu),
            epoch,
            created_at: now,
            last_activity: now,
            last_ping_sent: now,
            latency: None,
            packets_this_second: 0,
            packet_counter_reset_at: now,
            session_timeout: config.session_timeout,
            keepalive_interval: config.keepalive_interval,
        }
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }
    pub fn address(&self) -> SocketAddr {
        self.address
    }
    pub fn guid(&self) -> u64 {
        self.guid
    }
    pub fn mtu(&self) -> u16 {
        self.mtu
    }
    pub fn state(&self) -> SessionState {
        self.state
    }
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
    /// whether the session completed the login at some point, even if it is disconnecting now
    pub fn was_connected(&self) -> bool {
        self.was_connected
    }
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }
    /// round trip time of the most recent connected ping
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }
    pub fn packets_this_second(&self) -> u32 {
        self.packets_this_second
    }
    pub fn num_unacknowledged(&self) -> usize {
        self.send_window.num_unacknowledged()
    }

    fn timestamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Queues an application message. It is sent on the next flush, i.e. the next update at the
    ///  latest. Returns the receipt id for reliabilities with ack receipt.
    pub fn send_message(&mut self, reliability: Reliability, channel: u8, payload: Bytes) -> Result<Option<u32>, SessionError> {
        self.send_window.queue_message(reliability, channel, payload)
    }

    fn send_connected_message(&mut self, reliability: Reliability, message: ConnectedMessage) {
        trace!("sending {:?} to {:?}", message.id(), self.address);
        if let Err(e) = self.send_window.queue_message(reliability, 0, message.to_bytes()) {
            warn!("failed to queue {:?} for {:?}: {}", message.id(), self.address, e);
        }
    }

    pub fn flush(&mut self, now: Instant) {
        for packet in self.send_window.flush(now) {
            self.socket.do_send_packet(self.address, &packet.to_bytes());
        }
    }

    /// Client side: starts the connected login after the open connection handshake
    pub fn request_connection(&mut self, local_guid: u64, now: Instant) {
        let timestamp = self.timestamp(now);
        self.send_connected_message(Reliability::ReliableOrdered, ConnectedMessage::ConnectionRequest(ConnectionRequestData {
            client_guid: local_guid,
            timestamp,
            use_security: false,
        }));
        self.flush(now);
    }

    /// Sends a disconnection notification. The session is unusable afterwards.
    pub fn close(&mut self, now: Instant) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.send_connected_message(Reliability::Unreliable, ConnectedMessage::DisconnectionNotification);
        self.flush(now);
        self.state = SessionState::Disconnected;
    }

    /// Handles a custom packet, ACK or NACK from the session's peer
    pub fn handle_datagram(&mut self, mut datagram: &[u8], now: Instant) -> Result<Vec<SessionEvent>, DecodeError> {
        let Some(&id) = datagram.first() else {
            return Err(DecodeError::Truncated { needed: 1, remaining: 0 });
        };
        match DatagramKind::classify(id) {
            DatagramKind::Custom => {
                let packet = CustomPacket::deser(&mut datagram)?;
                Ok(self.handle_custom(packet, now))
            }
            DatagramKind::Ack | DatagramKind::Nack => {
                let ack = Acknowledge::deser(&mut datagram)?;
                Ok(self.handle_acknowledge(&ack, now))
            }
            _ => Err(DecodeError::UnexpectedMessageId { expected: ID_CUSTOM_4, actual: id }),
        }
    }

    fn on_packet_received(&mut self, now: Instant) {
        self.packets_this_second += 1;
        self.last_activity = now;
    }

    pub fn handle_custom(&mut self, packet: CustomPacket, now: Instant) -> Vec<SessionEvent> {
        self.on_packet_received(now);

        let mut events = Vec::new();
        let mut acknowledge = true;
        for frame in packet.frames {
            match self.receive_window.on_frame(frame) {
                Ok(deliverable) => {
                    for frame in deliverable {
                        self.handle_frame(frame, now, &mut events);
                    }
                }
                Err(e) if e.is_retriable() => {
                    debug!("not acknowledging datagram #{} from {:?}: {}", packet.sequence_number, self.address, e);
                    acknowledge = false;
                }
                Err(e) => warn!("dropping frame from {:?}: {}", self.address, e),
            }
        }
        if acknowledge {
            self.receive_window.on_datagram(packet.sequence_number);
        }

        self.flush(now);
        events
    }

    pub fn handle_acknowledge(&mut self, ack: &Acknowledge, now: Instant) -> Vec<SessionEvent> {
        self.on_packet_received(now);

        let receipts = match ack.kind {
            AcknowledgeKind::Ack => self.send_window.on_ack(ack, now),
            AcknowledgeKind::Nack => {
                let receipts = self.send_window.on_nack(ack);
                self.flush(now);
                receipts
            }
        };
        receipts.into_iter().map(SessionEvent::from).collect()
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant, events: &mut Vec<SessionEvent>) {
        let Some(&id) = frame.payload.first() else {
            debug!("dropping empty frame from {:?}", self.address);
            return;
        };

        if ConnectedMessage::is_connected_message_id(id) {
            match ConnectedMessage::deser(&frame.payload) {
                Ok(message) => self.handle_connected_message(message, now, events),
                Err(e) => warn!("dropping malformed connected message from {:?}: {}", self.address, e),
            }
            return;
        }

        if !self.is_connected() {
            debug!("dropping application message from {:?} in state {:?}", self.address, self.state);
            return;
        }
        events.push(SessionEvent::Message(ReceivedMessage {
            reliability: frame.reliability,
            channel: frame.order.map(|o| o.channel).unwrap_or_default(),
            payload: frame.payload,
        }));
    }

    fn handle_connected_message(&mut self, message: ConnectedMessage, now: Instant, events: &mut Vec<SessionEvent>) {
        trace!("received {:?} from {:?}", message.id(), self.address);

        match (message, self.role) {
            (ConnectedMessage::ConnectedPing(data), _) => {
                let pong_timestamp = self.timestamp(now);
                self.send_connected_message(Reliability::Unreliable, ConnectedMessage::ConnectedPong(ConnectedPongData {
                    ping_timestamp: data.timestamp,
                    pong_timestamp,
                }));
            }
            (ConnectedMessage::ConnectedPong(data), _) => {
                let rtt = self.timestamp(now).saturating_sub(data.ping_timestamp);
                self.latency = Some(Duration::from_millis(rtt));
            }
            (ConnectedMessage::ConnectionRequest(data), SessionRole::Server) => {
                if data.client_guid != self.guid {
                    warn!("connection request from {:?} with guid {}, expected {} - ignoring", self.address, data.client_guid, self.guid);
                    return;
                }
                let server_timestamp = self.timestamp(now);
                self.send_connected_message(Reliability::ReliableOrdered, ConnectedMessage::ConnectionRequestAccepted(ConnectionRequestAcceptedData {
                    client_address: self.address,
                    system_index: 0,
                    client_timestamp: data.timestamp,
                    server_timestamp,
                }));
            }
            (ConnectedMessage::ConnectionRequestAccepted(data), SessionRole::Client) => {
                if self.state != SessionState::Handshaking {
                    debug!("ignoring duplicate connection request accepted from {:?}", self.address);
                    return;
                }
                let client_timestamp = self.timestamp(now);
                self.send_connected_message(Reliability::ReliableOrdered, ConnectedMessage::NewIncomingConnection(NewIncomingConnectionData {
                    server_address: self.address,
                    client_timestamp,
                    server_timestamp: data.server_timestamp,
                }));
                self.on_connected();
                events.push(SessionEvent::Connected);
            }
            (ConnectedMessage::NewIncomingConnection(_), SessionRole::Server) => {
                if self.state != SessionState::Handshaking {
                    return;
                }
                self.on_connected();
                events.push(SessionEvent::Connected);
            }
            (ConnectedMessage::DisconnectionNotification, _) => {
                if self.state != SessionState::Disconnected {
                    self.state = SessionState::Disconnecting;
                    events.push(SessionEvent::Disconnected);
                }
            }
            (message, role) => {
                debug!("ignoring {:?} from {:?} in role {:?}", message.id(), self.address, role);
            }
        }
    }

    fn on_connected(&mut self) {
        debug!("session with {:?} connected", self.address);
        self.state = SessionState::Connected;
        self.was_connected = true;
    }

    #[cfg(test)]
    pub(crate) fn force_connected(&mut self) {
        self.on_connected();
    }

    /// Periodic maintenance: idle timeout, keepalive, resends, acknowledgments and the per-second
    ///  packet counter
    pub fn update(&mut self, now: Instant) -> Result<Vec<SessionEvent>, SessionError> {
        let idle = now.saturating_duration_since(self.last_activity);
        if idle >= self.session_timeout {
            return Err(SessionError::TimedOut(idle));
        }

        if self.is_connected()
            && idle >= self.keepalive_interval
            && now.saturating_duration_since(self.last_ping_sent) >= self.keepalive_interval
        {
            let timestamp = self.timestamp(now);
            self.send_connected_message(Reliability::Unreliable, ConnectedMessage::ConnectedPing(ConnectedPingData { timestamp }));
            self.last_ping_sent = now;
        }

        let events = self.send_window.check_timeouts(now).into_iter()
            .map(SessionEvent::from)
            .collect();

        for ack in self.receive_window.take_acks(self.max_ack_ranges) {
            self.socket.do_send_packet(self.address, &ack.to_bytes());
        }
        for nack in self.receive_window.take_nacks(self.max_ack_ranges) {
            self.socket.do_send_packet(self.address, &nack.to_bytes());
        }
        self.flush(now);

        if now.saturating_duration_since(self.packet_counter_reset_at) >= PACKET_COUNTER_PERIOD {
            self.packets_this_second = 0;
            self.packet_counter_reset_at = now;
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::message_id::{ID_ACK, ID_NACK};
    use crate::test_util::{test_addr, test_config, RecordingSocket};
    use super::*;

    const CLIENT_GUID: u64 = 0x1111;
    const SERVER_GUID: u64 = 0x2222;

    struct Pair {
        client: Session,
        client_socket: Arc<RecordingSocket>,
        server: Session,
        server_socket: Arc<RecordingSocket>,
    }

    impl Pair {
        fn new(now: Instant) -> Pair {
            Pair::with_config(&test_config(), now)
        }

        fn with_config(config: &RakNetConfig, now: Instant) -> Pair {
            let client_socket = Arc::new(RecordingSocket::default());
            let server_socket = Arc::new(RecordingSocket::default());
            Pair {
                client: Session::new(SessionRole::Client, test_addr(1), SERVER_GUID, 1200, client_socket.clone(), config, now, now),
                client_socket,
                server: Session::new(SessionRole::Server, test_addr(2), CLIENT_GUID, 1200, server_socket.clone(), config, now, now),
                server_socket,
            }
        }

        fn to_server(&mut self, now: Instant) -> Vec<SessionEvent> {
            let mut events = Vec::new();
            for (to, datagram) in self.client_socket.take() {
                assert_eq!(to, test_addr(1));
                events.extend(self.server.handle_datagram(&datagram, now).unwrap());
            }
            events
        }

        fn to_client(&mut self, now: Instant) -> Vec<SessionEvent> {
            let mut events = Vec::new();
            for (to, datagram) in self.server_socket.take() {
                assert_eq!(to, test_addr(2));
                events.extend(self.client.handle_datagram(&datagram, now).unwrap());
            }
            events
        }

        fn connect(&mut self, now: Instant) {
            self.client.request_connection(CLIENT_GUID, now);
            assert!(self.to_server(now).is_empty());
            assert_eq!(self.to_client(now), vec![SessionEvent::Connected]);
            assert_eq!(self.to_server(now), vec![SessionEvent::Connected]);
        }
    }

    fn message(payload: &'static [u8]) -> SessionEvent {
        SessionEvent::Message(ReceivedMessage {
            reliability: Reliability::ReliableOrdered,
            channel: 0,
            payload: Bytes::from_static(payload),
        })
    }

    #[test]
    fn test_connected_login() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        assert_eq!(pair.client.state(), SessionState::Handshaking);
        assert_eq!(pair.server.state(), SessionState::Handshaking);

        pair.client.request_connection(CLIENT_GUID, now);
        assert!(pair.to_server(now).is_empty());
        assert_eq!(pair.server.state(), SessionState::Handshaking);

        assert_eq!(pair.to_client(now), vec![SessionEvent::Connected]);
        assert_eq!(pair.client.state(), SessionState::Connected);

        assert_eq!(pair.to_server(now), vec![SessionEvent::Connected]);
        assert_eq!(pair.server.state(), SessionState::Connected);
    }

    #[test]
    fn test_connection_request_with_wrong_guid() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.client.request_connection(CLIENT_GUID + 1, now);
        pair.to_server(now);
        assert!(pair.server_socket.take().is_empty());
    }

    #[test]
    fn test_messages_before_connected_are_dropped() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.client.send_message(Reliability::ReliableOrdered, 0, Bytes::from_static(b"\xfeearly")).unwrap();
        pair.client.flush(now);
        assert!(pair.to_server(now).is_empty());
    }

    #[test]
    fn test_messages() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.connect(now);

        for payload in [b"\xfeA", b"\xfeB", b"\xfeC"] {
            pair.client.send_message(Reliability::ReliableOrdered, 0, Bytes::from_static(payload)).unwrap();
        }
        pair.client.flush(now);
        assert_eq!(pair.to_server(now), vec![message(b"\xfeA"), message(b"\xfeB"), message(b"\xfeC")]);
    }

    #[test]
    fn test_reordered_datagrams() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.connect(now);

        for payload in [b"\xfeA", b"\xfeB", b"\xfeC"] {
            pair.client.send_message(Reliability::ReliableOrdered, 0, Bytes::from_static(payload)).unwrap();
            pair.client.flush(now);
        }
        let mut datagrams = pair.client_socket.take();
        assert_eq!(datagrams.len(), 3);
        datagrams.rotate_right(1);

        let mut events = Vec::new();
        for (_, datagram) in datagrams {
            events.extend(pair.server.handle_datagram(&datagram, now).unwrap());
        }
        assert_eq!(events, vec![message(b"\xfeA"), message(b"\xfeB"), message(b"\xfeC")]);
    }

    #[test]
    fn test_large_message() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.connect(now);

        let payload = (0..3000).map(|i| (i % 251) as u8 | 0x80).collect::<Vec<u8>>();
        pair.client.send_message(Reliability::ReliableOrdered, 0, Bytes::from(payload.clone())).unwrap();
        pair.client.flush(now);

        let mut datagrams = pair.client_socket.take();
        assert_eq!(datagrams.len(), 3);
        datagrams.reverse();
        let mut events = Vec::new();
        for (_, datagram) in datagrams {
            events.extend(pair.server.handle_datagram(&datagram, now).unwrap());
        }
        assert_eq!(events, vec![SessionEvent::Message(ReceivedMessage {
            reliability: Reliability::ReliableOrdered,
            channel: 0,
            payload: Bytes::from(payload),
        })]);
    }

    #[test]
    fn test_acknowledgment_and_receipt() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.connect(now);
        pair.client.update(now).unwrap();
        pair.server.update(now).unwrap();
        pair.to_client(now);
        pair.to_server(now);
        assert_eq!(pair.client.num_unacknowledged(), 0);

        let receipt = pair.client.send_message(Reliability::ReliableWithAckReceipt, 0, Bytes::from_static(b"\xfex")).unwrap();
        pair.client.flush(now);
        pair.to_server(now);
        pair.server.update(now).unwrap();
        assert_eq!(pair.server_socket.sent_ids(), vec![ID_ACK]);

        assert_eq!(pair.to_client(now), vec![SessionEvent::Acknowledged(receipt.unwrap())]);
        assert_eq!(pair.client.num_unacknowledged(), 0);
    }

    #[test]
    fn test_lost_datagram_is_nacked_and_resent() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.connect(now);
        pair.server.update(now).unwrap();
        pair.to_client(now);

        for payload in [b"\xfeA", b"\xfeB"] {
            pair.client.send_message(Reliability::ReliableOrdered, 0, Bytes::from_static(payload)).unwrap();
            pair.client.flush(now);
        }
        let datagrams = pair.client_socket.take();
        assert!(pair.server.handle_datagram(&datagrams[1].1, now).unwrap().is_empty());

        pair.server.update(now).unwrap();
        assert_eq!(pair.server_socket.sent_ids(), vec![ID_ACK, ID_NACK]);

        assert!(pair.to_client(now).is_empty());
        assert_eq!(pair.to_server(now), vec![message(b"\xfeA"), message(b"\xfeB")]);
    }

    #[test]
    fn test_frames_beyond_receive_window_are_sent_again() {
        let now = Instant::now();
        let mut config = test_config();
        config.max_receive_window = 4;
        let mut pair = Pair::with_config(&config, now);
        pair.connect(now);
        pair.server.update(now).unwrap();
        pair.to_client(now);

        let payloads: [&'static [u8]; 6] = [b"\xfeA", b"\xfeB", b"\xfeC", b"\xfeD", b"\xfeE", b"\xfeF"];
        for payload in payloads {
            pair.client.send_message(Reliability::ReliableOrdered, 0, Bytes::from_static(payload)).unwrap();
            pair.client.flush(now);
        }
        let datagrams = pair.client_socket.take();
        assert_eq!(datagrams.len(), 6);

        let mut events = Vec::new();
        for (_, datagram) in &datagrams[1..] {
            events.extend(pair.server.handle_datagram(datagram, now).unwrap());
        }
        assert!(events.is_empty());

        for _ in 0..3 {
            pair.server.update(now).unwrap();
            pair.to_client(now);
            events.extend(pair.to_server(now));
        }
        assert_eq!(events, payloads.map(message).to_vec());
        assert_eq!(pair.client.num_unacknowledged(), 0);
    }

    #[test]
    fn test_keepalive_and_latency() {
        let t0 = Instant::now();
        let mut pair = Pair::new(t0);
        pair.connect(t0);

        let t1 = t0 + Duration::from_secs(2);
        pair.client.update(t1).unwrap();
        let ping_sent = pair.client_socket.sent_ids();
        assert!(ping_sent.contains(&0x84));

        let t2 = t1 + Duration::from_millis(40);
        pair.to_server(t2);
        pair.server.update(t2).unwrap();
        pair.to_client(t2);
        assert_eq!(pair.client.latency(), Some(Duration::from_millis(40)));

        // no second ping right after the first one
        pair.client.update(t2).unwrap();
        pair.client_socket.take();
        let t3 = t2 + Duration::from_millis(100);
        pair.client.update(t3).unwrap();
        assert!(pair.client_socket.take().is_empty());
    }

    #[rstest]
    #[case::just_before(Duration::from_millis(9999), true)]
    #[case::at_timeout(Duration::from_secs(10), false)]
    fn test_timeout(#[case] idle: Duration, #[case] alive: bool) {
        let t0 = Instant::now();
        let mut pair = Pair::new(t0);
        assert_eq!(pair.server.update(t0 + idle).is_ok(), alive);
        if !alive {
            assert_eq!(pair.server.update(t0 + idle), Err(SessionError::TimedOut(idle)));
        }
    }

    #[test]
    fn test_packet_counter() {
        let t0 = Instant::now();
        let mut pair = Pair::new(t0);
        pair.connect(t0);
        pair.server.update(t0).unwrap();
        assert_eq!(pair.server.packets_this_second(), 2);

        pair.client.send_message(Reliability::Unreliable, 0, Bytes::from_static(b"\xfe")).unwrap();
        pair.client.flush(t0);
        pair.to_server(t0 + Duration::from_millis(500));
        pair.server.update(t0 + Duration::from_millis(500)).unwrap();
        assert_eq!(pair.server.packets_this_second(), 3);

        pair.server.update(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(pair.server.packets_this_second(), 0);
    }

    #[test]
    fn test_disconnect() {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        pair.connect(now);

        pair.client.close(now);
        assert_eq!(pair.client.state(), SessionState::Disconnected);
        assert_eq!(pair.to_server(now), vec![SessionEvent::Disconnected]);
        assert_eq!(pair.server.state(), SessionState::Disconnecting);
        assert!(pair.server.was_connected());

        pair.client.close(now);
        assert!(pair.client_socket.take().is_empty());
    }

    #[rstest]
    #[case::empty(vec![], DecodeError::Truncated { needed: 1, remaining: 0 })]
    #[case::offline(vec![0x05], DecodeError::UnexpectedMessageId { expected: 0x84, actual: 0x05 })]
    #[case::truncated_ack(vec![0xc0, 0], DecodeError::Truncated { needed: 2, remaining: 1 })]
    fn test_invalid_datagram(#[case] datagram: Vec<u8>, #[case] expected: DecodeError) {
        let now = Instant::now();
        let mut pair = Pair::new(now);
        assert_eq!(pair.server.handle_datagram(&datagram, now), Err(expected));
    }
}
