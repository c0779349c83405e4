use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::config::RakNetConfig;
use crate::error::DecodeError;
use crate::handshake::HandshakeResponder;
use crate::listener::ServerListener;
use crate::message_id::DatagramKind;
use crate::offline_messages::{OfflineMessage, UnconnectedPingData, UnconnectedPongData};
use crate::reliability::Reliability;
use crate::send_socket::SendSocket;
use crate::session_registry::SessionRegistry;

/// big enough for any UDP payload
pub(crate) const RECEIVE_BUFFER_LEN: usize = 65536;

/// The server peer: it listens on a UDP socket, answers pings, accepts connections through the
///  open connection handshake and drives all sessions with a periodic tick.
///
/// All session state lives in a [SessionRegistry] behind a single mutex that is shared by the
///  receive task and the tick task.
pub struct RakNetServer {
    guid: u64,
    config: Arc<RakNetConfig>,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    listener: Arc<dyn ServerListener>,
    responder: HandshakeResponder,
    registry: Mutex<SessionRegistry>,
    running: AtomicBool,
    tasks: Mutex<Option<ServerTasks>>,
}

struct ServerTasks {
    recv: JoinHandle<()>,
    tick: JoinHandle<()>,
}

impl RakNetServer {
    pub async fn bind(config: RakNetConfig, listener: Arc<dyn ServerListener>) -> anyhow::Result<Arc<RakNetServer>> {
        config.validate()?;
        let config = Arc::new(config);

        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let local_addr = socket.local_addr()?;
        info!("bound server socket to {:?}", local_addr);

        let guid = rand::random::<u64>();
        let registry = SessionRegistry::new(socket.clone(), listener.clone(), config.clone(), Instant::now());

        Ok(Arc::new(RakNetServer {
            guid,
            responder: HandshakeResponder::new(guid, &config),
            config,
            socket,
            local_addr,
            listener,
            registry: Mutex::new(registry),
            running: AtomicBool::new(false),
            tasks: Mutex::new(None),
        }))
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawns the receive loop and the tick loop
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() || self.running.swap(true, Ordering::AcqRel) {
            bail!("server on {:?} was already started", self.local_addr);
        }

        let span = span!(Level::INFO, "raknet_server", local_addr = ?self.local_addr);
        let recv = tokio::spawn(self.clone().recv_loop().instrument(span.clone()));
        let tick = tokio::spawn(self.clone().tick_loop().instrument(span));
        *tasks = Some(ServerTasks { recv, tick });

        info!("server {} started on {:?}", self.guid, self.local_addr);
        self.listener.on_server_start(self.local_addr);
        Ok(())
    }

    /// Stops the tick loop after it disconnected all sessions, and stops the receive loop. This is
    ///  a no-op if the server is not running.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(tasks) = self.tasks.lock().await.take() {
            if let Err(e) = tasks.tick.await {
                error!("tick task failed: {}", e);
            }
            tasks.recv.abort();
        }

        info!("server on {:?} shut down", self.local_addr);
        self.listener.on_server_shutdown();
    }

    async fn recv_loop(self: Arc<Self>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; RECEIVE_BUFFER_LEN];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    // e.g. ICMP port unreachable from a vanished peer
                    debug!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
            self.handle_datagram(from, &buf[..num_read])
                .instrument(span)
                .await;
        }
    }

    async fn tick_loop(self: Arc<Self>) {
        let mut interval = time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if !self.running.load(Ordering::Acquire) {
                self.registry.lock().await.shutdown(Instant::now());
                break;
            }
            self.tick().await;
        }
        debug!("tick loop terminated");
    }

    /// Periodic maintenance of bans and sessions, called by the tick loop
    pub async fn tick(&self) {
        self.registry.lock().await.tick(Instant::now());
    }

    /// Dispatches an inbound datagram by its first byte. Datagrams that can not be handled are
    ///  dropped and reported to the listener.
    pub async fn handle_datagram(&self, sender: SocketAddr, datagram: &[u8]) {
        trace!("received {} bytes from {:?}", datagram.len(), sender);

        let Some(&first) = datagram.first() else {
            debug!("empty datagram from {:?} - dropping", sender);
            return;
        };

        let now = Instant::now();
        let result = match DatagramKind::classify(first) {
            DatagramKind::Custom | DatagramKind::Ack | DatagramKind::Nack => {
                self.registry.lock().await
                    .handle_datagram(sender, datagram, now)
                    .map_err(anyhow::Error::from)
            }
            DatagramKind::Offline(_) => self.handle_offline_message(sender, datagram, now).await,
            DatagramKind::Unknown(id) => Err(DecodeError::UnknownMessageId(id).into()),
        };

        if let Err(e) = result {
            debug!("dropping datagram from {:?}: {}", sender, e);
            self.listener.on_handler_exception(sender, &e);
        }
    }

    async fn handle_offline_message(&self, sender: SocketAddr, datagram: &[u8], now: Instant) -> anyhow::Result<()> {
        let reply = match OfflineMessage::deser(datagram)? {
            OfflineMessage::UnconnectedPing(data) => self.on_unconnected_ping(sender, &data, false, now).await,
            OfflineMessage::UnconnectedPingOpenConnections(data) => self.on_unconnected_ping(sender, &data, true, now).await,
            OfflineMessage::OpenConnectionRequest1(data) => {
                let mut registry = self.registry.lock().await;
                self.responder.on_open_connection_request_1(&mut registry, sender, &data, now)
            }
            OfflineMessage::OpenConnectionRequest2(data) => {
                let mut registry = self.registry.lock().await;
                self.responder.on_open_connection_request_2(&mut registry, sender, &data, now)
            }
            other => {
                debug!("ignoring {:?} from {:?}", other.id(), sender);
                None
            }
        };

        if let Some(reply) = reply {
            trace!("replying {:?} to {:?}", reply.id(), sender);
            self.socket.do_send_packet(sender, &reply.to_bytes());
        }
        Ok(())
    }

    async fn on_unconnected_ping(&self, sender: SocketAddr, data: &UnconnectedPingData, open_connections_only: bool, now: Instant) -> Option<OfflineMessage> {
        if !self.config.broadcasting_enabled {
            return None;
        }
        {
            let registry = self.registry.lock().await;
            if registry.is_blocked(sender.ip(), now) {
                return None;
            }
            if open_connections_only && registry.len() >= self.config.max_connections {
                return None;
            }
        }

        let identifier = self.listener.on_ping(sender, &self.config.identifier)?;
        Some(OfflineMessage::UnconnectedPong(UnconnectedPongData {
            ping_timestamp: data.timestamp,
            server_guid: self.guid,
            identifier,
        }))
    }

    pub async fn session_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Whether there is a connected session with the address
    pub async fn is_connected(&self, address: SocketAddr) -> bool {
        self.registry.lock().await
            .get(&address)
            .map_or(false, |s| s.is_connected())
    }

    pub async fn send_message(&self, address: SocketAddr, reliability: Reliability, channel: u8, payload: Bytes) -> anyhow::Result<Option<u32>> {
        self.registry.lock().await.send_message(address, reliability, channel, payload)
    }

    /// Returns `false` if there was no session with the address
    pub async fn disconnect(&self, address: SocketAddr, reason: &str) -> bool {
        self.registry.lock().await.remove_session(address, reason, Instant::now())
    }

    pub async fn block_address(&self, address: IpAddr, reason: &str, duration: Duration) {
        self.registry.lock().await.block_address(address, reason, duration, Instant::now());
    }

    pub async fn unblock_address(&self, address: IpAddr) -> bool {
        self.registry.lock().await.unblock_address(address)
    }

    pub async fn is_blocked(&self, address: IpAddr) -> bool {
        self.registry.lock().await.is_blocked(address, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;

    use crate::config::DEFAULT_PROTOCOL_VERSION;
    use crate::listener::{MockServerListener, NoopListener};
    use crate::message_id::{MessageId, ID_CUSTOM_4};
    use crate::offline_messages::{OpenConnectionRequest1Data, OpenConnectionRequest2Data};
    use crate::test_util::{loopback_config, ListenerEvent, RecordingListener};
    use super::*;

    const CLIENT_GUID: u64 = 0xabcd;

    struct Peer {
        socket: UdpSocket,
        server_addr: SocketAddr,
    }

    impl Peer {
        async fn new(server: &RakNetServer) -> Peer {
            Peer {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
                server_addr: server.local_addr(),
            }
        }

        fn addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        async fn send(&self, message: OfflineMessage) {
            self.send_raw(&message.to_bytes()).await;
        }

        async fn send_raw(&self, buf: &[u8]) {
            self.socket.send_to(buf, self.server_addr).await.unwrap();
        }

        async fn recv_raw(&self) -> Option<Vec<u8>> {
            let mut buf = vec![0u8; RECEIVE_BUFFER_LEN];
            match time::timeout(Duration::from_millis(300), self.socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
                _ => None,
            }
        }

        async fn recv(&self) -> Option<OfflineMessage> {
            self.recv_raw().await
                .map(|buf| OfflineMessage::deser(&buf).unwrap())
        }

        async fn ping(&self, open_connections_only: bool) -> Option<OfflineMessage> {
            let data = UnconnectedPingData { timestamp: 12345, client_guid: Some(CLIENT_GUID) };
            self.send(if open_connections_only {
                OfflineMessage::UnconnectedPingOpenConnections(data)
            }
            else {
                OfflineMessage::UnconnectedPing(data)
            }).await;
            self.recv().await
        }

        async fn open_connection(&self) {
            self.send(OfflineMessage::OpenConnectionRequest1(OpenConnectionRequest1Data {
                protocol_version: DEFAULT_PROTOCOL_VERSION,
                mtu: 1400,
            })).await;
            let Some(OfflineMessage::OpenConnectionReply1(_)) = self.recv().await else {
                panic!("expected open connection reply 1");
            };

            self.send(OfflineMessage::OpenConnectionRequest2(OpenConnectionRequest2Data {
                server_address: self.server_addr,
                mtu: 1400,
                client_guid: CLIENT_GUID,
            })).await;
            let Some(OfflineMessage::OpenConnectionReply2(reply)) = self.recv().await else {
                panic!("expected open connection reply 2");
            };
            assert_eq!(reply.mtu, 1400);
            assert_eq!(reply.client_address, self.addr());
        }
    }

    async fn started_server(config: RakNetConfig, listener: Arc<RecordingListener>) -> Arc<RakNetServer> {
        let server = RakNetServer::bind(config, listener).await.unwrap();
        server.start().await.unwrap();
        server
    }

    #[tokio::test]
    async fn test_bind_validates_config() {
        let mut config = loopback_config();
        config.max_mtu = 100;
        assert!(RakNetServer::bind(config, Arc::new(RecordingListener::default())).await.is_err());
    }

    #[tokio::test]
    async fn test_start_twice() {
        let server = started_server(loopback_config(), Default::default()).await;
        assert!(server.is_running());
        assert!(server.start().await.is_err());
        server.shutdown().await;
        assert!(!server.is_running());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_unconnected_ping() {
        let mut config = loopback_config();
        config.identifier = "MCPE;test server".to_string();
        let server = started_server(config, Default::default()).await;
        let peer = Peer::new(&server).await;

        assert_eq!(peer.ping(false).await, Some(OfflineMessage::UnconnectedPong(UnconnectedPongData {
            ping_timestamp: 12345,
            server_guid: server.guid(),
            identifier: "MCPE;test server".to_string(),
        })));
        server.shutdown().await;
    }

    #[rstest]
    #[case::plain(false, 0, true)]
    #[case::open_connections_with_capacity(true, 0, true)]
    #[case::open_connections_when_full(true, 1, false)]
    #[case::plain_when_full(false, 1, true)]
    #[tokio::test]
    async fn test_ping_open_connections(#[case] open_connections_only: bool, #[case] num_sessions: usize, #[case] answered: bool) {
        let mut config = loopback_config();
        config.max_connections = 1;
        let server = started_server(config, Default::default()).await;

        for _ in 0..num_sessions {
            Peer::new(&server).await.open_connection().await;
        }
        let peer = Peer::new(&server).await;
        assert_eq!(peer.ping(open_connections_only).await.is_some(), answered);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_ping_with_broadcasting_disabled() {
        let mut config = loopback_config();
        config.broadcasting_enabled = false;
        let server = started_server(config, Default::default()).await;
        assert!(Peer::new(&server).await.ping(false).await.is_none());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_ping_suppressed_by_listener() {
        let mut listener = MockServerListener::new();
        listener.expect_on_server_start().return_const(());
        listener.expect_on_server_shutdown().return_const(());
        listener.expect_on_ping()
            .times(1)
            .returning(|_, _| None);

        let server = RakNetServer::bind(loopback_config(), Arc::new(listener)).await.unwrap();
        server.start().await.unwrap();
        assert!(Peer::new(&server).await.ping(false).await.is_none());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_ping_from_blocked_address() {
        let server = started_server(loopback_config(), Default::default()).await;
        let peer = Peer::new(&server).await;
        server.block_address(peer.addr().ip(), "test", Duration::from_secs(60)).await;
        assert!(server.is_blocked(peer.addr().ip()).await);
        assert!(peer.ping(false).await.is_none());

        assert!(server.unblock_address(peer.addr().ip()).await);
        assert!(peer.ping(false).await.is_some());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_connection_and_shutdown() {
        let listener = Arc::new(RecordingListener::default());
        let server = started_server(loopback_config(), listener.clone()).await;
        let peer = Peer::new(&server).await;

        peer.open_connection().await;
        assert_eq!(server.session_count().await, 1);
        assert!(!server.is_connected(peer.addr()).await);
        assert_eq!(listener.take(), vec![ListenerEvent::PreConnect(peer.addr(), CLIENT_GUID)]);

        server.shutdown().await;
        assert_eq!(server.session_count().await, 0);
        assert_eq!(listener.take(), vec![ListenerEvent::PreDisconnect(peer.addr(), "Server shutdown".to_string())]);

        let notification = peer.recv_raw().await.unwrap();
        assert_eq!(notification[0], ID_CUSTOM_4);
    }

    #[tokio::test]
    async fn test_incompatible_protocol_version() {
        let server = started_server(loopback_config(), Default::default()).await;
        let peer = Peer::new(&server).await;

        peer.send(OfflineMessage::OpenConnectionRequest1(OpenConnectionRequest1Data {
            protocol_version: DEFAULT_PROTOCOL_VERSION + 1,
            mtu: 1200,
        })).await;
        let Some(OfflineMessage::IncompatibleProtocolVersion(data)) = peer.recv().await else {
            panic!("expected incompatible protocol version");
        };
        assert_eq!(data.protocol_version, DEFAULT_PROTOCOL_VERSION);
        assert_eq!(data.server_guid, server.guid());
        server.shutdown().await;
    }

    #[rstest]
    #[case::unknown_id(vec![0x42])]
    #[case::truncated_ping(vec![MessageId::UnconnectedPing.into(), 1, 2])]
    #[case::custom_packet_without_session(vec![0x84, 0, 0, 0])]
    #[tokio::test]
    async fn test_bad_datagrams(#[case] datagram: Vec<u8>) {
        let listener = Arc::new(RecordingListener::default());
        let server = started_server(loopback_config(), listener.clone()).await;
        let peer = Peer::new(&server).await;

        peer.send_raw(&datagram).await;
        assert!(peer.recv_raw().await.is_none());

        let events = listener.take();
        assert!(events.is_empty() || events == vec![ListenerEvent::HandlerException(peer.addr())]);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_datagram_reports_decode_errors() {
        let listener = Arc::new(RecordingListener::default());
        let server = RakNetServer::bind(loopback_config(), listener.clone()).await.unwrap();
        let sender = SocketAddr::from(([127, 0, 0, 1], 4711));

        let mut buf = BytesMut::new();
        OfflineMessage::OpenConnectionRequest2(OpenConnectionRequest2Data {
            server_address: server.local_addr(),
            mtu: 1200,
            client_guid: 1,
        }).ser(&mut buf);
        buf[3] ^= 0xff;
        server.handle_datagram(sender, &buf).await;
        assert_eq!(listener.take(), vec![ListenerEvent::HandlerException(sender)]);

        server.handle_datagram(sender, &[0x42]).await;
        assert_eq!(listener.take(), vec![ListenerEvent::HandlerException(sender)]);

        server.handle_datagram(sender, &[]).await;
        assert!(listener.take().is_empty());
    }

    #[tokio::test]
    async fn test_send_message_to_unknown_peer() {
        let server = RakNetServer::bind(loopback_config(), Arc::new(NoopListener)).await.unwrap();
        let unknown = SocketAddr::from(([127, 0, 0, 1], 4711));
        assert!(server.send_message(unknown, Reliability::Reliable, 0, Bytes::from_static(b"\xfe")).await.is_err());
        assert!(!server.disconnect(unknown, "test").await);
    }
}
