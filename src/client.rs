use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::RakNetConfig;
use crate::error::{DecodeError, SessionError};
use crate::handshake::SessionPreparation;
use crate::listener::ClientListener;
use crate::message_id::DatagramKind;
use crate::offline_messages::{OfflineMessage, UnconnectedPingData, UnconnectedPongData};
use crate::reliability::Reliability;
use crate::send_socket::SendSocket;
use crate::server::RECEIVE_BUFFER_LEN;
use crate::session::{Session, SessionEvent};
use crate::session_registry::panic_message;

const OFFLINE_QUEUE_LEN: usize = 64;

const REASON_CLIENT_DISCONNECTED: &str = "Client disconnected";
const REASON_SERVER_DISCONNECTED: &str = "Server disconnected";
const REASON_CONNECT_TIMEOUT: &str = "Timed out during login";

/// The client peer: a single session with a server.
///
/// A background task receives datagrams and ticks the session. Offline datagrams (handshake replies
///  and pongs) are handed over to whichever of [RakNetClient::connect] or [RakNetClient::ping] is
///  waiting for them.
///
/// The background task keeps the client alive until [RakNetClient::shutdown] is called.
pub struct RakNetClient {
    guid: u64,
    config: Arc<RakNetConfig>,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    listener: Arc<dyn ClientListener>,
    epoch: Instant,

    session: Mutex<Option<Session>>,
    state_changed: Notify,

    offline_sender: mpsc::Sender<(SocketAddr, Bytes)>,
    offline_receiver: Mutex<mpsc::Receiver<(SocketAddr, Bytes)>>,

    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RakNetClient {
    pub async fn bind(config: RakNetConfig, listener: Arc<dyn ClientListener>) -> anyhow::Result<Arc<RakNetClient>> {
        config.validate()?;
        if config.effective_mtu_candidates().is_empty() {
            bail!("none of the MTU candidates {:?} is in the supported range", config.client_mtu_candidates);
        }

        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let local_addr = socket.local_addr()?;
        info!("bound client socket to {:?}", local_addr);

        let (offline_sender, offline_receiver) = mpsc::channel(OFFLINE_QUEUE_LEN);
        let client = Arc::new(RakNetClient {
            guid: rand::random::<u64>(),
            config: Arc::new(config),
            socket,
            local_addr,
            listener,
            epoch: Instant::now(),
            session: Mutex::new(None),
            state_changed: Notify::new(),
            offline_sender,
            offline_receiver: Mutex::new(offline_receiver),
            running: AtomicBool::new(true),
            task: Mutex::new(None),
        });

        let span = span!(Level::INFO, "raknet_client", ?local_addr);
        let task = tokio::spawn(client.clone().run().instrument(span));
        *client.task.lock().await = Some(task);

        Ok(client)
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn is_connected(&self) -> bool {
        self.session.lock().await
            .as_ref()
            .map_or(false, Session::is_connected)
    }

    pub async fn server_address(&self) -> Option<SocketAddr> {
        self.session.lock().await
            .as_ref()
            .map(Session::address)
    }

    /// The MTU negotiated with the server
    pub async fn mtu(&self) -> Option<u16> {
        self.session.lock().await
            .as_ref()
            .map(Session::mtu)
    }

    pub async fn latency(&self) -> Option<Duration> {
        self.session.lock().await
            .as_ref()
            .and_then(Session::latency)
    }

    fn timestamp(&self) -> u64 {
        Instant::now().saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Connects to a server: MTU discovery and the open connection handshake, followed by the
    ///  connected login. A handshake rejected by the server fails with the [crate::error::HandshakeError]
    ///  that cancelled it.
    pub async fn connect(&self, server: SocketAddr) -> anyhow::Result<()> {
        if self.session.lock().await.is_some() {
            bail!("client {:?} already has a session", self.local_addr);
        }

        let mut offline = self.offline_receiver.lock().await;
        while offline.try_recv().is_ok() {}

        info!("connecting to {:?}", server);
        let mut preparation = SessionPreparation::new(self.guid, self.config.max_mtu, self.config.protocol_version);

        'candidates:
        for mtu in self.config.effective_mtu_candidates() {
            for attempt in 0..self.config.login_attempts_per_mtu {
                trace!("open connection request 1 to {:?} with MTU {}, attempt {}", server, mtu, attempt);
                self.socket.do_send_packet(server, &preparation.request_1(mtu).to_bytes());
                self.await_handshake_reply(&mut offline, server, &mut preparation, SessionPreparation::is_phase_1_done).await;
                if preparation.is_phase_1_done() || preparation.is_cancelled() {
                    break 'candidates;
                }
            }
            debug!("no reply from {:?} for MTU {}", server, mtu);
        }
        Self::check_cancelled(&preparation)?;
        if !preparation.is_phase_1_done() {
            bail!("no reply from {:?} to open connection requests", server);
        }

        for attempt in 0..self.config.login_attempts_per_mtu {
            let request = preparation.request_2()
                .ok_or_else(|| anyhow!("handshake phase 1 is incomplete"))?;
            trace!("open connection request 2 to {:?}, attempt {}", server, attempt);
            self.socket.do_send_packet(server, &request.to_bytes());
            self.await_handshake_reply(&mut offline, server, &mut preparation, SessionPreparation::is_phase_2_done).await;
            if preparation.is_phase_2_done() || preparation.is_cancelled() {
                break;
            }
        }
        drop(offline);
        Self::check_cancelled(&preparation)?;

        let now = Instant::now();
        let mut session = preparation.into_session(self.socket.clone(), &self.config, self.epoch, now)
            .ok_or_else(|| anyhow!("no reply from {:?} to open connection request 2", server))?;
        debug!("open connection handshake with {:?} complete, MTU {}", server, session.mtu());

        session.request_connection(self.guid, now);
        *self.session.lock().await = Some(session);

        self.await_connected(server).await
    }

    fn check_cancelled(preparation: &SessionPreparation) -> anyhow::Result<()> {
        match preparation.cancel_reason() {
            Some(reason) => Err(reason.clone().into()),
            None => Ok(()),
        }
    }

    /// Feeds offline datagrams from the server into the preparation until `done`, a cancellation,
    ///  or the retry interval elapses
    async fn await_handshake_reply(
        &self,
        offline: &mut mpsc::Receiver<(SocketAddr, Bytes)>,
        server: SocketAddr,
        preparation: &mut SessionPreparation,
        done: fn(&SessionPreparation) -> bool,
    ) {
        let deadline = Instant::now() + self.config.login_retry_interval;
        while !done(preparation) && !preparation.is_cancelled() {
            match time::timeout_at(deadline, offline.recv()).await {
                Ok(Some((sender, datagram))) => {
                    if sender == server {
                        preparation.handle_datagram(sender, &datagram);
                    }
                    else {
                        debug!("ignoring offline datagram from {:?} while connecting to {:?}", sender, server);
                    }
                }
                Ok(None) | Err(_) => return,
            }
        }
    }

    async fn await_connected(&self, server: SocketAddr) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.config.connect_timeout;
        loop {
            match self.session.lock().await.as_ref() {
                Some(session) if session.is_connected() => {
                    info!("connected to {:?}", server);
                    return Ok(());
                }
                Some(_) => {}
                None => bail!("connection to {:?} was closed during login", server),
            }

            if time::timeout_at(deadline, self.state_changed.notified()).await.is_err() {
                self.close_session(&mut *self.session.lock().await, REASON_CONNECT_TIMEOUT, Instant::now());
                bail!("timed out waiting for {:?} to accept the connection", server);
            }
        }
    }

    /// Sends an unconnected ping and waits for the pong
    pub async fn ping(&self, server: SocketAddr) -> anyhow::Result<UnconnectedPongData> {
        let mut offline = self.offline_receiver.lock().await;
        while offline.try_recv().is_ok() {}

        let timestamp = self.timestamp();
        let ping = OfflineMessage::UnconnectedPing(UnconnectedPingData { timestamp, client_guid: Some(self.guid) });

        for _ in 0..self.config.login_attempts_per_mtu {
            self.socket.do_send_packet(server, &ping.to_bytes());

            let deadline = Instant::now() + self.config.login_retry_interval;
            while let Ok(Some((sender, datagram))) = time::timeout_at(deadline, offline.recv()).await {
                if sender != server {
                    continue;
                }
                match OfflineMessage::deser(&datagram) {
                    Ok(OfflineMessage::UnconnectedPong(pong)) if pong.ping_timestamp == timestamp => return Ok(pong),
                    Ok(other) => trace!("ignoring {:?} while waiting for a pong", other.id()),
                    Err(e) => debug!("undecodable datagram from {:?}: {}", sender, e),
                }
            }
        }
        bail!("no pong from {:?}", server)
    }

    pub async fn send_message(&self, reliability: Reliability, channel: u8, payload: Bytes) -> anyhow::Result<Option<u32>> {
        let mut session = self.session.lock().await;
        let session = session.as_mut()
            .ok_or_else(|| anyhow!("client {:?} is not connected", self.local_addr))?;
        Ok(session.send_message(reliability, channel, payload)?)
    }

    /// Sends a disconnection notification to the server and drops the session. Returns `false` if
    ///  there was no session.
    pub async fn disconnect(&self) -> bool {
        let mut session = self.session.lock().await;
        let had_session = session.is_some();
        self.close_session(&mut session, REASON_CLIENT_DISCONNECTED, Instant::now());
        had_session
    }

    /// Disconnects and stops the background task
    pub async fn shutdown(&self) {
        self.disconnect().await;
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("client task failed: {}", e);
            }
        }
        info!("client {:?} shut down", self.local_addr);
    }

    async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; RECEIVE_BUFFER_LEN];
        let mut interval = time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((num_read, from)) => {
                            let correlation_id = Uuid::new_v4();
                            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
                            self.handle_datagram(from, &buf[..num_read])
                                .instrument(span)
                                .await;
                        }
                        Err(e) => debug!("socket error: {}", e),
                    }
                }
                _ = interval.tick() => {
                    if !self.running.load(Ordering::Acquire) {
                        break;
                    }
                    self.tick().await;
                }
            }
        }
        debug!("client loop terminated");
    }

    async fn handle_datagram(&self, sender: SocketAddr, datagram: &[u8]) {
        let Some(&first) = datagram.first() else {
            return;
        };

        let result = match DatagramKind::classify(first) {
            DatagramKind::Offline(_) => {
                if self.offline_sender.try_send((sender, Bytes::copy_from_slice(datagram))).is_err() {
                    trace!("nobody waiting for offline datagrams - dropping datagram from {:?}", sender);
                }
                Ok(())
            }
            DatagramKind::Custom | DatagramKind::Ack | DatagramKind::Nack => self.handle_session_datagram(sender, datagram).await,
            DatagramKind::Unknown(id) => Err(DecodeError::UnknownMessageId(id)),
        };

        if let Err(e) = result {
            debug!("dropping datagram from {:?}: {}", sender, e);
            self.listener.on_handler_exception(sender, &e.into());
        }
    }

    async fn handle_session_datagram(&self, sender: SocketAddr, datagram: &[u8]) -> Result<(), DecodeError> {
        let now = Instant::now();
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut().filter(|s| s.address() == sender) else {
            trace!("ignoring session datagram from {:?}", sender);
            return Ok(());
        };

        let events = session.handle_datagram(datagram, now)?;
        self.dispatch(&mut slot, events, now);
        Ok(())
    }

    /// Updates the session, closing it if it fails
    pub async fn tick(&self) {
        let now = Instant::now();
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            return;
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| session.update(now)))
            .unwrap_or_else(|panic| Err(SessionError::Panicked(panic_message(panic.as_ref()))));
        match result {
            Ok(events) => self.dispatch(&mut slot, events, now),
            Err(e) => {
                warn!("session failed: {}", e);
                self.listener.on_session_exception(&e);
                self.close_session(&mut slot, &e.to_string(), now);
            }
        }
    }

    fn dispatch(&self, slot: &mut Option<Session>, events: Vec<SessionEvent>, now: Instant) {
        for event in events {
            let Some(session) = slot.as_ref() else {
                return;
            };
            match event {
                SessionEvent::Connected => {
                    self.listener.on_connect(session.address(), session.guid());
                    self.state_changed.notify_one();
                }
                SessionEvent::Message(message) => self.listener.on_message(&message),
                SessionEvent::Acknowledged(receipt) => self.listener.on_acknowledge(receipt),
                SessionEvent::Lost(receipt) => self.listener.on_loss(receipt),
                SessionEvent::Disconnected => self.close_session(slot, REASON_SERVER_DISCONNECTED, now),
            }
        }
    }

    fn close_session(&self, slot: &mut Option<Session>, reason: &str, now: Instant) {
        let Some(mut session) = slot.take() else {
            return;
        };
        info!("closing session with {:?}: {}", session.address(), reason);
        session.close(now);
        if session.was_connected() {
            self.listener.on_disconnect(session.address(), reason);
        }
        self.state_changed.notify_one();
    }
}
