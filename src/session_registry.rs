use std::any::Any;
use std::net::{IpAddr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::RakNetConfig;
use crate::error::{DecodeError, SessionError};
use crate::listener::ServerListener;
use crate::reliability::Reliability;
use crate::send_socket::SendSocket;
use crate::session::{Session, SessionEvent, SessionRole};

const REASON_CLIENT_DISCONNECTED: &str = "Client disconnected";
const REASON_TOO_MANY_PACKETS: &str = "Too many packets";
const REASON_SERVER_SHUTDOWN: &str = "Server shutdown";

/// The server's sessions, keyed by address and indexed by guid, and the list of temporarily banned
///  addresses.
///
/// The registry is not synchronized itself: the server wraps all of it in a single mutex, and all
///  access to sessions goes through the registry.
pub struct SessionRegistry {
    sessions: FxHashMap<SocketAddr, Session>,
    guids: FxHashMap<u64, SocketAddr>,
    /// ban expiry per address
    banned: FxHashMap<IpAddr, Instant>,

    socket: Arc<dyn SendSocket>,
    listener: Arc<dyn ServerListener>,
    config: Arc<RakNetConfig>,
    epoch: Instant,
}

impl SessionRegistry {
    pub fn new(socket: Arc<dyn SendSocket>, listener: Arc<dyn ServerListener>, config: Arc<RakNetConfig>, epoch: Instant) -> SessionRegistry {
        SessionRegistry {
            sessions: FxHashMap::default(),
            guids: FxHashMap::default(),
            banned: FxHashMap::default(),
            socket,
            listener,
            config,
            epoch,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn has_session(&self, address: &SocketAddr) -> bool {
        self.sessions.contains_key(address)
    }
    pub fn has_guid(&self, guid: u64) -> bool {
        self.guids.contains_key(&guid)
    }

    pub fn get(&self, address: &SocketAddr) -> Option<&Session> {
        self.sessions.get(address)
    }
    pub fn get_mut(&mut self, address: &SocketAddr) -> Option<&mut Session> {
        self.sessions.get_mut(address)
    }
    pub fn get_by_guid(&self, guid: u64) -> Option<&Session> {
        self.guids.get(&guid)
            .and_then(|address| self.sessions.get(address))
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Called by the handshake responder once a client passed all checks
    pub(crate) fn create_session(&mut self, address: SocketAddr, guid: u64, mtu: u16, now: Instant) {
        self.listener.on_client_pre_connect(address, guid);

        let session = Session::new(SessionRole::Server, address, guid, mtu, self.socket.clone(), &self.config, self.epoch, now);
        self.guids.insert(guid, address);
        if let Some(mut replaced) = self.sessions.insert(address, session) {
            warn!("replaced existing session with {:?} - this is a bug", address);
            self.guids.remove(&replaced.guid());
            replaced.close(now);
        }
    }

    /// Notifies the listener, sends a disconnection notification to the client and drops the
    ///  session. Returns `false` if there was no session for the address.
    pub fn remove_session(&mut self, address: SocketAddr, reason: &str, now: Instant) -> bool {
        let Some(mut session) = self.sessions.remove(&address) else {
            return false;
        };
        if self.guids.get(&session.guid()) == Some(&address) {
            self.guids.remove(&session.guid());
        }

        info!("removing session with {:?}: {}", address, reason);
        if session.was_connected() {
            self.listener.on_client_disconnect(address, session.guid(), reason);
        }
        else {
            self.listener.on_client_pre_disconnect(address, session.guid(), reason);
        }
        session.close(now);
        true
    }

    /// Bans an IP address for a while, removing all its sessions
    pub fn block_address(&mut self, address: IpAddr, reason: &str, duration: Duration, now: Instant) {
        let evicted = self.sessions.keys()
            .filter(|a| a.ip() == address)
            .cloned()
            .collect::<Vec<_>>();
        for session_address in evicted {
            self.remove_session(session_address, reason, now);
        }

        info!("blocking {} for {:?}: {}", address, duration, reason);
        self.banned.insert(address, now + duration);
        self.listener.on_address_blocked(address, reason, duration);
    }

    pub fn unblock_address(&mut self, address: IpAddr) -> bool {
        if self.banned.remove(&address).is_some() {
            info!("unblocked {}", address);
            self.listener.on_address_unblocked(address);
            true
        }
        else {
            false
        }
    }

    pub fn is_blocked(&self, address: IpAddr, now: Instant) -> bool {
        self.banned.get(&address)
            .map_or(false, |&expiry| expiry > now)
    }

    /// Passes a custom packet, ACK or NACK to the sender's session, if there is one
    pub fn handle_datagram(&mut self, sender: SocketAddr, datagram: &[u8], now: Instant) -> Result<(), DecodeError> {
        let Some(session) = self.sessions.get_mut(&sender) else {
            trace!("ignoring session datagram from {:?} without a session", sender);
            return Ok(());
        };
        let guid = session.guid();
        let events = session.handle_datagram(datagram, now)?;
        self.dispatch(sender, guid, events, now);
        Ok(())
    }

    pub fn send_message(&mut self, address: SocketAddr, reliability: Reliability, channel: u8, payload: Bytes) -> anyhow::Result<Option<u32>> {
        let session = self.sessions.get_mut(&address)
            .ok_or_else(|| anyhow!("no session for {:?}", address))?;
        Ok(session.send_message(reliability, channel, payload)?)
    }

    fn dispatch(&mut self, address: SocketAddr, guid: u64, events: Vec<SessionEvent>, now: Instant) {
        for event in events {
            match event {
                SessionEvent::Connected => self.listener.on_client_connect(address, guid),
                SessionEvent::Message(message) => self.listener.on_message(address, guid, &message),
                SessionEvent::Acknowledged(receipt) => self.listener.on_acknowledge(address, receipt),
                SessionEvent::Lost(receipt) => self.listener.on_loss(address, receipt),
                SessionEvent::Disconnected => {
                    self.remove_session(address, REASON_CLIENT_DISCONNECTED, now);
                    return;
                }
            }
        }
    }

    /// Periodic maintenance: expires bans, bans peers that send too many datagrams, and updates
    ///  all sessions. A session that fails its update is reported and removed, without affecting
    ///  other sessions.
    pub fn tick(&mut self, now: Instant) {
        let listener = self.listener.clone();
        self.banned.retain(|&address, &mut expiry| {
            if expiry > now {
                return true;
            }
            debug!("ban of {} expired", address);
            listener.on_address_unblocked(address);
            false
        });

        let abusers = self.sessions.values()
            .filter(|s| s.packets_this_second() >= self.config.max_packets_per_second)
            .map(|s| s.address().ip())
            .collect::<Vec<_>>();
        for address in abusers {
            if !self.is_blocked(address, now) {
                self.block_address(address, REASON_TOO_MANY_PACKETS, self.config.abuse_ban_duration, now);
            }
        }

        let addresses = self.sessions.keys().cloned().collect::<Vec<_>>();
        for address in addresses {
            let Some(session) = self.sessions.get_mut(&address) else {
                continue;
            };
            let guid = session.guid();

            let result = panic::catch_unwind(AssertUnwindSafe(|| session.update(now)))
                .unwrap_or_else(|panic| Err(SessionError::Panicked(panic_message(panic.as_ref()))));
            match result {
                Ok(events) => self.dispatch(address, guid, events, now),
                Err(e) => {
                    warn!("session with {:?} failed: {}", address, e);
                    self.listener.on_session_exception(address, guid, &e);
                    self.remove_session(address, &e.to_string(), now);
                }
            }
        }
    }

    pub fn shutdown(&mut self, now: Instant) {
        let addresses = self.sessions.keys().cloned().collect::<Vec<_>>();
        for address in addresses {
            self.remove_session(address, REASON_SERVER_SHUTDOWN, now);
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    }
    else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    }
    else {
        "unknown panic".to_string()
    }
}
