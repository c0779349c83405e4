use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::RakNetConfig;
use crate::error::SessionError;
use crate::listener::ServerListener;
use crate::send_socket::SendSocket;
use crate::session::ReceivedMessage;

pub fn test_addr(number: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, number)), 19132)
}

pub fn test_config() -> RakNetConfig {
    RakNetConfig::new(SocketAddr::from(([127, 0, 0, 1], 19132)))
}

/// a config for real sockets, bound to an ephemeral loopback port
pub fn loopback_config() -> RakNetConfig {
    RakNetConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)))
}

/// Collects all sent datagrams instead of sending them
#[derive(Default)]
pub struct RecordingSocket {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl RecordingSocket {
    pub fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// the first bytes of all datagrams sent so far, without consuming them
    pub fn sent_ids(&self) -> Vec<u8> {
        self.sent.lock().unwrap().iter()
            .map(|(_, buf)| buf[0])
            .collect()
    }
}

impl SendSocket for RecordingSocket {
    fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        self.sent.lock().unwrap().push((to, packet_buf.to_vec()));
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ListenerEvent {
    PreConnect(SocketAddr, u64),
    Connect(SocketAddr, u64),
    PreDisconnect(SocketAddr, String),
    Disconnect(SocketAddr, String),
    Message(SocketAddr, Vec<u8>),
    Acknowledge(SocketAddr, u32),
    Loss(SocketAddr, u32),
    Blocked(IpAddr, String, Duration),
    Unblocked(IpAddr),
    HandlerException(SocketAddr),
    SessionException(SocketAddr, SessionError),
}

/// A server listener that records callbacks in the order they happen
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn take(&self) -> Vec<ListenerEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn record(&self, event: ListenerEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl ServerListener for RecordingListener {
    fn on_client_pre_connect(&self, address: SocketAddr, guid: u64) {
        self.record(ListenerEvent::PreConnect(address, guid));
    }
    fn on_client_connect(&self, address: SocketAddr, guid: u64) {
        self.record(ListenerEvent::Connect(address, guid));
    }
    fn on_client_pre_disconnect(&self, address: SocketAddr, _guid: u64, reason: &str) {
        self.record(ListenerEvent::PreDisconnect(address, reason.to_string()));
    }
    fn on_client_disconnect(&self, address: SocketAddr, _guid: u64, reason: &str) {
        self.record(ListenerEvent::Disconnect(address, reason.to_string()));
    }
    fn on_message(&self, address: SocketAddr, _guid: u64, message: &ReceivedMessage) {
        self.record(ListenerEvent::Message(address, message.payload.to_vec()));
    }
    fn on_acknowledge(&self, address: SocketAddr, receipt: u32) {
        self.record(ListenerEvent::Acknowledge(address, receipt));
    }
    fn on_loss(&self, address: SocketAddr, receipt: u32) {
        self.record(ListenerEvent::Loss(address, receipt));
    }
    fn on_address_blocked(&self, address: IpAddr, reason: &str, duration: Duration) {
        self.record(ListenerEvent::Blocked(address, reason.to_string(), duration));
    }
    fn on_address_unblocked(&self, address: IpAddr) {
        self.record(ListenerEvent::Unblocked(address));
    }
    fn on_handler_exception(&self, sender: SocketAddr, _error: &anyhow::Error) {
        self.record(ListenerEvent::HandlerException(sender));
    }
    fn on_session_exception(&self, address: SocketAddr, _guid: u64, error: &SessionError) {
        self.record(ListenerEvent::SessionException(address, error.clone()));
    }
}
