use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

#[cfg(test)] use mockall::automock;

use crate::error::SessionError;
use crate::session::ReceivedMessage;

/// Callbacks from a [crate::server::RakNetServer] to the embedding application. They are called
///  while the server's session table is locked, so they must not block, and they must not call
///  back into the server.
///
/// All callbacks default to doing nothing, except for `on_ping` which answers every ping with the
///  configured identifier.
#[cfg_attr(test, automock)]
pub trait ServerListener: Send + Sync + 'static {
    fn on_server_start(&self, _local_addr: SocketAddr) {}

    fn on_server_shutdown(&self) {}

    /// A client completed the open connection handshake, and a session was created for it
    fn on_client_pre_connect(&self, _address: SocketAddr, _guid: u64) {}

    /// A client completed the login and can now exchange messages
    fn on_client_connect(&self, _address: SocketAddr, _guid: u64) {}

    /// A session was removed before it was connected
    fn on_client_pre_disconnect(&self, _address: SocketAddr, _guid: u64, _reason: &str) {}

    fn on_client_disconnect(&self, _address: SocketAddr, _guid: u64, _reason: &str) {}

    fn on_message(&self, _address: SocketAddr, _guid: u64, _message: &ReceivedMessage) {}

    fn on_acknowledge(&self, _address: SocketAddr, _receipt: u32) {}

    fn on_loss(&self, _address: SocketAddr, _receipt: u32) {}

    /// Produces the identifier for an unconnected pong, or `None` to leave the ping unanswered
    fn on_ping(&self, _sender: SocketAddr, default_identifier: &str) -> Option<String> {
        Some(default_identifier.to_string())
    }

    fn on_address_blocked(&self, _address: IpAddr, _reason: &str, _duration: Duration) {}

    fn on_address_unblocked(&self, _address: IpAddr) {}

    /// A datagram could not be handled, typically because it could not be decoded
    fn on_handler_exception(&self, _sender: SocketAddr, _error: &anyhow::Error) {}

    /// A session failed during its update and is about to be removed
    fn on_session_exception(&self, _address: SocketAddr, _guid: u64, _error: &SessionError) {}
}

/// Callbacks from a [crate::client::RakNetClient] to the embedding application
#[cfg_attr(test, automock)]
pub trait ClientListener: Send + Sync + 'static {
    fn on_connect(&self, _server: SocketAddr, _server_guid: u64) {}

    fn on_disconnect(&self, _server: SocketAddr, _reason: &str) {}

    fn on_message(&self, _message: &ReceivedMessage) {}

    fn on_acknowledge(&self, _receipt: u32) {}

    fn on_loss(&self, _receipt: u32) {}

    fn on_handler_exception(&self, _sender: SocketAddr, _error: &anyhow::Error) {}

    fn on_session_exception(&self, _error: &SessionError) {}
}

/// A listener that ignores everything, for peers that are only used for sending or pinging
pub struct NoopListener;

impl ServerListener for NoopListener {}
impl ClientListener for NoopListener {}
