//! An implementation of the RakNet transport protocol, as it is spoken by game clients and servers,
//!  for use in a proxy. It provides reliable, ordered, fragmented message delivery over UDP.
//!
//! ## Layers
//!
//! * Offline messages: unconnected ping / pong for discovery, and the two phase open connection
//!   handshake that negotiates the MTU and exchanges guids. These are single datagrams identified
//!   by their first byte and a 16 byte 'magic' marker.
//! * Custom packets: once the handshake is done, all traffic goes through datagrams with a
//!   sequence number, each carrying one or more *frames*. Datagrams are acknowledged (ACK) or
//!   reported missing (NACK) by the receiver.
//! * Frames: an encapsulated message with a reliability tag, optional ordering information and
//!   optional split (fragmentation) information.
//! * Connected messages: the first payload byte of a frame distinguishes the protocol's own
//!   messages (connected login, ping / pong, disconnect) from application messages.
//!
//! ## Reliability
//!
//! Each message is sent with one of eight reliabilities:
//!
//! * *unreliable*: fire and forget
//! * *unreliable sequenced*: older messages arriving after newer ones on the same channel are
//!   dropped
//! * *reliable*: resent until acknowledged, delivered in arrival order
//! * *reliable ordered*: resent until acknowledged, delivered in send order per channel
//! * *reliable sequenced*: resent until acknowledged, stale messages are dropped
//! * the *with ack receipt* variants additionally report back when the message was acknowledged
//!   (or, for unreliable messages, lost)
//!
//! There are 32 independent order channels. Messages that do not fit into a single datagram are
//!  split into fragments and reassembled by the receiver. Fragments of unreliable messages are sent
//!  with the reliable counterpart of the message's reliability.
//!
//! ## MTU
//!
//! MTUs are stated including 28 bytes of IP and UDP headers. The client probes a list of candidate
//!  MTUs, largest first; the server silently ignores requests for MTUs it does not support.
//!
//! ## Peers
//!
//! [server::RakNetServer] and [client::RakNetClient] run on tokio. All protocol logic below them
//!  is synchronous and time is passed in explicitly, so it is deterministic in tests.

pub mod buf_ext;
pub mod client;
pub mod config;
pub mod datagram;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod listener;
pub mod login_messages;
pub mod message_id;
pub mod offline_messages;
pub mod receive_window;
pub mod reliability;
pub mod resend_timeout;
pub mod send_socket;
pub mod send_window;
pub mod server;
pub mod session;
pub mod session_registry;
pub mod split_assembler;

#[cfg(test)]
mod test_util;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_test_writer()
            .try_init()
            .ok();
    }
}
