use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::buf_ext::TRIAD_HALF_RANGE;
use crate::datagram::{CUSTOM_PACKET_HEADER_SIZE, UDP_IP_HEADER_SIZE};
use crate::frame::MAX_FRAME_PAYLOAD_LEN;

/// The smallest MTU the protocol works with, including IP and UDP headers
pub const MINIMUM_MTU: u16 = 530;

/// Upper bound for configured MTUs: the frame length field must be able to hold a full datagram
pub const MAXIMUM_MTU: u16 = (MAX_FRAME_PAYLOAD_LEN + UDP_IP_HEADER_SIZE + CUSTOM_PACKET_HEADER_SIZE) as u16;

pub const DEFAULT_PROTOCOL_VERSION: u8 = 10;

/// Configuration shared by servers and clients. Fields that apply to only one of the two roles
///  say so.
pub struct RakNetConfig {
    /// The local address to bind the UDP socket to. Clients typically use an ephemeral port.
    pub bind_addr: SocketAddr,

    /// RakNet protocol version. Both sides must agree on it exactly, there is no negotiation.
    pub protocol_version: u8,

    /// The biggest MTU this peer supports, including the 28 bytes of IP and UDP headers. Servers
    ///  do not answer open connection requests that exceed it, clients never propose more.
    ///
    /// With full Ethernet frames, RakNet peers usually use 1492 to leave room for PPPoE headers.
    pub max_mtu: u16,

    /// Server only: maximum number of sessions, including sessions that are still handshaking
    pub max_connections: usize,

    /// Server only: whether unconnected pings are answered at all
    pub broadcasting_enabled: bool,
    /// Server only: the identifier sent back in unconnected pongs, unless the listener provides
    ///  a different one
    pub identifier: String,

    /// Interval of the maintenance tick that drives resends, acknowledgments, keepalive and
    ///  timeouts
    pub tick_interval: Duration,

    /// A session that received nothing for this long is removed
    pub session_timeout: Duration,
    /// A connected session that received nothing for this long sends a connected ping to keep the
    ///  peer's idle timer from expiring, and to measure latency
    pub keepalive_interval: Duration,

    /// Server only: a peer that sends this many datagrams within a second is banned
    pub max_packets_per_second: u32,
    /// Server only: duration of a ban for exceeding `max_packets_per_second`
    pub abuse_ban_duration: Duration,

    /// The resend timeout before the first round trip time sample is available
    pub initial_resend_timeout: Duration,
    /// Lower bound of the resend timeout derived from the round trip time
    pub min_resend_timeout: Duration,
    /// Upper bound of the resend timeout, including exponential backoff
    pub max_resend_timeout: Duration,

    /// Maximum number of fragments of a single message, in either direction
    pub max_split_count: u32,
    /// Maximum number of incomplete split messages per session
    pub max_split_groups: usize,
    /// Maximum number of sequence numbers that are NACK'ed when a received datagram skips ahead.
    ///  This bounds the work an adversarial sequence number can cause.
    pub max_nack_gap: u32,
    /// How far ahead of the oldest missing message index (or order index, per channel) a received
    ///  reliable frame may be. Frames beyond are not accepted and must be sent again. This bounds
    ///  the state held for out of order frames.
    pub max_receive_window: u32,

    /// Client only: the MTUs to probe during the handshake, biggest first. Candidates bigger than
    ///  `max_mtu` are skipped.
    pub client_mtu_candidates: Vec<u16>,
    /// Client only: number of times each handshake request is sent before moving on
    pub login_attempts_per_mtu: u32,
    /// Client only: time to wait for a handshake reply before re-sending the request
    pub login_retry_interval: Duration,
    /// Client only: maximum time from sending the connection request until the session is
    ///  connected
    pub connect_timeout: Duration,
}

impl RakNetConfig {
    pub fn new(bind_addr: SocketAddr) -> RakNetConfig {
        RakNetConfig {
            bind_addr,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            max_mtu: 1492,
            max_connections: 1024,
            broadcasting_enabled: true,
            identifier: String::new(),
            tick_interval: Duration::from_millis(10),
            session_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(2),
            max_packets_per_second: 500,
            abuse_ban_duration: Duration::from_secs(300),
            initial_resend_timeout: Duration::from_millis(500),
            min_resend_timeout: Duration::from_millis(100),
            max_resend_timeout: Duration::from_secs(5),
            max_split_count: 128,
            max_split_groups: 4,
            max_nack_gap: 512,
            max_receive_window: 2048,
            client_mtu_candidates: vec![1492, 1400, 1200, 576],
            login_attempts_per_mtu: 4,
            login_retry_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_mtu < MINIMUM_MTU {
            bail!("max MTU {} is below the protocol minimum of {}", self.max_mtu, MINIMUM_MTU);
        }
        if self.max_mtu > MAXIMUM_MTU {
            bail!("max MTU {} exceeds the maximum of {}", self.max_mtu, MAXIMUM_MTU);
        }
        if self.max_connections == 0 {
            bail!("max connections must be positive");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        if self.keepalive_interval >= self.session_timeout {
            bail!("keepalive interval {:?} must be shorter than the session timeout {:?}", self.keepalive_interval, self.session_timeout);
        }
        if self.min_resend_timeout.is_zero() || self.min_resend_timeout > self.max_resend_timeout {
            bail!("invalid resend timeout bounds {:?}..{:?}", self.min_resend_timeout, self.max_resend_timeout);
        }
        if self.max_split_count == 0 || self.max_split_groups == 0 {
            bail!("split limits must be positive");
        }
        if self.max_receive_window == 0 || self.max_receive_window >= TRIAD_HALF_RANGE {
            bail!("max receive window must be between 1 and {}", TRIAD_HALF_RANGE - 1);
        }
        if self.login_attempts_per_mtu == 0 {
            bail!("login attempts per MTU must be positive");
        }
        if !self.client_mtu_candidates.iter().any(|&mtu| (MINIMUM_MTU..=self.max_mtu).contains(&mtu)) {
            bail!("no client MTU candidate between {} and {}", MINIMUM_MTU, self.max_mtu);
        }

        Ok(())
    }

    /// The candidates a client actually probes, biggest first
    pub fn effective_mtu_candidates(&self) -> Vec<u16> {
        let mut result = self.client_mtu_candidates.iter()
            .cloned()
            .filter(|&mtu| (MINIMUM_MTU..=self.max_mtu).contains(&mtu))
            .collect::<Vec<_>>();
        result.sort_unstable_by(|a, b| b.cmp(a));
        result.dedup();
        result
    }
}
