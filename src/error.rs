use std::string::FromUtf8Error;
use std::time::Duration;

use thiserror::Error;

/// Failure to decode a single wire message. There are no partial results: a decode error
///  invalidates the whole containing packet, which is then dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("invalid socket address version: {0}")]
    InvalidAddressVersion(u8),
    #[error("offline message magic mismatch")]
    MagicMismatch,
    #[error("invalid value for a boolean: {0}")]
    InvalidBool(u8),
    #[error("invalid string: {0}")]
    InvalidString(#[from] FromUtf8Error),
    #[error("unexpected message id {actual:#04x}, expected {expected:#04x}")]
    UnexpectedMessageId { expected: u8, actual: u8 },
    #[error("unknown message id {0:#04x}")]
    UnknownMessageId(u8),
    #[error("unknown reliability {0}")]
    UnknownReliability(u8),
    #[error("order channel {0} out of range")]
    InvalidOrderChannel(u8),
    #[error("inverted acknowledgment range {start}..={end}")]
    InvertedAckRange { start: u32, end: u32 },
}

impl From<bytes::TryGetError> for DecodeError {
    fn from(e: bytes::TryGetError) -> Self {
        DecodeError::Truncated { needed: e.requested, remaining: e.available }
    }
}

/// The reason a connection attempt was cancelled. Recorded on the initiator's
///  [crate::handshake::SessionPreparation], and mirrored by the responder's negative replies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("offline message magic mismatch")]
    MagicMismatch,
    #[error("MTU {mtu} outside of the supported range {min}..={max}")]
    MtuOutOfRange { mtu: u16, min: u16, max: u16 },
    #[error("server raised the MTU from the agreed {agreed} to {requested}")]
    MtuRenegotiationViolation { agreed: u16, requested: u16 },
    #[error("server guid changed from {expected} to {actual} during the handshake")]
    GuidMismatch { expected: u64, actual: u64 },
    #[error("a session for this client is already connected")]
    AlreadyConnected,
    #[error("the server has no free incoming connections")]
    NoFreeIncomingConnections,
    #[error("the server banned this address")]
    ConnectionBanned,
    #[error("incompatible protocol version: server speaks {server}, client speaks {client}")]
    IncompatibleProtocolVersion { server: u8, client: u8 },
    #[error("malformed handshake reply: {0}")]
    FrameDecodeFailure(#[from] DecodeError),
}

/// Fragment metadata that disagrees with an in-progress split group, or exceeds the configured
///  limits. The offending fragment is dropped, the group stays intact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitGroupError {
    #[error("split group {split_id}: fragment declares count {declared}, group was opened with {expected}")]
    CountMismatch { split_id: u16, declared: u32, expected: u32 },
    #[error("split group {split_id}: fragment index {index} out of range for count {count}")]
    IndexOutOfRange { split_id: u16, index: u32, count: u32 },
    #[error("split group {split_id}: count {count} exceeds the maximum of {max}")]
    CountTooLarge { split_id: u16, count: u32, max: u32 },
    #[error("split group {split_id}: {max} split groups are already in progress")]
    TooManyGroups { split_id: u16, max: usize },
}

/// A frame the receive window did not accept. Frames beyond the window are not counted as received,
///  so the peer sends them again once the datagram that carried them stays unacknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiveError {
    #[error("message index {index} is beyond the receive window starting at {window_start}")]
    MessageIndexOutOfWindow { index: u32, window_start: u32 },
    #[error("order index {index} on channel {channel} is beyond the receive window starting at {window_start}")]
    OrderIndexOutOfWindow { channel: u8, index: u32, window_start: u32 },
    #[error(transparent)]
    SplitGroup(#[from] SplitGroupError),
}

impl ReceiveError {
    /// whether the frame may be accepted when it is sent again later
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ReceiveError::SplitGroup(_))
    }
}

/// Failures of an established session, either when sending or during the periodic update.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session timed out after {0:?} without activity")]
    TimedOut(Duration),
    #[error("order channel {0} out of range")]
    InvalidOrderChannel(u8),
    #[error("message of {len} bytes needs {fragments} fragments, the maximum is {max}")]
    MessageTooLarge { len: usize, fragments: usize, max: u32 },
    #[error("session update panicked: {0}")]
    Panicked(String),
}
