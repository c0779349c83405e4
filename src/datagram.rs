use std::collections::BTreeSet;

use bytes::{Buf, BufMut, BytesMut};

use crate::buf_ext::{BufExt, BufMutExt};
use crate::error::DecodeError;
use crate::frame::Frame;
use crate::message_id::{ID_ACK, ID_CUSTOM_0, ID_CUSTOM_4, ID_CUSTOM_F, ID_NACK};

/// IP and UDP headers count against the MTU but are not part of the datagram payload
pub const UDP_IP_HEADER_SIZE: usize = 20 + 8;

/// custom packet id + datagram sequence number (triad)
pub const CUSTOM_PACKET_HEADER_SIZE: usize = 1 + 3;

/// id + number of records (u16)
pub const ACKNOWLEDGE_HEADER_SIZE: usize = 1 + 2;
/// single flag + start and end (triads)
pub const ACKNOWLEDGE_MAX_RECORD_SIZE: usize = 1 + 3 + 3;

/// A datagram carrying one or more frames of an established session.
///
/// ```ascii
/// 0: id (u8), 0x80 - 0x8f
/// 1: datagram sequence number (triad LE)
/// 4: frames until the end of the datagram
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CustomPacket {
    pub sequence_number: u32,
    pub frames: Vec<Frame>,
}

impl CustomPacket {
    pub fn encoded_len(&self) -> usize {
        CUSTOM_PACKET_HEADER_SIZE + self.frames.iter().map(Frame::encoded_len).sum::<usize>()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(ID_CUSTOM_4);
        buf.put_triad(self.sequence_number);
        for frame in &self.frames {
            frame.ser(buf);
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.ser(&mut buf);
        buf
    }

    pub fn deser(buf: &mut impl Buf) -> Result<CustomPacket, DecodeError> {
        let id = buf.try_get_u8()?;
        if !(ID_CUSTOM_0..=ID_CUSTOM_F).contains(&id) {
            return Err(DecodeError::UnexpectedMessageId { expected: ID_CUSTOM_4, actual: id });
        }

        let sequence_number = buf.try_get_triad()?;
        let mut frames = Vec::new();
        while buf.has_remaining() {
            frames.push(Frame::deser(buf)?);
        }

        Ok(CustomPacket {
            sequence_number,
            frames,
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AcknowledgeKind {
    Ack,
    Nack,
}
impl AcknowledgeKind {
    fn id(&self) -> u8 {
        match self {
            AcknowledgeKind::Ack => ID_ACK,
            AcknowledgeKind::Nack => ID_NACK,
        }
    }
}

/// An inclusive range of datagram sequence numbers, a single number if `start == end`
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SequenceRange {
    pub start: u32,
    pub end: u32,
}

impl SequenceRange {
    pub fn single(sequence_number: u32) -> SequenceRange {
        SequenceRange { start: sequence_number, end: sequence_number }
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    fn encoded_len(&self) -> usize {
        if self.is_single() { 1 + 3 } else { ACKNOWLEDGE_MAX_RECORD_SIZE }
    }
}

/// Positive or negative acknowledgment of a set of datagram sequence numbers.
///
/// ```ascii
/// 0: id (u8), 0xc0 for ACK, 0xa0 for NACK
/// 1: number of records (u16 BE)
/// *: (repeated) record:
///     * single flag (u8): 1 if the record is a single sequence number, 0 for a range
///     * start (triad LE)
///     * end (triad LE) - only present for ranges
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Acknowledge {
    pub kind: AcknowledgeKind,
    pub ranges: Vec<SequenceRange>,
}

impl Acknowledge {
    /// Compresses a set of sequence numbers into records of contiguous ranges. Each resulting
    ///  record holds at most `max_ranges` ranges so that it fits into a single datagram.
    pub fn from_sequence_numbers(kind: AcknowledgeKind, sequence_numbers: &BTreeSet<u32>, max_ranges: usize) -> Vec<Acknowledge> {
        let mut ranges: Vec<SequenceRange> = Vec::new();
        for &n in sequence_numbers {
            match ranges.last_mut() {
                Some(last) if last.end.checked_add(1) == Some(n) => last.end = n,
                _ => ranges.push(SequenceRange::single(n)),
            }
        }

        ranges.chunks(max_ranges.max(1))
            .map(|chunk| Acknowledge { kind, ranges: chunk.to_vec() })
            .collect()
    }

    pub fn encoded_len(&self) -> usize {
        ACKNOWLEDGE_HEADER_SIZE + self.ranges.iter().map(SequenceRange::encoded_len).sum::<usize>()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.ranges.len() <= u16::MAX as usize);

        buf.put_u8(self.kind.id());
        buf.put_u16(self.ranges.len() as u16);
        for range in &self.ranges {
            buf.put_bool(range.is_single());
            buf.put_triad(range.start);
            if !range.is_single() {
                buf.put_triad(range.end);
            }
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.ser(&mut buf);
        buf
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Acknowledge, DecodeError> {
        let kind = match buf.try_get_u8()? {
            ID_ACK => AcknowledgeKind::Ack,
            ID_NACK => AcknowledgeKind::Nack,
            id => return Err(DecodeError::UnexpectedMessageId { expected: ID_ACK, actual: id }),
        };

        let num_records = buf.try_get_u16()?;
        let mut ranges = Vec::with_capacity(usize::from(num_records).min(256));
        for _ in 0..num_records {
            let single = buf.try_get_bool()?;
            let start = buf.try_get_triad()?;
            let end = if single { start } else { buf.try_get_triad()? };
            if end < start {
                return Err(DecodeError::InvertedAckRange { start, end });
            }
            ranges.push(SequenceRange { start, end });
        }

        Ok(Acknowledge {
            kind,
            ranges,
        })
    }
}
