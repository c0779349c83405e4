use bytes::{Buf, BufMut, Bytes};

use crate::buf_ext::{BufExt, BufMutExt};
use crate::error::DecodeError;
use crate::reliability::Reliability;

pub const FLAG_SPLIT: u8 = 0b0001_0000;
const RELIABILITY_SHIFT: u8 = 5;

/// Number of independent ordering channels per session
pub const NUM_ORDER_CHANNELS: u8 = 32;

/// The payload length is transmitted in bits as a u16
pub const MAX_FRAME_PAYLOAD_LEN: usize = (u16::MAX / 8) as usize;

const SIZE_HEADER: usize = 1 + 2;
const SIZE_MESSAGE_INDEX: usize = 3;
const SIZE_ORDER: usize = 3 + 1;
const SIZE_SPLIT: usize = 4 + 2 + 4;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OrderInfo {
    pub index: u32,
    pub channel: u8,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SplitInfo {
    pub count: u32,
    pub id: u16,
    pub index: u32,
}

/// An encapsulated message, i.e. one logical unit of payload with its reliability header. Several
///  frames are multiplexed into a single custom packet datagram.
///
/// ```ascii
/// 0: flags (u8): bits 5-7 reliability, bit 4 split
/// 1: payload length in *bits* (u16 BE)
/// *: message index (triad LE) - if reliable
/// *: order index (triad LE), order channel (u8) - if ordered or sequenced
/// *: split count (u32 BE), split id (u16 BE), split index (u32 BE) - if split
/// *: payload
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub reliability: Reliability,
    /// present iff the reliability is reliable
    pub message_index: Option<u32>,
    /// present iff the reliability is ordered or sequenced
    pub order: Option<OrderInfo>,
    pub split: Option<SplitInfo>,
    pub payload: Bytes,
}

impl Frame {
    /// A frame without reliable, ordering or split fields. The reliability engine fills those in
    ///  when the frame is queued for sending.
    pub fn new(reliability: Reliability, payload: Bytes) -> Frame {
        Frame {
            reliability,
            message_index: None,
            order: None,
            split: None,
            payload,
        }
    }

    /// The exact number of bytes a frame occupies on the wire, without actually encoding it
    pub fn calculate_size(reliability: Reliability, split: bool, payload_len: usize) -> usize {
        let mut size = SIZE_HEADER + payload_len;
        if reliability.is_reliable() {
            size += SIZE_MESSAGE_INDEX;
        }
        if reliability.has_order_fields() {
            size += SIZE_ORDER;
        }
        if split {
            size += SIZE_SPLIT;
        }
        size
    }

    pub fn encoded_len(&self) -> usize {
        Self::calculate_size(self.reliability, self.split.is_some(), self.payload.len())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.payload.len() <= MAX_FRAME_PAYLOAD_LEN);

        let mut flags = u8::from(self.reliability) << RELIABILITY_SHIFT;
        if self.split.is_some() {
            flags |= FLAG_SPLIT;
        }
        buf.put_u8(flags);
        buf.put_u16((self.payload.len() * 8) as u16);

        debug_assert_eq!(self.reliability.is_reliable(), self.message_index.is_some(), "message index does not match {:?}", self.reliability);
        debug_assert_eq!(self.reliability.has_order_fields(), self.order.is_some(), "order fields do not match {:?}", self.reliability);

        if self.reliability.is_reliable() {
            buf.put_triad(self.message_index.unwrap_or_default());
        }
        if self.reliability.has_order_fields() {
            let order = self.order.unwrap_or(OrderInfo { index: 0, channel: 0 });
            buf.put_triad(order.index);
            buf.put_u8(order.channel);
        }
        if let Some(split) = &self.split {
            buf.put_u32(split.count);
            buf.put_u16(split.id);
            buf.put_u32(split.index);
        }
        buf.put_slice(&self.payload);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Frame, DecodeError> {
        let flags = buf.try_get_u8()?;
        let reliability = Reliability::try_from(flags >> RELIABILITY_SHIFT)
            .map_err(|e| DecodeError::UnknownReliability(e.number))?;
        let is_split = flags & FLAG_SPLIT != 0;

        let len_in_bits = buf.try_get_u16()?;
        let payload_len = usize::from(len_in_bits).div_ceil(8);

        let message_index = if reliability.is_reliable() {
            Some(buf.try_get_triad()?)
        }
        else {
            None
        };

        let order = if reliability.has_order_fields() {
            let index = buf.try_get_triad()?;
            let channel = buf.try_get_u8()?;
            if channel >= NUM_ORDER_CHANNELS {
                return Err(DecodeError::InvalidOrderChannel(channel));
            }
            Some(OrderInfo { index, channel })
        }
        else {
            None
        };

        let split = if is_split {
            Some(SplitInfo {
                count: buf.try_get_u32()?,
                id: buf.try_get_u16()?,
                index: buf.try_get_u32()?,
            })
        }
        else {
            None
        };

        let payload = buf.try_get_bytes(payload_len)?;

        Ok(Frame {
            reliability,
            message_index,
            order,
            split,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    fn frame(reliability: Reliability, split: bool, payload_len: usize) -> Frame {
        Frame {
            reliability,
            message_index: reliability.is_reliable().then_some(0x01_0203),
            order: reliability.has_order_fields().then_some(OrderInfo { index: 0x0a_0b0c, channel: 31 }),
            split: split.then_some(SplitInfo { count: 3, id: 0x1234, index: 2 }),
            payload: Bytes::from((0..payload_len).map(|i| i as u8).collect::<Vec<_>>()),
        }
    }

    #[rstest]
    fn test_ser_deser(
        #[values(
            Reliability::Unreliable,
            Reliability::UnreliableSequenced,
            Reliability::Reliable,
            Reliability::ReliableOrdered,
            Reliability::ReliableSequenced,
            Reliability::UnreliableWithAckReceipt,
            Reliability::ReliableWithAckReceipt,
            Reliability::ReliableOrderedWithAckReceipt
        )] reliability: Reliability,
        #[values(false, true)] split: bool,
        #[values(0, 1, 7, 8, 255, 1000, 1464)] payload_len: usize,
    ) {
        let frame = frame(reliability, split, payload_len);

        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(buf.len(), Frame::calculate_size(reliability, split, payload_len));
        assert_eq!(buf.len(), frame.encoded_len());

        let mut b: &[u8] = &buf;
        let deser = Frame::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, frame);
    }

    #[rstest]
    #[case::unreliable(Reliability::Unreliable, false, vec![0x00, 0,24, 1,2,3])]
    #[case::reliable(Reliability::Reliable, false, vec![0x40, 0,24, 3,2,1, 1,2,3])]
    #[case::reliable_ordered(Reliability::ReliableOrdered, false, vec![0x60, 0,24, 3,2,1, 0x0c,0x0b,0x0a, 31, 1,2,3])]
    #[case::unreliable_sequenced(Reliability::UnreliableSequenced, false, vec![0x20, 0,24, 0x0c,0x0b,0x0a, 31, 1,2,3])]
    #[case::reliable_split(Reliability::Reliable, true, vec![0x50, 0,24, 3,2,1, 0,0,0,3, 0x12,0x34, 0,0,0,2, 1,2,3])]
    fn test_wire_layout(#[case] reliability: Reliability, #[case] split: bool, #[case] expected: Vec<u8>) {
        let mut f = frame(reliability, split, 0);
        f.payload = Bytes::from_static(&[1, 2, 3]);

        let mut buf = BytesMut::new();
        f.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[cfg(debug_assertions)]
    #[rstest]
    #[case::missing_message_index(Frame::new(Reliability::Reliable, Bytes::from_static(b"x")))]
    #[case::missing_order(Frame { message_index: Some(1), ..Frame::new(Reliability::ReliableOrdered, Bytes::from_static(b"x")) })]
    #[case::unexpected_order(Frame { order: Some(OrderInfo { index: 1, channel: 0 }), ..Frame::new(Reliability::Unreliable, Bytes::from_static(b"x")) })]
    #[should_panic]
    fn test_ser_inconsistent_fields(#[case] frame: Frame) {
        frame.ser(&mut BytesMut::new());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::no_length(vec![0x00, 0])]
    #[case::payload_too_short(vec![0x00, 0,24, 1,2])]
    #[case::no_message_index(vec![0x40, 0,8, 1,2])]
    #[case::no_split_fields(vec![0x50, 0,8, 1,2,3, 0,0,0,3, 0])]
    fn test_deser_truncated(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(matches!(Frame::deser(&mut b), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn test_deser_invalid_channel() {
        let raw = vec![0x60, 0,8, 0,0,0, 0,0,0, 32, 9];
        let mut b: &[u8] = &raw;
        assert_eq!(Frame::deser(&mut b), Err(DecodeError::InvalidOrderChannel(32)));
    }

    #[test]
    fn test_deser_consecutive_frames() {
        let first = frame(Reliability::ReliableOrdered, false, 5);
        let second = frame(Reliability::Unreliable, true, 9);

        let mut buf = BytesMut::new();
        first.ser(&mut buf);
        second.ser(&mut buf);

        let mut b: &[u8] = &buf;
        assert_eq!(Frame::deser(&mut b).unwrap(), first);
        assert_eq!(Frame::deser(&mut b).unwrap(), second);
        assert!(b.is_empty());
    }
}
