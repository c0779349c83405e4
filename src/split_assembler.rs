use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::SplitGroupError;
use crate::frame::Frame;

struct SplitGroup {
    count: u32,
    /// sparse, keyed by fragment index
    fragments: BTreeMap<u32, Bytes>,
}

/// Collects the fragments of split messages per split id, and reassembles a message once all its
///  fragments are present. Incomplete groups live until they complete or the session ends.
///
/// The group limit applies to groups opened by unreliable fragments. Reliable fragments are never
///  refused for it: each of them carries a message index, so the receive window bounds their
///  number, and refusing them would lose the message.
pub struct SplitAssembler {
    groups: FxHashMap<u16, SplitGroup>,
    max_split_count: u32,
    max_groups: usize,
}

impl SplitAssembler {
    pub fn new(max_split_count: u32, max_groups: usize) -> SplitAssembler {
        SplitAssembler {
            groups: FxHashMap::default(),
            max_split_count,
            max_groups,
        }
    }

    pub fn num_pending_groups(&self) -> usize {
        self.groups.len()
    }

    /// Checks whether [SplitAssembler::insert] would accept a fragment, without changing any state
    pub fn check(&self, frame: &Frame) -> Result<(), SplitGroupError> {
        let Some(split) = frame.split else {
            return Ok(());
        };

        if split.count > self.max_split_count {
            return Err(SplitGroupError::CountTooLarge { split_id: split.id, count: split.count, max: self.max_split_count });
        }
        if split.index >= split.count {
            return Err(SplitGroupError::IndexOutOfRange { split_id: split.id, index: split.index, count: split.count });
        }

        match self.groups.get(&split.id) {
            Some(group) if group.count != split.count => {
                Err(SplitGroupError::CountMismatch { split_id: split.id, declared: split.count, expected: group.count })
            }
            None if !frame.reliability.is_reliable() && self.groups.len() >= self.max_groups => {
                Err(SplitGroupError::TooManyGroups { split_id: split.id, max: self.max_groups })
            }
            _ => Ok(()),
        }
    }

    /// Adds a fragment, returning the reassembled frame if this fragment completed its group.
    ///  A frame without split info is returned as is.
    ///
    /// NB: The reassembled frame has the reliability and ordering fields of the completing
    ///      fragment, which are the same for all fragments of a message
    pub fn insert(&mut self, frame: Frame) -> Result<Option<Frame>, SplitGroupError> {
        self.check(&frame)?;
        let Some(split) = frame.split else {
            return Ok(Some(frame));
        };

        if !self.groups.contains_key(&split.id) {
            trace!("opening split group {} with {} fragments", split.id, split.count);
            self.groups.insert(split.id, SplitGroup {
                count: split.count,
                fragments: BTreeMap::default(),
            });
        }

        let is_complete = match self.groups.get_mut(&split.id) {
            Some(group) => {
                group.fragments.entry(split.index).or_insert_with(|| frame.payload.clone());
                group.fragments.len() >= group.count as usize
            }
            None => false,
        };
        if !is_complete {
            return Ok(None);
        }

        let group = match self.groups.remove(&split.id) {
            Some(group) => group,
            None => return Ok(None),
        };

        let total_len = group.fragments.values().map(Bytes::len).sum();
        let mut payload = BytesMut::with_capacity(total_len);
        for fragment in group.fragments.values() {
            payload.put_slice(fragment);
        }
        trace!("split group {} complete: {} bytes", split.id, total_len);

        Ok(Some(Frame {
            reliability: frame.reliability,
            message_index: frame.message_index,
            order: frame.order,
            split: None,
            payload: payload.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::frame::{OrderInfo, SplitInfo};
    use crate::reliability::Reliability;
    use super::*;

    fn fragment(id: u16, count: u32, index: u32, payload: &[u8]) -> Frame {
        Frame {
            reliability: Reliability::ReliableOrdered,
            message_index: Some(index),
            order: Some(OrderInfo { index: 4, channel: 2 }),
            split: Some(SplitInfo { count, id, index }),
            payload: Bytes::copy_from_slice(payload),
        }
    }

    fn unreliable_fragment(id: u16, count: u32, index: u32, payload: &[u8]) -> Frame {
        Frame {
            reliability: Reliability::Unreliable,
            message_index: None,
            order: None,
            ..fragment(id, count, index, payload)
        }
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2])]
    #[case::reversed(vec![2, 1, 0])]
    #[case::mixed_1(vec![1, 0, 2])]
    #[case::mixed_2(vec![2, 0, 1])]
    #[case::mixed_3(vec![0, 2, 1])]
    #[case::mixed_4(vec![1, 2, 0])]
    fn test_reassembly_permutations(#[case] arrival_order: Vec<u32>) {
        let payloads: [&[u8]; 3] = [b"abc", b"de", b"fghi"];

        let mut assembler = SplitAssembler::new(128, 4);
        for (i, &index) in arrival_order.iter().enumerate() {
            let result = assembler.insert(fragment(9, 3, index, payloads[index as usize])).unwrap();
            if i < arrival_order.len() - 1 {
                assert!(result.is_none());
                assert_eq!(assembler.num_pending_groups(), 1);
            }
            else {
                let frame = result.unwrap();
                assert_eq!(frame.payload.as_ref(), b"abcdefghi");
                assert_eq!(frame.split, None);
                assert_eq!(frame.order, Some(OrderInfo { index: 4, channel: 2 }));
                assert_eq!(assembler.num_pending_groups(), 0);
            }
        }
    }

    #[test]
    fn test_subset_never_completes() {
        let mut assembler = SplitAssembler::new(128, 4);
        assert!(assembler.insert(fragment(1, 4, 0, b"a")).unwrap().is_none());
        assert!(assembler.insert(fragment(1, 4, 3, b"d")).unwrap().is_none());
        assert!(assembler.insert(fragment(1, 4, 3, b"d")).unwrap().is_none());
        assert!(assembler.insert(fragment(1, 4, 1, b"b")).unwrap().is_none());
        assert_eq!(assembler.num_pending_groups(), 1);

        assert_eq!(assembler.insert(fragment(1, 4, 2, b"c")).unwrap().unwrap().payload.as_ref(), b"abcd");
    }

    #[test]
    fn test_interleaved_groups() {
        let mut assembler = SplitAssembler::new(128, 4);
        assert!(assembler.insert(fragment(1, 2, 0, b"a")).unwrap().is_none());
        assert!(assembler.insert(fragment(2, 2, 1, b"y")).unwrap().is_none());
        assert_eq!(assembler.insert(fragment(2, 2, 0, b"x")).unwrap().unwrap().payload.as_ref(), b"xy");
        assert_eq!(assembler.insert(fragment(1, 2, 1, b"b")).unwrap().unwrap().payload.as_ref(), b"ab");
    }

    #[test]
    fn test_single_fragment() {
        let mut assembler = SplitAssembler::new(128, 4);
        assert_eq!(assembler.insert(fragment(1, 1, 0, b"a")).unwrap().unwrap().payload.as_ref(), b"a");
    }

    #[test]
    fn test_unsplit_frame_passes_through() {
        let mut assembler = SplitAssembler::new(128, 4);
        let frame = Frame::new(Reliability::Unreliable, Bytes::from_static(b"xyz"));
        assert_eq!(assembler.insert(frame.clone()).unwrap(), Some(frame));
    }

    #[rstest]
    #[case::index_out_of_range(fragment(1, 3, 3, b"a"), SplitGroupError::IndexOutOfRange { split_id: 1, index: 3, count: 3 })]
    #[case::zero_count(fragment(1, 0, 0, b"a"), SplitGroupError::IndexOutOfRange { split_id: 1, index: 0, count: 0 })]
    #[case::count_too_large(fragment(1, 129, 0, b"a"), SplitGroupError::CountTooLarge { split_id: 1, count: 129, max: 128 })]
    #[case::count_mismatch(fragment(5, 4, 1, b"a"), SplitGroupError::CountMismatch { split_id: 5, declared: 4, expected: 3 })]
    #[case::too_many_groups(unreliable_fragment(6, 2, 0, b"a"), SplitGroupError::TooManyGroups { split_id: 6, max: 2 })]
    fn test_inconsistent(#[case] frame: Frame, #[case] expected: SplitGroupError) {
        let mut assembler = SplitAssembler::new(128, 2);
        assembler.insert(fragment(5, 3, 0, b"x")).unwrap();
        assembler.insert(fragment(7, 3, 0, b"x")).unwrap();

        assert_eq!(assembler.check(&frame), Err(expected.clone()));
        assert_eq!(assembler.insert(frame), Err(expected));
        assert_eq!(assembler.num_pending_groups(), 2);
    }

    #[test]
    fn test_group_limit_applies_to_unreliable_groups() {
        let mut assembler = SplitAssembler::new(128, 2);
        assert!(assembler.insert(unreliable_fragment(1, 2, 0, b"a")).unwrap().is_none());
        assert!(assembler.insert(fragment(2, 2, 0, b"b")).unwrap().is_none());
        assert!(assembler.insert(fragment(3, 2, 0, b"c")).unwrap().is_none());
        assert_eq!(assembler.num_pending_groups(), 3);

        assert!(assembler.insert(unreliable_fragment(4, 2, 0, b"d")).is_err());
        assert_eq!(assembler.insert(unreliable_fragment(1, 2, 1, b"A")).unwrap().unwrap().payload.as_ref(), b"aA");
        assert_eq!(assembler.insert(fragment(3, 2, 1, b"C")).unwrap().unwrap().payload.as_ref(), b"cC");
        assert!(assembler.insert(unreliable_fragment(4, 2, 0, b"d")).unwrap().is_none());
    }
}
