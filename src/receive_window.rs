use std::collections::{BTreeMap, BTreeSet};
use std::mem;

use tracing::trace;

use crate::buf_ext::{triad_before, triad_distance, triad_next, MAX_TRIAD};
use crate::config::RakNetConfig;
use crate::datagram::{Acknowledge, AcknowledgeKind, ACKNOWLEDGE_HEADER_SIZE, ACKNOWLEDGE_MAX_RECORD_SIZE, UDP_IP_HEADER_SIZE};
use crate::error::ReceiveError;
use crate::frame::{Frame, NUM_ORDER_CHANNELS};
use crate::split_assembler::SplitAssembler;

/// The number of ACK / NACK ranges that are guaranteed to fit into a single datagram
pub fn max_acknowledge_ranges(mtu: u16) -> usize {
    (usize::from(mtu) - UDP_IP_HEADER_SIZE - ACKNOWLEDGE_HEADER_SIZE) / ACKNOWLEDGE_MAX_RECORD_SIZE
}

#[derive(Default)]
struct OrderChannel {
    next_order_index: u32,
    /// ordered frames that arrived before their predecessors
    held: BTreeMap<u32, Frame>,
    highest_sequence_index: Option<u32>,
}

/// The inbound half of a session's reliability state.
///
/// It collects received datagram sequence numbers for acknowledgment and detects gaps for negative
///  acknowledgment. It filters duplicate reliable frames, reassembles split messages and restores
///  order per channel before frames are handed to the application.
///
/// All indices are triads that wrap around, and are compared accordingly. Reliable frames more than
///  `max_receive_window` ahead of the oldest missing message index or order index are refused,
///  which bounds the state kept for frames that arrive early.
pub struct ReceiveWindow {
    highest_sequence_number: Option<u32>,
    pending_acks: BTreeSet<u32>,
    pending_nacks: BTreeSet<u32>,
    max_nack_gap: u32,
    max_receive_window: u32,

    /// all message indices before this were received
    reliable_window_start: u32,
    /// received message indices after `reliable_window_start`
    received_message_indices: BTreeSet<u32>,

    channels: Vec<OrderChannel>,
    split_assembler: SplitAssembler,
}

impl ReceiveWindow {
    pub fn new(config: &RakNetConfig) -> ReceiveWindow {
        ReceiveWindow {
            highest_sequence_number: None,
            pending_acks: BTreeSet::new(),
            pending_nacks: BTreeSet::new(),
            max_nack_gap: config.max_nack_gap,
            max_receive_window: config.max_receive_window,
            reliable_window_start: 0,
            received_message_indices: BTreeSet::new(),
            channels: (0..NUM_ORDER_CHANNELS).map(|_| OrderChannel::default()).collect(),
            split_assembler: SplitAssembler::new(config.max_split_count, config.max_split_groups),
        }
    }

    pub fn num_pending_split_groups(&self) -> usize {
        self.split_assembler.num_pending_groups()
    }

    pub fn has_pending_acknowledgements(&self) -> bool {
        !self.pending_acks.is_empty() || !self.pending_nacks.is_empty()
    }

    /// Records a datagram for acknowledgment. Datagrams containing a frame that was refused with a
    ///  retriable [ReceiveError] must not be passed here: they are then NACK'ed as part of the
    ///  next gap, and the peer sends their frames again.
    pub fn on_datagram(&mut self, sequence_number: u32) {
        self.pending_acks.insert(sequence_number);
        self.pending_nacks.remove(&sequence_number);

        let expected = self.highest_sequence_number.map_or(0, triad_next);
        if triad_before(sequence_number, expected) {
            return;
        }

        let gap_len = triad_distance(expected, sequence_number).min(self.max_nack_gap);
        if gap_len > 0 {
            let gap_start = sequence_number.wrapping_sub(gap_len) & MAX_TRIAD;
            trace!("{} datagrams before #{} missing", gap_len, sequence_number);
            self.pending_nacks.extend((0..gap_len).map(|i| gap_start.wrapping_add(i) & MAX_TRIAD));
            while self.pending_nacks.len() > self.max_nack_gap as usize {
                self.pending_nacks.pop_first();
            }
        }
        self.highest_sequence_number = Some(sequence_number);
    }

    /// Processes a single received frame, returning the frames that are now deliverable in
    ///  delivery order. That may be none (duplicate, incomplete split message, held for ordering,
    ///  stale sequenced) or several (a frame completing a run of held ordered frames).
    ///
    /// A refused frame leaves no trace: it is not counted as received.
    pub fn on_frame(&mut self, frame: Frame) -> Result<Vec<Frame>, ReceiveError> {
        if let Some(message_index) = frame.message_index {
            if self.is_received(message_index) {
                trace!("dropping duplicate frame with message index {}", message_index);
                return Ok(Vec::new());
            }
            if triad_distance(self.reliable_window_start, message_index) >= self.max_receive_window {
                return Err(ReceiveError::MessageIndexOutOfWindow { index: message_index, window_start: self.reliable_window_start });
            }
        }
        if let Some(order) = frame.order.filter(|_| frame.reliability.is_ordered()) {
            let next_order_index = self.channels[order.channel as usize].next_order_index;
            if !triad_before(order.index, next_order_index) && triad_distance(next_order_index, order.index) >= self.max_receive_window {
                return Err(ReceiveError::OrderIndexOutOfWindow { channel: order.channel, index: order.index, window_start: next_order_index });
            }
        }
        self.split_assembler.check(&frame)?;

        if let Some(message_index) = frame.message_index {
            self.mark_received(message_index);
        }

        let Some(frame) = self.split_assembler.insert(frame)? else {
            return Ok(Vec::new());
        };

        let Some(order) = frame.order else {
            return Ok(vec![frame]);
        };
        let channel = &mut self.channels[order.channel as usize];

        if frame.reliability.is_sequenced() {
            if let Some(highest) = channel.highest_sequence_index {
                if !triad_before(highest, order.index) {
                    trace!("dropping stale sequenced frame #{} on channel {}", order.index, order.channel);
                    return Ok(Vec::new());
                }
            }
            channel.highest_sequence_index = Some(order.index);
            return Ok(vec![frame]);
        }

        if triad_before(order.index, channel.next_order_index) {
            return Ok(Vec::new());
        }
        if order.index != channel.next_order_index {
            trace!("holding frame #{} on channel {}, waiting for #{}", order.index, order.channel, channel.next_order_index);
            channel.held.insert(order.index, frame);
            return Ok(Vec::new());
        }

        let mut result = vec![frame];
        channel.next_order_index = triad_next(channel.next_order_index);
        while let Some(next) = channel.held.remove(&channel.next_order_index) {
            result.push(next);
            channel.next_order_index = triad_next(channel.next_order_index);
        }
        Ok(result)
    }

    fn is_received(&self, message_index: u32) -> bool {
        triad_before(message_index, self.reliable_window_start) || self.received_message_indices.contains(&message_index)
    }

    fn mark_received(&mut self, message_index: u32) {
        self.received_message_indices.insert(message_index);
        while self.received_message_indices.remove(&self.reliable_window_start) {
            self.reliable_window_start = triad_next(self.reliable_window_start);
        }
    }

    pub fn take_acks(&mut self, max_ranges: usize) -> Vec<Acknowledge> {
        Acknowledge::from_sequence_numbers(AcknowledgeKind::Ack, &mem::take(&mut self.pending_acks), max_ranges)
    }

    pub fn take_nacks(&mut self, max_ranges: usize) -> Vec<Acknowledge> {
        Acknowledge::from_sequence_numbers(AcknowledgeKind::Nack, &mem::take(&mut self.pending_nacks), max_ranges)
    }
}
