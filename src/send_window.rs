use std::collections::{BTreeMap, VecDeque};
use std::mem;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::buf_ext::triad_next;
use crate::config::RakNetConfig;
use crate::datagram::{Acknowledge, CustomPacket, CUSTOM_PACKET_HEADER_SIZE, UDP_IP_HEADER_SIZE};
use crate::error::SessionError;
use crate::frame::{Frame, OrderInfo, SplitInfo, NUM_ORDER_CHANNELS};
use crate::reliability::Reliability;
use crate::resend_timeout::ResendTimeout;

/// Outcome of a send with an ack receipt, identified by the receipt id returned when the message
///  was queued
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Receipt {
    Acknowledged(u32),
    Lost(u32),
}

#[derive(Debug, Clone)]
struct QueuedFrame {
    frame: Frame,
    receipt: Option<u32>,
    resent: bool,
}

struct SentDatagram {
    frames: Vec<QueuedFrame>,
    sent_at: Instant,
    /// contains retransmitted frames, so its acknowledgment is no valid RTT sample
    resent: bool,
}

#[derive(Default, Clone, Copy)]
struct ChannelCounters {
    next_order_index: u32,
    next_sequence_index: u32,
}

fn next_triad(counter: &mut u32) -> u32 {
    let result = *counter;
    *counter = triad_next(*counter);
    result
}

/// The outbound half of a session's reliability state: it numbers and splits outgoing messages,
///  packs them into datagrams and keeps tracked frames around until they are acknowledged.
pub struct SendWindow {
    mtu: u16,
    max_split_count: u32,

    next_sequence_number: u32,
    next_message_index: u32,
    channels: [ChannelCounters; NUM_ORDER_CHANNELS as usize],
    next_split_id: u16,
    next_receipt_id: u32,

    queue: VecDeque<QueuedFrame>,
    /// tracked frames by the sequence number of the datagram they were last sent in
    recovery: BTreeMap<u32, SentDatagram>,
    /// number of unacknowledged fragments per receipt id
    outstanding_receipts: FxHashMap<u32, u32>,
    resend_timeout: ResendTimeout,
}

impl SendWindow {
    pub fn new(mtu: u16, config: &RakNetConfig) -> SendWindow {
        SendWindow {
            mtu,
            max_split_count: config.max_split_count,
            next_sequence_number: 0,
            next_message_index: 0,
            channels: Default::default(),
            next_split_id: 0,
            next_receipt_id: 0,
            queue: VecDeque::new(),
            recovery: BTreeMap::new(),
            outstanding_receipts: FxHashMap::default(),
            resend_timeout: ResendTimeout::new(config.initial_resend_timeout, config.min_resend_timeout, config.max_resend_timeout),
        }
    }

    /// The number of bytes available for frames in a single custom packet
    pub fn datagram_budget(&self) -> usize {
        usize::from(self.mtu) - UDP_IP_HEADER_SIZE - CUSTOM_PACKET_HEADER_SIZE
    }

    pub fn resend_timeout(&self) -> std::time::Duration {
        self.resend_timeout.current()
    }

    pub fn smoothed_rtt(&self) -> Option<std::time::Duration> {
        self.resend_timeout.smoothed_rtt()
    }

    pub fn num_queued(&self) -> usize {
        self.queue.len()
    }

    pub fn num_unacknowledged(&self) -> usize {
        self.recovery.len()
    }

    /// Numbers a message and queues it for sending, splitting it into fragments if it does not fit
    ///  into a single datagram. Returns the receipt id for reliabilities with ack receipt.
    ///
    /// Nothing is numbered if the message is rejected.
    pub fn queue_message(&mut self, reliability: Reliability, channel: u8, payload: Bytes) -> Result<Option<u32>, SessionError> {
        if channel >= NUM_ORDER_CHANNELS {
            return Err(SessionError::InvalidOrderChannel(channel));
        }

        let budget = self.datagram_budget();
        let needs_split = Frame::calculate_size(reliability, false, payload.len()) > budget;

        let (reliability, num_fragments) = if needs_split {
            let reliability = reliability.for_split();
            let fragment_capacity = budget - Frame::calculate_size(reliability, true, 0);
            let num_fragments = payload.len().div_ceil(fragment_capacity);
            if num_fragments > self.max_split_count as usize {
                return Err(SessionError::MessageTooLarge { len: payload.len(), fragments: num_fragments, max: self.max_split_count });
            }
            (reliability, num_fragments)
        }
        else {
            (reliability, 1)
        };

        let order = self.next_order_info(reliability, channel);
        let receipt = if reliability.requires_ack_receipt() {
            let id = self.next_receipt_id;
            self.next_receipt_id = self.next_receipt_id.wrapping_add(1);
            self.outstanding_receipts.insert(id, num_fragments as u32);
            Some(id)
        }
        else {
            None
        };

        if !needs_split {
            let frame = Frame {
                reliability,
                message_index: self.next_message_index(reliability),
                order,
                split: None,
                payload,
            };
            self.queue.push_back(QueuedFrame { frame, receipt, resent: false });
            return Ok(receipt);
        }

        let split_id = self.next_split_id;
        self.next_split_id = self.next_split_id.wrapping_add(1);

        let fragment_capacity = budget - Frame::calculate_size(reliability, true, 0);
        trace!("splitting message of {} bytes into {} fragments with split id {}", payload.len(), num_fragments, split_id);
        for index in 0..num_fragments {
            let start = index * fragment_capacity;
            let end = (start + fragment_capacity).min(payload.len());
            let frame = Frame {
                reliability,
                message_index: self.next_message_index(reliability),
                order,
                split: Some(SplitInfo {
                    count: num_fragments as u32,
                    id: split_id,
                    index: index as u32,
                }),
                payload: payload.slice(start..end),
            };
            self.queue.push_back(QueuedFrame { frame, receipt, resent: false });
        }
        Ok(receipt)
    }

    fn next_message_index(&mut self, reliability: Reliability) -> Option<u32> {
        if reliability.is_reliable() {
            Some(next_triad(&mut self.next_message_index))
        }
        else {
            None
        }
    }

    fn next_order_info(&mut self, reliability: Reliability, channel: u8) -> Option<OrderInfo> {
        let counters = &mut self.channels[channel as usize];
        if reliability.is_ordered() {
            Some(OrderInfo { index: next_triad(&mut counters.next_order_index), channel })
        }
        else if reliability.is_sequenced() {
            Some(OrderInfo { index: next_triad(&mut counters.next_sequence_index), channel })
        }
        else {
            None
        }
    }

    /// Packs all queued frames into datagrams, assigning consecutive sequence numbers. Tracked
    ///  frames are kept for resending until they are acknowledged.
    pub fn flush(&mut self, now: Instant) -> Vec<CustomPacket> {
        let budget = self.datagram_budget();

        let mut result = Vec::new();
        let mut wip = Vec::new();
        let mut wip_len = 0;
        while let Some(queued) = self.queue.pop_front() {
            let len = queued.frame.encoded_len();
            if !wip.is_empty() && wip_len + len > budget {
                result.push(self.seal(mem::take(&mut wip), now));
                wip_len = 0;
            }
            wip_len += len;
            wip.push(queued);
        }
        if !wip.is_empty() {
            result.push(self.seal(wip, now));
        }
        result
    }

    fn seal(&mut self, frames: Vec<QueuedFrame>, now: Instant) -> CustomPacket {
        let sequence_number = next_triad(&mut self.next_sequence_number);
        let packet = CustomPacket {
            sequence_number,
            frames: frames.iter().map(|q| q.frame.clone()).collect(),
        };

        let tracked = frames.into_iter()
            .filter(|q| q.frame.reliability.is_tracked())
            .collect::<Vec<_>>();
        if !tracked.is_empty() {
            let resent = tracked.iter().any(|q| q.resent);
            self.recovery.insert(sequence_number, SentDatagram { frames: tracked, sent_at: now, resent });
        }

        trace!("sealed datagram #{} with {} frames", sequence_number, packet.frames.len());
        packet
    }

    pub fn on_ack(&mut self, ack: &Acknowledge, now: Instant) -> Vec<Receipt> {
        let mut receipts = Vec::new();
        for sequence_number in self.covered_sequence_numbers(ack) {
            let Some(sent) = self.recovery.remove(&sequence_number) else {
                continue;
            };
            if !sent.resent {
                self.resend_timeout.on_sample(now.saturating_duration_since(sent.sent_at));
            }
            for queued in sent.frames {
                if let Some(receipt) = queued.receipt {
                    self.on_fragment_acknowledged(receipt, &mut receipts);
                }
            }
        }
        receipts
    }

    fn on_fragment_acknowledged(&mut self, receipt: u32, receipts: &mut Vec<Receipt>) {
        if let Some(remaining) = self.outstanding_receipts.get_mut(&receipt) {
            *remaining -= 1;
            if *remaining == 0 {
                self.outstanding_receipts.remove(&receipt);
                receipts.push(Receipt::Acknowledged(receipt));
            }
        }
    }

    pub fn on_nack(&mut self, nack: &Acknowledge) -> Vec<Receipt> {
        let sequence_numbers = self.covered_sequence_numbers(nack);
        debug!("NACK for {} datagrams", sequence_numbers.len());
        self.recover(sequence_numbers)
    }

    /// Re-queues all tracked frames whose datagram was not acknowledged within the resend timeout
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<Receipt> {
        let timeout = self.resend_timeout.current();
        let expired = self.recovery.iter()
            .filter(|(_, sent)| now.saturating_duration_since(sent.sent_at) >= timeout)
            .map(|(&sequence_number, _)| sequence_number)
            .collect::<Vec<_>>();

        if expired.is_empty() {
            return Vec::new();
        }

        debug!("{} datagrams unacknowledged after {:?}", expired.len(), timeout);
        self.resend_timeout.on_timeout();
        self.recover(expired)
    }

    fn covered_sequence_numbers(&self, ack: &Acknowledge) -> Vec<u32> {
        ack.ranges.iter()
            .flat_map(|range| self.recovery.range(range.start..=range.end).map(|(&n, _)| n))
            .collect()
    }

    /// Reliable frames go back to the front of the queue in their original order, unreliable ones
    ///  are reported as lost
    fn recover(&mut self, sequence_numbers: Vec<u32>) -> Vec<Receipt> {
        let mut receipts = Vec::new();
        let mut resend = Vec::new();

        for sequence_number in sequence_numbers {
            let Some(sent) = self.recovery.remove(&sequence_number) else {
                continue;
            };
            for mut queued in sent.frames {
                if queued.frame.reliability.is_reliable() {
                    queued.resent = true;
                    resend.push(queued);
                }
                else if let Some(receipt) = queued.receipt {
                    if self.outstanding_receipts.remove(&receipt).is_some() {
                        receipts.push(Receipt::Lost(receipt));
                    }
                }
            }
        }

        trace!("re-queueing {} frames", resend.len());
        for queued in resend.into_iter().rev() {
            self.queue.push_front(queued);
        }
        receipts
    }
}
