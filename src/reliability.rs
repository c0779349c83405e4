use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Delivery guarantee of a single frame. The numeric values are the 3 bit tags on the wire.
///
/// * *reliable* frames carry a message index, are acknowledged and re-sent until acknowledged
/// * *ordered* frames are held back by the receiver until all predecessors on their channel are
///    delivered
/// * *sequenced* frames are dropped by the receiver if a newer frame on their channel was already
///    delivered
/// * *with ack receipt* frames report back to the sender whether they were acknowledged or lost
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Reliability {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
    UnreliableWithAckReceipt = 5,
    ReliableWithAckReceipt = 6,
    ReliableOrderedWithAckReceipt = 7,
}

impl Reliability {
    pub const ALL: [Reliability; 8] = [
        Reliability::Unreliable,
        Reliability::UnreliableSequenced,
        Reliability::Reliable,
        Reliability::ReliableOrdered,
        Reliability::ReliableSequenced,
        Reliability::UnreliableWithAckReceipt,
        Reliability::ReliableWithAckReceipt,
        Reliability::ReliableOrderedWithAckReceipt,
    ];

    pub fn is_reliable(self) -> bool {
        matches!(self,
            Reliability::Reliable
            | Reliability::ReliableOrdered
            | Reliability::ReliableSequenced
            | Reliability::ReliableWithAckReceipt
            | Reliability::ReliableOrderedWithAckReceipt)
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, Reliability::ReliableOrdered | Reliability::ReliableOrderedWithAckReceipt)
    }

    pub fn is_sequenced(self) -> bool {
        matches!(self, Reliability::UnreliableSequenced | Reliability::ReliableSequenced)
    }

    pub fn requires_ack_receipt(self) -> bool {
        matches!(self,
            Reliability::UnreliableWithAckReceipt
            | Reliability::ReliableWithAckReceipt
            | Reliability::ReliableOrderedWithAckReceipt)
    }

    /// whether frames with this reliability carry an order index and channel
    pub fn has_order_fields(self) -> bool {
        self.is_ordered() || self.is_sequenced()
    }

    /// whether sent frames are kept in the resend buffer until acknowledged
    pub fn is_tracked(self) -> bool {
        self.is_reliable() || self.requires_ack_receipt()
    }

    /// Fragments of a split message must all arrive for the message to be usable, so they are
    ///  sent with the reliable counterpart of an unreliable reliability
    pub fn for_split(self) -> Reliability {
        match self {
            Reliability::Unreliable => Reliability::Reliable,
            Reliability::UnreliableSequenced => Reliability::ReliableSequenced,
            Reliability::UnreliableWithAckReceipt => Reliability::ReliableWithAckReceipt,
            other => other,
        }
    }
}
