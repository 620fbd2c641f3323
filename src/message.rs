//! The wire-independent message model delivered to and acknowledged by the application.

use std::collections::HashMap;

use crate::batch::BatchAcker;
use crate::compression::CompressionType;

/// Whether a [`MessageId`] names a standalone message or one sub-message of a batch.
///
/// The batch acker reference is not part of identity: two ids with the same
/// `(ledger_id, entry_id, partition_index)` and the same batch index (or both
/// `Individual`) are equal regardless of which `BatchAcker` instance they carry.
#[derive(Debug, Clone)]
pub enum MessageIdType {
    Individual,
    Cumulative { batch_index: u32, acker: BatchAcker },
}

fn batch_index_of(kind: &MessageIdType) -> Option<u32> {
    match kind {
        MessageIdType::Individual => None,
        MessageIdType::Cumulative { batch_index, .. } => Some(*batch_index),
    }
}

/// Identifies one logical message on a partition.
#[derive(Debug, Clone)]
pub struct MessageId {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub partition_index: i32,
    pub topic_name: String,
    pub id_type: MessageIdType,
}

impl MessageId {
    pub fn individual(ledger_id: u64, entry_id: u64, partition_index: i32, topic_name: impl Into<String>) -> Self {
        Self {
            ledger_id,
            entry_id,
            partition_index,
            topic_name: topic_name.into(),
            id_type: MessageIdType::Individual,
        }
    }

    pub fn batch_index(&self) -> Option<u32> {
        batch_index_of(&self.id_type)
    }

    pub fn acker(&self) -> Option<&BatchAcker> {
        match &self.id_type {
            MessageIdType::Individual => None,
            MessageIdType::Cumulative { acker, .. } => Some(acker),
        }
    }
}

impl PartialEq for MessageId {
    fn eq(&self, other: &Self) -> bool {
        self.ledger_id == other.ledger_id
            && self.entry_id == other.entry_id
            && self.partition_index == other.partition_index
            && batch_index_of(&self.id_type) == batch_index_of(&other.id_type)
    }
}
impl Eq for MessageId {}

impl std::hash::Hash for MessageId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ledger_id.hash(state);
        self.entry_id.hash(state);
        self.partition_index.hash(state);
        batch_index_of(&self.id_type).hash(state);
    }
}

/// Metadata describing the outer broker frame a message arrived in.
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub num_messages: i32,
    pub compression_type: CompressionType,
    pub uncompressed_size: u32,
    pub has_num_messages_in_batch: bool,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            num_messages: 1,
            compression_type: CompressionType::None,
            uncompressed_size: 0,
            has_num_messages_in_batch: false,
        }
    }
}

/// A message delivered to, or about to be delivered to, the application.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: MessageId,
    pub metadata: MessageMetadata,
    pub payload: Vec<u8>,
    pub properties: HashMap<String, String>,
    pub message_key: Option<String>,
}

/// A single frame as it arrives from the connection, before decompression or batch
/// splitting. This is the unit the wire codec (out of scope for this crate) is assumed
/// to hand to the consumer.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub topic_name: String,
    pub metadata: MessageMetadata,
    /// Possibly-compressed payload; for a batch this is the concatenation of
    /// per-sub-message (metadata, payload) tuples once decompressed.
    pub payload: Vec<u8>,
    pub message_key: Option<String>,
    pub properties: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn individual_ids_compare_by_ledger_entry_partition() {
        let a = MessageId::individual(1, 2, 0, "t");
        let b = MessageId::individual(1, 2, 0, "t");
        let c = MessageId::individual(1, 3, 0, "t");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn batch_acker_identity_is_not_part_of_equality() {
        let acker_a = BatchAcker::new(2);
        let acker_b = BatchAcker::new(2);
        let a = MessageId {
            id_type: MessageIdType::Cumulative { batch_index: 0, acker: acker_a },
            ..MessageId::individual(5, 6, 0, "t")
        };
        let b = MessageId {
            id_type: MessageIdType::Cumulative { batch_index: 0, acker: acker_b },
            ..MessageId::individual(5, 6, 0, "t")
        };
        assert_eq!(a, b, "different BatchAcker instances must not affect identity");
    }

    #[test]
    fn different_batch_index_is_not_equal() {
        let acker = BatchAcker::new(2);
        let a = MessageId {
            id_type: MessageIdType::Cumulative { batch_index: 0, acker: acker.clone() },
            ..MessageId::individual(5, 6, 0, "t")
        };
        let b = MessageId {
            id_type: MessageIdType::Cumulative { batch_index: 1, acker },
            ..MessageId::individual(5, 6, 0, "t")
        };
        assert_ne!(a, b);
    }
}
