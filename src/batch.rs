//! Per-batch acknowledgment bookkeeping.
//!
//! A single broker frame can carry many logical messages (a "batch"). The broker only
//! understands acks at the frame granularity, so the client must track, per batch, which
//! of its sub-messages have been acked locally and only forward an ack for the whole
//! batch once every sub-message has been accounted for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::ConsumerError;
use crate::message::{Message, MessageId, MessageIdType, MessageMetadata};

/// Shared, mutable state backing every [`crate::message::MessageId`] that belongs to the
/// same batch. Cloning a `BatchAcker` is cheap; all clones refer to the same bitset.
#[derive(Debug, Clone)]
pub struct BatchAcker {
    inner: std::sync::Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    batch_size: usize,
    /// `bits[i]` is `true` while sub-message `i` is still outstanding.
    bits: Mutex<Vec<bool>>,
    outstanding: std::sync::atomic::AtomicUsize,
    prev_batch_cumulatively_acked: AtomicBool,
}

impl BatchAcker {
    pub fn new(batch_size: usize) -> Self {
        Self {
            inner: std::sync::Arc::new(Inner {
                batch_size,
                bits: Mutex::new(vec![true; batch_size]),
                outstanding: std::sync::atomic::AtomicUsize::new(batch_size),
                prev_batch_cumulatively_acked: AtomicBool::new(false),
            }),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    pub fn outstanding_acks(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Clears bit `index`. Returns `true` iff this was the last outstanding bit.
    pub fn ack_individual(&self, index: usize) -> bool {
        let mut bits = self.inner.bits.lock();
        if index >= bits.len() || !bits[index] {
            return self.inner.outstanding.load(Ordering::Acquire) == 0;
        }
        bits[index] = false;
        let remaining = self.inner.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
        remaining == 0
    }

    /// Clears bits `0..=index`. Returns `true` iff this cleared the last outstanding bit.
    pub fn ack_group(&self, index: usize) -> bool {
        let mut bits = self.inner.bits.lock();
        let upto = (index + 1).min(bits.len());
        let mut cleared = 0usize;
        for bit in bits.iter_mut().take(upto) {
            if *bit {
                *bit = false;
                cleared += 1;
            }
        }
        drop(bits);
        if cleared == 0 {
            return self.inner.outstanding.load(Ordering::Acquire) == 0;
        }
        let remaining = self.inner.outstanding.fetch_sub(cleared, Ordering::AcqRel) - cleared;
        remaining == 0
    }

    pub fn prev_batch_cumulatively_acked(&self) -> bool {
        self.inner.prev_batch_cumulatively_acked.load(Ordering::Acquire)
    }

    pub fn set_prev_batch_cumulatively_acked(&self, value: bool) {
        self.inner.prev_batch_cumulatively_acked.store(value, Ordering::Release);
    }
}

/// Reads a `u32` length-prefix followed by that many bytes, advancing `cursor`.
fn read_bytes<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8], ConsumerError> {
    if cursor.len() < 4 {
        return Err(ConsumerError::BatchDecode("truncated length prefix".into()));
    }
    let (len_bytes, rest) = cursor.split_at(4);
    let len = u32::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
    if rest.len() < len {
        return Err(ConsumerError::BatchDecode("truncated field".into()));
    }
    let (field, rest) = rest.split_at(len);
    *cursor = rest;
    Ok(field)
}

fn read_optional_string(cursor: &mut &[u8]) -> Result<Option<String>, ConsumerError> {
    if cursor.is_empty() {
        return Err(ConsumerError::BatchDecode("truncated presence flag".into()));
    }
    let present = cursor[0] != 0;
    *cursor = &cursor[1..];
    if !present {
        return Ok(None);
    }
    let bytes = read_bytes(cursor)?;
    Ok(Some(String::from_utf8(bytes.to_vec()).map_err(|e| ConsumerError::BatchDecode(e.to_string()))?))
}

fn read_properties(cursor: &mut &[u8]) -> Result<HashMap<String, String>, ConsumerError> {
    if cursor.len() < 4 {
        return Err(ConsumerError::BatchDecode("truncated property count".into()));
    }
    let (count_bytes, rest) = cursor.split_at(4);
    let count = u32::from_le_bytes(count_bytes.try_into().unwrap());
    *cursor = rest;
    let mut properties = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key = String::from_utf8(read_bytes(cursor)?.to_vec()).map_err(|e| ConsumerError::BatchDecode(e.to_string()))?;
        let value = String::from_utf8(read_bytes(cursor)?.to_vec()).map_err(|e| ConsumerError::BatchDecode(e.to_string()))?;
        properties.insert(key, value);
    }
    Ok(properties)
}

/// Splits a decompressed batch payload into its `num_messages` logical sub-messages.
/// Each tuple in the payload is, in order: an optional message key, a
/// properties map, and a length-prefixed payload, every length a little-endian `u32`.
///
/// Every sub-message id shares the same fresh [`BatchAcker`] and carries the outer
/// frame's ledger/entry/partition.
pub fn split_batch(
    ledger_id: u64,
    entry_id: u64,
    partition_index: i32,
    topic_name: &str,
    decompressed: &[u8],
    num_messages: usize,
) -> Result<Vec<Message>, ConsumerError> {
    let acker = BatchAcker::new(num_messages);
    let mut cursor = decompressed;
    let mut messages = Vec::with_capacity(num_messages);
    for batch_index in 0..num_messages {
        let message_key = read_optional_string(&mut cursor)?;
        let properties = read_properties(&mut cursor)?;
        let payload = read_bytes(&mut cursor)?.to_vec();
        messages.push(Message {
            message_id: MessageId {
                ledger_id,
                entry_id,
                partition_index,
                topic_name: topic_name.to_string(),
                id_type: MessageIdType::Cumulative {
                    batch_index: batch_index as u32,
                    acker: acker.clone(),
                },
            },
            metadata: MessageMetadata {
                num_messages: 1,
                compression_type: crate::compression::CompressionType::None,
                uncompressed_size: payload.len() as u32,
                has_num_messages_in_batch: true,
            },
            payload,
            properties,
            message_key,
        });
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_tuple(key: Option<&str>, properties: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        match key {
            Some(k) => {
                out.push(1);
                out.extend((k.len() as u32).to_le_bytes());
                out.extend(k.as_bytes());
            }
            None => out.push(0),
        }
        out.extend((properties.len() as u32).to_le_bytes());
        for (k, v) in properties {
            out.extend((k.len() as u32).to_le_bytes());
            out.extend(k.as_bytes());
            out.extend((v.len() as u32).to_le_bytes());
            out.extend(v.as_bytes());
        }
        out.extend((payload.len() as u32).to_le_bytes());
        out.extend(payload);
        out
    }

    #[test]
    fn splits_three_sub_messages_preserving_order_and_sharing_one_acker() {
        let mut payload = Vec::new();
        payload.extend(encode_tuple(Some("k0"), &[("a", "1")], b"one"));
        payload.extend(encode_tuple(None, &[], b"two"));
        payload.extend(encode_tuple(Some("k2"), &[], b"three"));

        let messages = split_batch(1, 2, 0, "t", &payload, 3).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].payload, b"one");
        assert_eq!(messages[0].message_key.as_deref(), Some("k0"));
        assert_eq!(messages[1].payload, b"two");
        assert_eq!(messages[1].message_key, None);
        assert_eq!(messages[2].payload, b"three");
        assert_eq!(messages[0].message_id.batch_index(), Some(0));
        assert_eq!(messages[2].message_id.batch_index(), Some(2));

        let acker0 = messages[0].message_id.acker().unwrap();
        let acker2 = messages[2].message_id.acker().unwrap();
        assert_eq!(acker0.outstanding_acks(), 3);
        assert!(acker2.ack_individual(2));
        assert_eq!(acker0.outstanding_acks(), 2, "all sub-messages share one acker");
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let err = split_batch(1, 1, 0, "t", &[0, 0], 1).unwrap_err();
        assert!(matches!(err, ConsumerError::BatchDecode(_)));
    }

    #[test]
    fn ack_individual_out_of_order_reaches_zero_exactly_once() {
        let acker = BatchAcker::new(3);
        assert_eq!(acker.outstanding_acks(), 3);
        assert!(!acker.ack_individual(1));
        assert!(!acker.ack_individual(2));
        assert_eq!(acker.outstanding_acks(), 1);
        assert!(acker.ack_individual(0));
        assert_eq!(acker.outstanding_acks(), 0);
    }

    #[test]
    fn double_ack_of_same_index_is_idempotent() {
        let acker = BatchAcker::new(2);
        assert!(!acker.ack_individual(0));
        assert!(!acker.ack_individual(0));
        assert_eq!(acker.outstanding_acks(), 1);
    }

    #[test]
    fn ack_group_clears_prefix() {
        let acker = BatchAcker::new(5);
        assert!(!acker.ack_group(2));
        assert_eq!(acker.outstanding_acks(), 2);
        assert!(acker.ack_group(4));
        assert_eq!(acker.outstanding_acks(), 0);
    }

    #[test]
    fn prev_batch_flag_round_trips() {
        let acker = BatchAcker::new(1);
        assert!(!acker.prev_batch_cumulatively_acked());
        acker.set_prev_batch_cumulatively_acked(true);
        assert!(acker.prev_batch_cumulatively_acked());
    }
}
