//! Send-side batching and receive-side unravelling.
//!
//! A batched message carries the packet key once, followed by any number of
//! length-prefixed payload fragments:
//!
//! ```text
//! [key(1)] ([len(varint)] [fragment])*
//! ```

use crate::core::varint::{write_varint, Reader};
use crate::error::{ProtocolError, Result};

/// Accumulator for one batched packet on one connection.
#[derive(Debug, Clone)]
pub struct Batcher {
    key: u8,
    max_batch_size: u32,
    buffer: Vec<u8>,
    count: u32,
}

impl Batcher {
    pub fn new(key: u8, max_batch_size: u32) -> Self {
        Self {
            key,
            max_batch_size,
            buffer: vec![key],
            count: 0,
        }
    }

    pub fn key(&self) -> u8 {
        self.key
    }

    /// Fragments waiting for the next flush
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Add one encoded payload.
    ///
    /// If the accumulator is already at `max_batch_size`, the payload is
    /// returned immediately as its own single-fragment message and the
    /// accumulator is left alone.
    pub fn batch_packet(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.max_batch_size > 0 && self.count >= self.max_batch_size {
            let mut message = Vec::with_capacity(payload.len() + 4);
            message.push(self.key);
            write_varint(&mut message, payload.len() as u64)?;
            message.extend_from_slice(payload);
            return Ok(Some(message));
        }
        write_varint(&mut self.buffer, payload.len() as u64)?;
        self.buffer.extend_from_slice(payload);
        self.count += 1;
        Ok(None)
    }

    /// Take the accumulated message, if any. Never yields an empty batch.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.count == 0 {
            return None;
        }
        self.count = 0;
        Some(std::mem::replace(&mut self.buffer, vec![self.key]))
    }

    /// Drop everything pending.
    pub fn clear(&mut self) {
        self.buffer.truncate(1);
        self.count = 0;
    }
}

/// Split a batched message body (key already stripped) into its fragments.
///
/// A fragment reaching past the end, an empty body, or more fragments than
/// `max_batch_size` (when non-zero) is [`ProtocolError::BatchCorrupt`].
pub fn unravel_batch<'a>(tag: &str, body: &'a [u8], max_batch_size: u32) -> Result<Vec<&'a [u8]>> {
    let corrupt = |reason: String| ProtocolError::BatchCorrupt {
        tag: tag.to_string(),
        reason,
    };
    if body.is_empty() {
        return Err(corrupt("empty batch".into()));
    }

    let mut reader = Reader::new(body);
    let mut fragments = Vec::new();
    while !reader.is_empty() {
        if max_batch_size > 0 && fragments.len() >= max_batch_size as usize {
            return Err(corrupt(format!(
                "more than {max_batch_size} fragments"
            )));
        }
        let len = reader
            .read_len()
            .map_err(|e| corrupt(format!("bad fragment length: {e}")))?;
        let fragment = reader.read_bytes(len).map_err(|_| {
            corrupt(format!(
                "fragment of {len} bytes overruns batch at offset {}",
                reader.position()
            ))
        })?;
        fragments.push(fragment);
    }
    Ok(fragments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_payloads_one_message() {
        let mut batcher = Batcher::new(4, 0);
        assert!(batcher.batch_packet(b"a").unwrap().is_none());
        assert!(batcher.batch_packet(b"bcd").unwrap().is_none());
        assert!(batcher.batch_packet(b"").unwrap().is_none());
        assert_eq!(batcher.len(), 3);

        let message = batcher.flush().unwrap();
        assert_eq!(message, vec![4, 1, b'a', 3, b'b', b'c', b'd', 0]);
        assert!(batcher.is_empty());
        assert!(batcher.flush().is_none());

        let fragments = unravel_batch("t", &message[1..], 0).unwrap();
        assert_eq!(fragments, vec![&b"a"[..], &b"bcd"[..], &b""[..]]);
    }

    #[test]
    fn test_overflow_sent_alone() {
        let mut batcher = Batcher::new(2, 2);
        assert!(batcher.batch_packet(b"x").unwrap().is_none());
        assert!(batcher.batch_packet(b"y").unwrap().is_none());
        let single = batcher.batch_packet(b"z").unwrap().unwrap();
        assert_eq!(single, vec![2, 1, b'z']);
        assert_eq!(batcher.len(), 2);
        assert_eq!(batcher.flush().unwrap(), vec![2, 1, b'x', 1, b'y']);
    }

    #[test]
    fn test_corrupt_batches() {
        assert!(matches!(
            unravel_batch("t", &[], 0),
            Err(ProtocolError::BatchCorrupt { .. })
        ));
        assert!(matches!(
            unravel_batch("t", &[5, 1, 2], 0),
            Err(ProtocolError::BatchCorrupt { .. })
        ));
        assert!(matches!(
            unravel_batch("t", &[1, 1, 1, 2, 1, 3], 2),
            Err(ProtocolError::BatchCorrupt { .. })
        ));
        assert_eq!(unravel_batch("t", &[1, 1, 1, 2], 2).unwrap().len(), 2);
    }

    #[test]
    fn test_clear_drops_pending() {
        let mut batcher = Batcher::new(9, 0);
        batcher.batch_packet(b"abc").unwrap();
        batcher.clear();
        assert!(batcher.flush().is_none());
        batcher.batch_packet(b"d").unwrap();
        assert_eq!(batcher.flush().unwrap(), vec![9, 1, b'd']);
    }
}
