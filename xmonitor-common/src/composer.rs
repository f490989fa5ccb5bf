//! Reply payload composition.

use crate::buffer::{OutOfBounds, PacketBuf};
use crate::registry::{RegistryEntry, MAX_REGISTRY_ENTRIES};

/// A block that would run past the end of the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Overflow {
    pub cursor: usize,
    pub block_len: usize,
    pub end: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComposeError {
    Overflow(Overflow),
    Store(OutOfBounds),
}

/// Appends metric blocks to a frame, right after the UDP header.
///
/// The frame is never grown: the probe's own size is the reply's capacity,
/// and every append is checked against it.
#[derive(Clone, Copy, Debug)]
pub struct Composer {
    start: usize,
    cursor: usize,
    end: usize,
}

impl Composer {
    pub fn new(payload_offset: usize, frame_len: usize) -> Self {
        Self {
            start: payload_offset,
            cursor: payload_offset,
            end: frame_len,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Payload bytes appended so far.
    pub fn written(&self) -> usize {
        self.cursor - self.start
    }

    #[inline(always)]
    fn check(&self, cursor: usize, block_len: usize) -> Result<usize, Overflow> {
        match cursor.checked_add(block_len) {
            Some(next) if next <= self.end => Ok(next),
            _ => Err(Overflow {
                cursor,
                block_len,
                end: self.end,
            }),
        }
    }

    /// Check that every entry fits before any payload byte is written.
    ///
    /// Reports the first entry that would cross the end of the frame.
    #[inline(always)]
    pub fn preflight(&self, entries: &[RegistryEntry]) -> Result<(), Overflow> {
        let mut cursor = self.cursor;
        for entry in entries.iter().take(MAX_REGISTRY_ENTRIES) {
            cursor = self.check(cursor, entry.block_len as usize)?;
        }
        Ok(())
    }

    /// Write `block` at the cursor and advance past it.
    #[inline(always)]
    pub fn append<P: PacketBuf + ?Sized>(
        &mut self,
        pkt: &mut P,
        block: &[u8],
    ) -> Result<(), ComposeError> {
        let next = self
            .check(self.cursor, block.len())
            .map_err(ComposeError::Overflow)?;
        pkt.store(self.cursor, block).map_err(ComposeError::Store)?;
        self.cursor = next;
        Ok(())
    }
}

/// Splits a reply payload back into its blocks, following the registry the
/// responder was deployed with.
///
/// Yields `(entry, bytes)` in registry order and stops at the first block
/// the payload is too short to hold, which is where a truncated reply ends.
pub struct BlockReader<'a> {
    payload: &'a [u8],
    entries: core::slice::Iter<'a, RegistryEntry>,
    offset: usize,
}

impl<'a> BlockReader<'a> {
    pub fn new(payload: &'a [u8], entries: &'a [RegistryEntry]) -> Self {
        Self {
            payload,
            entries: entries.iter(),
            offset: 0,
        }
    }

    /// Payload bytes not consumed by any block so far.
    pub fn rest(&self) -> &'a [u8] {
        &self.payload[self.offset..]
    }
}

impl<'a> Iterator for BlockReader<'a> {
    type Item = (RegistryEntry, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.as_slice().first()?;
        let len = entry.block_len as usize;
        let block = self.payload.get(self.offset..self.offset.checked_add(len)?)?;
        self.entries.next();
        self.offset += len;
        Some((*entry, block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_in_order_after_payload_offset() {
        let mut frame = vec![0u8; 50];
        let mut composer = Composer::new(42, frame.len());

        composer.append(&mut frame[..], &[1, 2, 3]).unwrap();
        composer.append(&mut frame[..], &[4, 5]).unwrap();

        assert_eq!(composer.cursor(), 47);
        assert_eq!(composer.written(), 5);
        assert_eq!(&frame[42..48], &[1, 2, 3, 4, 5, 0]);
    }

    #[test]
    fn exact_fit_is_accepted() {
        let mut frame = vec![0u8; 42 + 64];
        let mut composer = Composer::new(42, frame.len());
        assert_eq!(composer.preflight(&[RegistryEntry::indirect(11211, 64)]), Ok(()));
        composer.append(&mut frame[..], &[7; 64]).unwrap();
        assert_eq!(composer.cursor(), frame.len());
    }

    #[test]
    fn one_byte_over_is_refused_without_writing() {
        let mut frame = vec![0u8; 42 + 63];
        let mut composer = Composer::new(42, frame.len());

        assert_eq!(
            composer.append(&mut frame[..], &[7; 64]),
            Err(ComposeError::Overflow(Overflow {
                cursor: 42,
                block_len: 64,
                end: 105
            }))
        );
        assert!(frame.iter().all(|b| *b == 0));
        assert_eq!(composer.written(), 0);
    }

    #[test]
    fn preflight_checks_the_cumulative_length() {
        let entries = [
            RegistryEntry::indirect(11211, 64),
            RegistryEntry::indirect(11212, 64),
        ];

        assert!(Composer::new(42, 42 + 128).preflight(&entries).is_ok());
        assert_eq!(
            Composer::new(42, 42 + 127).preflight(&entries),
            Err(Overflow {
                cursor: 106,
                block_len: 64,
                end: 169
            })
        );
    }

    #[test]
    fn preflight_survives_absurd_lengths() {
        let entries = [
            RegistryEntry::indirect(1, u32::MAX),
            RegistryEntry::indirect(2, u32::MAX),
        ];
        assert!(Composer::new(42, 1500).preflight(&entries).is_err());
    }

    #[test]
    fn reader_splits_payload_by_registry() {
        let entries = [
            RegistryEntry::indirect(11211, 2),
            RegistryEntry::indirect(11212, 3),
        ];
        let payload = [1, 1, 2, 2, 2, 9];

        let mut reader = BlockReader::new(&payload, &entries);
        assert_eq!(reader.next(), Some((entries[0], &[1u8, 1][..])));
        assert_eq!(reader.next(), Some((entries[1], &[2u8, 2, 2][..])));
        assert_eq!(reader.next(), None);
        assert_eq!(reader.rest(), &[9]);
    }

    #[test]
    fn reader_stops_at_a_short_block() {
        let entries = [
            RegistryEntry::indirect(11211, 2),
            RegistryEntry::indirect(11212, 3),
        ];
        let payload = [1, 1, 2];

        let blocks: Vec<_> = BlockReader::new(&payload, &entries).collect();
        assert_eq!(blocks.len(), 1);
    }
}
