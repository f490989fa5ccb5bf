//! Byte-addressed access to a received frame.

/// A load or store that would run past the end of the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfBounds {
    pub offset: usize,
    pub len: usize,
}

/// The frame as seen by the pipeline.
///
/// In the XDP program this is backed by `bpf_xdp_load_bytes` /
/// `bpf_xdp_store_bytes`, so multi-buffer frames work; on the host it is a
/// plain byte slice.
pub trait PacketBuf {
    /// Logical end of the frame; nothing may be written at or past it.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the frame.
    fn load(&self, offset: usize, dst: &mut [u8]) -> Result<(), OutOfBounds>;

    /// Copy `src` into the frame starting at `offset`.
    fn store(&mut self, offset: usize, src: &[u8]) -> Result<(), OutOfBounds>;
}

#[inline(always)]
fn span(offset: usize, len: usize, end: usize) -> Result<core::ops::Range<usize>, OutOfBounds> {
    match offset.checked_add(len) {
        Some(stop) if stop <= end => Ok(offset..stop),
        _ => Err(OutOfBounds { offset, len }),
    }
}

impl PacketBuf for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn load(&self, offset: usize, dst: &mut [u8]) -> Result<(), OutOfBounds> {
        let range = span(offset, dst.len(), <[u8]>::len(self))?;
        dst.copy_from_slice(&self[range]);
        Ok(())
    }

    fn store(&mut self, offset: usize, src: &[u8]) -> Result<(), OutOfBounds> {
        let range = span(offset, src.len(), <[u8]>::len(self))?;
        self[range].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_load_and_store_stay_in_bounds() {
        let mut frame = [0u8; 8];
        let buf: &mut [u8] = &mut frame;

        buf.store(4, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 2];
        buf.load(5, &mut out).unwrap();
        assert_eq!(out, [2, 3]);

        assert_eq!(
            buf.store(5, &[9, 9, 9, 9]),
            Err(OutOfBounds { offset: 5, len: 4 })
        );
        assert_eq!(frame, [0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn offset_overflow_is_out_of_bounds() {
        let frame = [0u8; 4];
        let mut out = [0u8; 2];
        assert!(frame[..].load(usize::MAX, &mut out).is_err());
    }
}
