//! Bounded byte buffers for codec output.
//!
//! `Buf<N>` is the canonical buffer type for protocol output queues. It is
//! backed by `heapless::Vec<u8, N>` so a codec can never grow past the size
//! it was declared with; overflow surfaces as `BufferTooSmall`.

use crate::error::Error;
use crate::varint;

pub type Buf<const N: usize> = heapless::Vec<u8, N>;

/// Common operations on byte buffers.
pub trait BufExt {
    fn buf_len(&self) -> usize;
    fn buf_is_empty(&self) -> bool { self.buf_len() == 0 }
    fn buf_clear(&mut self);
    fn buf_truncate(&mut self, len: usize);
    fn buf_extend_from_slice(&mut self, data: &[u8]) -> Result<(), Error>;
    fn buf_push(&mut self, byte: u8) -> Result<(), Error>;
    fn buf_as_slice(&self) -> &[u8];
    fn buf_as_mut_slice(&mut self) -> &mut [u8];
    /// Drain `n` bytes from the front by shifting remaining data forward.
    fn buf_drain_front(&mut self, n: usize);
    /// Free space left before the buffer refuses writes.
    fn buf_remaining(&self) -> usize;

    /// Append a QUIC variable-length integer.
    fn buf_put_varint(&mut self, value: u64) -> Result<(), Error> {
        let mut tmp = [0u8; 8];
        let n = varint::encode_varint(value, &mut tmp)?;
        self.buf_extend_from_slice(&tmp[..n])
    }
}

impl<const N: usize> BufExt for heapless::Vec<u8, N> {
    fn buf_len(&self) -> usize { self.len() }
    fn buf_clear(&mut self) { self.clear(); }
    fn buf_truncate(&mut self, len: usize) { self.truncate(len); }
    fn buf_extend_from_slice(&mut self, data: &[u8]) -> Result<(), Error> {
        self.extend_from_slice(data).map_err(|_| Error::BufferTooSmall {
            needed: self.len() + data.len(),
        })
    }
    fn buf_push(&mut self, byte: u8) -> Result<(), Error> {
        self.push(byte).map_err(|_| Error::BufferTooSmall {
            needed: self.len() + 1,
        })
    }
    fn buf_as_slice(&self) -> &[u8] { self }
    fn buf_as_mut_slice(&mut self) -> &mut [u8] { self }
    fn buf_drain_front(&mut self, n: usize) {
        let n = n.min(self.len());
        self.copy_within(n.., 0);
        self.truncate(self.len() - n);
    }
    fn buf_remaining(&self) -> usize { N - self.len() }
}

impl BufExt for Vec<u8> {
    fn buf_len(&self) -> usize { self.len() }
    fn buf_clear(&mut self) { self.clear(); }
    fn buf_truncate(&mut self, len: usize) { self.truncate(len); }
    fn buf_extend_from_slice(&mut self, data: &[u8]) -> Result<(), Error> {
        self.extend_from_slice(data);
        Ok(())
    }
    fn buf_push(&mut self, byte: u8) -> Result<(), Error> {
        self.push(byte);
        Ok(())
    }
    fn buf_as_slice(&self) -> &[u8] { self }
    fn buf_as_mut_slice(&mut self) -> &mut [u8] { self }
    fn buf_drain_front(&mut self, n: usize) {
        self.drain(..n.min(self.len()));
    }
    fn buf_remaining(&self) -> usize { usize::MAX - self.len() }
}
