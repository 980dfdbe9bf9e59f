//! Byte-producing collaborators that feed a [`StreamBuffer`](crate::StreamBuffer).
//!
//! A [`ByteSource`] is only ever called while the stream buffer is
//! unpinned. Both operations report end of stream by returning 0.

extern crate alloc;

use alloc::boxed::Box;

use crate::error::{Error, Result};

/// Capability set of the external byte source.
pub trait ByteSource {
    /// Read up to `buf.len()` bytes into `buf`. Returns the number of
    /// bytes produced; 0 means the stream is exhausted.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Discard up to `count` bytes. Returns the number skipped; 0 means
    /// the stream is exhausted.
    fn skip(&mut self, count: u64) -> Result<u64>;
}

impl<S: ByteSource + ?Sized> ByteSource for &mut S {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn skip(&mut self, count: u64) -> Result<u64> {
        (**self).skip(count)
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn skip(&mut self, count: u64) -> Result<u64> {
        (**self).skip(count)
    }
}

// in-memory

/// Reads from an in-memory slice.
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet handed out.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

impl ByteSource for SliceSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.remaining());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn skip(&mut self, count: u64) -> Result<u64> {
        let n = (self.remaining() as u64).min(count);
        self.pos += n as usize;
        Ok(n)
    }
}

// random-access reader (block device, container entry)

/// Reads a byte range through a positional read closure.
///
/// `read_fn(offset, buf)` reads bytes at the given absolute offset and
/// returns how many it produced. The source never reads past `end`.
pub struct ChunkSource<F> {
    read_fn: F,
    offset: u32, // absolute offset of next byte to fetch
    end: u32,    // end-of-data offset (exclusive)
}

impl<F: FnMut(u32, &mut [u8]) -> core::result::Result<usize, &'static str>> ChunkSource<F> {
    pub fn new(read_fn: F, start: u32, size: u32) -> Self {
        Self {
            read_fn,
            offset: start,
            end: start.saturating_add(size),
        }
    }

    /// Absolute offset of the next byte the source will produce.
    pub fn position(&self) -> u32 {
        self.offset
    }
}

impl<F: FnMut(u32, &mut [u8]) -> core::result::Result<usize, &'static str>> ByteSource
    for ChunkSource<F>
{
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.offset >= self.end {
            return Ok(0);
        }
        let want = buf.len().min((self.end - self.offset) as usize);
        let n = (self.read_fn)(self.offset, &mut buf[..want]).map_err(Error::Source)?;
        let n = n.min(want);
        self.offset += n as u32;
        Ok(n)
    }

    fn skip(&mut self, count: u64) -> Result<u64> {
        let n = count.min((self.end - self.offset) as u64);
        self.offset += n as u32;
        Ok(n)
    }
}

// std::io adapter

/// Adapts any [`std::io::Read`].
#[cfg(feature = "std")]
pub struct IoSource<R> {
    inner: R,
}

#[cfg(feature = "std")]
impl<R: std::io::Read> IoSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(feature = "std")]
impl<R: std::io::Read> ByteSource for IoSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("jpeg: read failed: {}", e);
                    return Err(Error::Source("read failed"));
                }
            }
        }
    }

    fn skip(&mut self, count: u64) -> Result<u64> {
        let mut limited = std::io::Read::take(&mut self.inner, count);
        std::io::copy(&mut limited, &mut std::io::sink()).map_err(|e| {
            log::warn!("jpeg: skip failed: {}", e);
            Error::Source("skip failed")
        })
    }
}
