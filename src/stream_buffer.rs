//! Fixed-size input buffer shared between a [`ByteSource`] and the
//! decompression engine.
//!
//! The buffer is "pinned" while the engine reads from it and must be
//! unpinned around every call into the source or the listener. Unpinning
//! records where the engine's read cursor was, so the next pin resumes
//! from the same logical position without copying anything.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::source::ByteSource;

/// Capacity of the stream buffer. 4K is libjpeg's default
/// "efficiently freadable size"; the buffer persists across images.
pub const STREAMBUF_SIZE: usize = 4096;

/// Adapter between a byte source and the engine's contiguous view.
pub struct StreamBuffer<'s> {
    source: Option<Box<dyn ByteSource + 's>>,
    // None once destroyed
    storage: Option<Vec<u8>>,
    pinned: bool,
    // read position to restore on the next pin; None = no data worth keeping
    offset: Option<usize>,
    // bytes left unconsumed at term_source, restored by init_source
    pushback: usize,
    suspendable: bool,
    remaining_skip: u64,
    pins: u32,
    unpins: u32,
}

impl<'s> StreamBuffer<'s> {
    /// Allocate a buffer of [`STREAMBUF_SIZE`] bytes with no source bound.
    pub fn new() -> Result<Self> {
        Self::with_capacity(STREAMBUF_SIZE)
    }

    /// Allocate a buffer of `capacity` bytes with no source bound.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(Error::Engine("stream buffer too small"));
        }
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| Error::Alloc("stream buffer"))?;
        storage.resize(capacity, 0);
        Ok(Self {
            source: None,
            storage: Some(storage),
            pinned: false,
            offset: None,
            pushback: 0,
            suspendable: false,
            remaining_skip: 0,
            pins: 0,
            unpins: 0,
        })
    }

    /// Drop any old source and bind `source` for the next decode.
    pub fn set_source(&mut self, source: Box<dyn ByteSource + 's>) {
        self.reset();
        self.source = Some(source);
    }

    /// Return to a clean slate: unpin, drop the source, clear offset,
    /// pushback, suspension and pending skip. The storage is kept.
    pub fn reset(&mut self) {
        self.source = None;
        self.unpin(None);
        self.offset = None;
        self.pushback = 0;
        self.suspendable = false;
        self.remaining_skip = 0;
    }

    /// Reset and release the storage. Any later [`pin`](Self::pin) fails.
    pub fn destroy(&mut self) {
        self.reset();
        self.storage = None;
    }

    /// Invalidate the buffered data without touching the pin state.
    pub fn clear(&mut self) {
        self.offset = None;
        self.pushback = 0;
    }

    /// Pin the storage. Returns the read position saved by the last
    /// unpin, or `None` if there was nothing worth keeping.
    pub fn pin(&mut self) -> Result<Option<usize>> {
        if self.storage.is_none() {
            return Err(Error::Pin);
        }
        debug_assert!(!self.pinned, "jpeg: stream buffer pinned twice");
        self.pinned = true;
        self.pins += 1;
        Ok(self.offset)
    }

    /// Unpin the storage, remembering `next` as the position to resume
    /// from. No-op when not pinned.
    pub fn unpin(&mut self, next: Option<usize>) {
        if !self.pinned {
            return;
        }
        self.offset = next;
        self.pinned = false;
        self.unpins += 1;
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Successful pins and unpins since construction.
    pub fn pin_stats(&self) -> (u32, u32) {
        (self.pins, self.unpins)
    }

    pub fn capacity(&self) -> usize {
        self.storage.as_ref().map_or(0, Vec::len)
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Pinned view of the storage.
    pub fn data(&self) -> &[u8] {
        assert!(self.pinned, "jpeg: stream buffer read while unpinned");
        self.storage.as_deref().unwrap_or(&[])
    }

    /// Pinned mutable view of the storage.
    pub fn data_mut(&mut self) -> &mut [u8] {
        assert!(self.pinned, "jpeg: stream buffer written while unpinned");
        self.storage.as_deref_mut().unwrap_or(&mut [])
    }

    pub fn suspendable(&self) -> bool {
        self.suspendable
    }

    pub fn set_suspendable(&mut self, suspendable: bool) {
        self.suspendable = suspendable;
    }

    /// Bytes owed to a skip that was deferred while suspendable.
    pub fn remaining_skip(&self) -> u64 {
        self.remaining_skip
    }

    pub(crate) fn set_remaining_skip(&mut self, count: u64) {
        self.remaining_skip = count;
    }

    pub(crate) fn set_pushback(&mut self, count: usize) {
        self.pushback = count;
    }

    /// Take the `(position, length)` of bytes pushed back by the last
    /// term_source, if any.
    pub(crate) fn take_pushback(&mut self) -> Option<(usize, usize)> {
        let count = core::mem::take(&mut self.pushback);
        match self.offset {
            Some(pos) if count > 0 => Some((pos, count)),
            _ => None,
        }
    }

    /// True when nothing was pushed back and the source has no more
    /// bytes. Otherwise whatever was read ahead is kept as pushback for
    /// the next image. Must be called unpinned.
    pub fn at_end(&mut self) -> Result<bool> {
        if self.pushback > 0 && self.offset.is_some() {
            return Ok(false);
        }
        if self.remaining_skip > 0 {
            return Ok(false);
        }
        let n = self.read_unpinned(0, self.capacity())?;
        if n == 0 {
            return Ok(true);
        }
        self.offset = Some(0);
        self.pushback = n;
        Ok(false)
    }

    /// Read from the source into `storage[offset..offset + len]`. Must be
    /// called unpinned.
    pub(crate) fn read_unpinned(&mut self, offset: usize, len: usize) -> Result<usize> {
        debug_assert!(!self.pinned, "jpeg: source called while pinned");
        let storage = self.storage.as_deref_mut().ok_or(Error::Pin)?;
        let source = self
            .source
            .as_deref_mut()
            .ok_or(Error::Source("no source bound"))?;
        let n = source.read(&mut storage[offset..offset + len])?;
        Ok(n.min(len))
    }

    /// Ask the source to skip `count` bytes. Must be called unpinned.
    pub(crate) fn skip_unpinned(&mut self, count: u64) -> Result<u64> {
        debug_assert!(!self.pinned, "jpeg: source called while pinned");
        let source = self
            .source
            .as_deref_mut()
            .ok_or(Error::Source("no source bound"))?;
        source.skip(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SliceSource;
    use proptest::prelude::*;

    #[test]
    fn new_buffer_is_unpinned_and_empty() {
        let mut sb = StreamBuffer::new().unwrap();
        assert_eq!(sb.capacity(), STREAMBUF_SIZE);
        assert!(!sb.is_pinned());
        assert!(!sb.suspendable());
        assert_eq!(sb.remaining_skip(), 0);
        assert_eq!(sb.pin().unwrap(), None);
        sb.unpin(None);
        assert_eq!(sb.pin_stats(), (1, 1));
    }

    #[test]
    fn unpin_without_pin_is_noop() {
        let mut sb = StreamBuffer::with_capacity(16).unwrap();
        sb.unpin(Some(3));
        assert_eq!(sb.pin_stats(), (0, 0));
        assert_eq!(sb.pin().unwrap(), None);
    }

    #[test]
    fn null_cursor_discards_position() {
        let mut sb = StreamBuffer::with_capacity(16).unwrap();
        sb.pin().unwrap();
        sb.unpin(Some(5));
        assert_eq!(sb.pin().unwrap(), Some(5));
        sb.unpin(None);
        assert_eq!(sb.pin().unwrap(), None);
        sb.unpin(None);
    }

    #[test]
    fn reset_is_idempotent_and_unpins() {
        let data = [1u8, 2, 3];
        let mut sb = StreamBuffer::with_capacity(16).unwrap();
        sb.set_source(Box::new(SliceSource::new(&data)));
        sb.set_suspendable(true);
        sb.set_remaining_skip(9);
        sb.pin().unwrap();
        sb.reset();
        sb.reset();
        assert!(!sb.is_pinned());
        assert!(!sb.has_source());
        assert!(!sb.suspendable());
        assert_eq!(sb.remaining_skip(), 0);
        assert_eq!(sb.pin().unwrap(), None);
        sb.unpin(None);
    }

    #[test]
    fn destroyed_buffer_refuses_pin() {
        let mut sb = StreamBuffer::with_capacity(16).unwrap();
        sb.destroy();
        assert_eq!(sb.pin(), Err(Error::Pin));
        assert!(!sb.is_pinned());
        sb.reset();
    }

    #[test]
    fn read_goes_through_unpinned_storage() {
        let data = [7u8; 10];
        let mut sb = StreamBuffer::with_capacity(8).unwrap();
        sb.set_source(Box::new(SliceSource::new(&data)));
        assert_eq!(sb.read_unpinned(2, 6).unwrap(), 6);
        sb.pin().unwrap();
        assert_eq!(&sb.data()[2..8], &[7; 6]);
        sb.unpin(None);
        assert_eq!(sb.skip_unpinned(10).unwrap(), 4);
    }

    #[test]
    fn read_without_source_fails() {
        let mut sb = StreamBuffer::with_capacity(8).unwrap();
        assert_eq!(sb.read_unpinned(0, 8), Err(Error::Source("no source bound")));
    }

    #[test]
    fn at_end_keeps_read_ahead_as_pushback() {
        let data = [1u8, 2, 3];
        let mut sb = StreamBuffer::with_capacity(8).unwrap();
        sb.set_source(Box::new(SliceSource::new(&data)));
        assert!(!sb.at_end().unwrap());
        // already holding bytes: no second read
        assert!(!sb.at_end().unwrap());
        assert_eq!(sb.take_pushback(), Some((0, 3)));
        sb.pin().unwrap();
        assert_eq!(&sb.data()[..3], &data);
        sb.unpin(None);
        assert!(sb.at_end().unwrap());
    }

    proptest! {
        #[test]
        fn offset_survives_unpin_pin(k in 0usize..=STREAMBUF_SIZE) {
            let mut sb = StreamBuffer::new().unwrap();
            sb.pin().unwrap();
            for (i, b) in sb.data_mut().iter_mut().enumerate() {
                *b = i as u8;
            }
            sb.unpin(Some(k));
            let resumed = sb.pin().unwrap();
            prop_assert_eq!(resumed, Some(k));
            if k < STREAMBUF_SIZE {
                prop_assert_eq!(sb.data()[k], k as u8);
            }
            sb.unpin(resumed);
            prop_assert_eq!(sb.pin_stats(), (2, 2));
        }
    }
}
