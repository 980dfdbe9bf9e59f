//! Caller-supplied output pixel storage, bound for one decode call.
//!
//! Follows the same pin discipline as the stream buffer: rows are only
//! written while pinned, and the buffer is released around every
//! listener callback.

extern crate alloc;

use alloc::vec::Vec;

#[derive(Default)]
pub struct PixelBuffer {
    pixels: Option<Vec<u8>>,
    pinned: bool,
}

impl PixelBuffer {
    pub const fn new() -> Self {
        Self {
            pixels: None,
            pinned: false,
        }
    }

    /// Bind `pixels` as the output for the next decode, releasing any
    /// previous binding.
    pub fn bind(&mut self, pixels: Vec<u8>) {
        self.reset();
        self.pixels = Some(pixels);
    }

    /// Unpin and drop the binding, handing the storage back.
    pub fn reset(&mut self) -> Option<Vec<u8>> {
        self.unpin();
        self.pixels.take()
    }

    /// Pin the bound storage. Nothing to do when unbound.
    pub fn pin(&mut self) {
        if self.pixels.is_some() {
            debug_assert!(!self.pinned, "jpeg: pixel buffer pinned twice");
            self.pinned = true;
        }
    }

    pub fn unpin(&mut self) {
        self.pinned = false;
    }

    pub fn is_bound(&self) -> bool {
        self.pixels.is_some()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Size of the bound storage in bytes (0 when unbound).
    pub fn len(&self) -> usize {
        self.pixels.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pinned view of the bound storage.
    pub fn pixels_mut(&mut self) -> Option<&mut [u8]> {
        assert!(
            self.pixels.is_none() || self.pinned,
            "jpeg: pixel buffer written while unpinned"
        );
        self.pixels.as_deref_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn bind_pin_write_reset() {
        let mut pb = PixelBuffer::new();
        pb.bind(vec![0u8; 4]);
        assert!(pb.is_bound());
        pb.pin();
        pb.pixels_mut().unwrap()[1] = 9;
        let out = pb.reset().unwrap();
        assert_eq!(out, [0, 9, 0, 0]);
        assert!(!pb.is_pinned());
        assert!(!pb.is_bound());
    }

    #[test]
    fn pin_on_unbound_buffer_is_noop() {
        let mut pb = PixelBuffer::new();
        pb.pin();
        assert!(!pb.is_pinned());
        assert!(pb.pixels_mut().is_none());
        assert!(pb.reset().is_none());
    }

    #[test]
    fn rebinding_releases_previous_storage() {
        let mut pb = PixelBuffer::new();
        pb.bind(vec![1u8; 2]);
        pb.pin();
        pb.bind(vec![2u8; 3]);
        assert!(!pb.is_pinned());
        assert_eq!(pb.len(), 3);
    }

    #[test]
    #[should_panic(expected = "written while unpinned")]
    fn writing_unpinned_panics() {
        let mut pb = PixelBuffer::new();
        pb.bind(vec![0u8; 1]);
        let _ = pb.pixels_mut();
    }
}
