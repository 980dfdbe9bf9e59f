//! Source manager hooks: the engine calls these when it needs input.
//!
//! INPUT HANDLING
//!
//! The engine sees the stream buffer through a [`SourceState`] (read
//! cursor + remaining byte count) and asks for more through
//! [`SourceManager`]. Every hook that calls out to the byte source or
//! the listener releases both buffers first and re-pins them after:
//!
//! - release with the engine's cursor, so the pin that follows resumes
//!   from the same logical position;
//! - never call the source or the listener while pinned;
//! - a failed pin is fatal for the current call.
//!
//! A stream that ends without EOI is accepted: a warning is emitted and
//! `FF D9` is synthesised in place of the missing data. Everything up to
//! the last complete MCU is still usable.
//!
//! With suspension enabled, `fill_input_buffer` does no work and returns
//! "would block". Filling then happens at the top level through
//! [`SourceDriver::fill_suspended_buffer`], which keeps whatever the
//! engine had not consumed yet and appends fresh data after it.

use crate::decoder::{M_EOI, SourceManager, SourceState};
use crate::error::{Error, Result, Warning};
use crate::pixel_buffer::PixelBuffer;
use crate::session::{AbortHandle, LoaderListener};
use crate::stream_buffer::StreamBuffer;

/// Binds a session's buffers and callbacks for the duration of one
/// engine call.
pub struct SourceDriver<'a, 's> {
    stream: &'a mut StreamBuffer<'s>,
    pixels: &'a mut PixelBuffer,
    listener: &'a mut dyn LoaderListener,
    abort: &'a AbortHandle,
}

impl<'a, 's> SourceDriver<'a, 's> {
    pub fn new(
        stream: &'a mut StreamBuffer<'s>,
        pixels: &'a mut PixelBuffer,
        listener: &'a mut dyn LoaderListener,
        abort: &'a AbortHandle,
    ) -> Self {
        Self {
            stream,
            pixels,
            listener,
            abort,
        }
    }

    /// Unpin both buffers, saving `next` for the following pin.
    pub fn release(&mut self, next: Option<usize>) {
        self.stream.unpin(next);
        self.pixels.unpin();
    }

    /// Pin both buffers and restore the engine cursor if the stream
    /// buffer kept a position.
    pub fn acquire(&mut self, src: &mut SourceState) -> Result<()> {
        if let Some(pos) = self.stream.pin()? {
            src.next_input_byte = Some(pos);
        }
        self.pixels.pin();
        Ok(())
    }

    pub fn is_pinned(&self) -> bool {
        self.stream.is_pinned()
    }

    pub fn listener(&mut self) -> &mut dyn LoaderListener {
        &mut *self.listener
    }

    pub fn pixels(&mut self) -> &mut PixelBuffer {
        self.pixels
    }

    fn check_abort(&self) -> Result<()> {
        if self.abort.is_aborted() {
            log::info!("jpeg: abort requested");
            return Err(Error::Aborted);
        }
        Ok(())
    }

    // hand a warning to the listener with both buffers released
    fn warn(&mut self, src: &mut SourceState, warning: Warning) -> Result<()> {
        self.release(src.next_input_byte);
        self.listener.emit_warning(warning);
        self.acquire(src)
    }

    // stream ended early: warn, then write FF D9 at `at`; returns bytes written
    fn insert_eoi(&mut self, src: &mut SourceState, at: usize) -> Result<usize> {
        self.warn(src, Warning::MissingEndOfImage)?;
        let data = self.stream.data_mut();
        let room = data.len().saturating_sub(at).min(2);
        data[at..at + room].copy_from_slice(&[0xFF, M_EOI][..room]);
        Ok(room)
    }

    /// Top-level refill for suspended input. Keeps the bytes the engine
    /// has not consumed, moves them to the front, and reads new data
    /// after them.
    pub fn fill_suspended_buffer(&mut self, src: &mut SourceState) -> Result<()> {
        self.check_abort()?;

        // at the top level a deferred skip may block
        if self.stream.remaining_skip() > 0 {
            self.skip_inner(src, 0, false)?;
        }

        let leftover = src.bytes_in_buffer;
        if let Some(pos) = src.next_input_byte {
            if pos > 0 && leftover > 0 {
                self.stream.data_mut().copy_within(pos..pos + leftover, 0);
            }
            src.next_input_byte = Some(0);
        }
        self.release(src.next_input_byte);

        let room = self.stream.capacity().saturating_sub(leftover);
        if room == 0 {
            return self.acquire(src);
        }

        let n = self.stream.read_unpinned(leftover, room)?;
        self.acquire(src)?;
        let n = if n == 0 {
            self.insert_eoi(src, leftover)?
        } else {
            n
        };

        log::debug!("jpeg: suspended fill kept {} + read {}", leftover, n);
        src.next_input_byte = Some(0);
        src.bytes_in_buffer = leftover + n;
        Ok(())
    }

    fn skip_inner(&mut self, src: &mut SourceState, num_bytes: i64, may_defer: bool) -> Result<()> {
        if num_bytes < 0 {
            return Ok(());
        }
        self.check_abort()?;

        let mut num = num_bytes as u64 + self.stream.remaining_skip();
        self.stream.set_remaining_skip(0);

        // easy case: skipping no more than is buffered
        let buffered = src.bytes_in_buffer as u64;
        if buffered >= num {
            src.next_input_byte = src.next_input_byte.map(|p| p + num as usize);
            src.bytes_in_buffer -= num as usize;
            return Ok(());
        }

        // empty the buffer; whichever fill runs next refills it
        src.bytes_in_buffer = 0;
        src.next_input_byte = Some(0);
        num -= buffered;

        if may_defer && self.stream.suspendable() {
            self.stream.set_remaining_skip(num);
            return Ok(());
        }

        self.release(src.next_input_byte);
        let skipped = self.stream.skip_unpinned(num)?;
        self.acquire(src)?;

        if skipped == 0 {
            let n = self.insert_eoi(src, 0)?;
            src.next_input_byte = Some(0);
            src.bytes_in_buffer = n;
        }
        Ok(())
    }
}

impl SourceManager for SourceDriver<'_, '_> {
    fn init_source(&mut self, src: &mut SourceState) {
        match self.stream.take_pushback() {
            Some((pos, len)) => {
                log::debug!("jpeg: resuming {} pushed-back bytes", len);
                src.next_input_byte = Some(pos);
                src.bytes_in_buffer = len;
            }
            None => {
                src.next_input_byte = None;
                src.bytes_in_buffer = 0;
            }
        }
    }

    fn fill_input_buffer(&mut self, src: &mut SourceState) -> Result<bool> {
        // this is where input suspends
        if self.stream.suspendable() {
            return Ok(false);
        }
        self.check_abort()?;

        // catch up on a skip deferred while suspended
        if self.stream.remaining_skip() > 0 {
            self.skip_inner(src, 0, true)?;
        }

        self.release(src.next_input_byte);
        let capacity = self.stream.capacity();
        let n = self.stream.read_unpinned(0, capacity)?;
        self.acquire(src)?;

        let n = if n == 0 { self.insert_eoi(src, 0)? } else { n };

        src.next_input_byte = Some(0);
        src.bytes_in_buffer = n;
        Ok(true)
    }

    fn skip_input_data(&mut self, src: &mut SourceState, num_bytes: i64) -> Result<()> {
        self.skip_inner(src, num_bytes, true)
    }

    fn term_source(&mut self, src: &mut SourceState) -> Result<()> {
        // push back what is left; it belongs to the next image
        if src.bytes_in_buffer > 0 {
            self.release(src.next_input_byte);
            self.stream.set_pushback(src.bytes_in_buffer);
            self.acquire(src)?;
            src.bytes_in_buffer = 0;
        }
        Ok(())
    }

    fn emit_warning(&mut self, src: &mut SourceState, warning: Warning) -> Result<()> {
        self.warn(src, warning)
    }

    fn buffer(&self) -> &[u8] {
        self.stream.data()
    }
}
