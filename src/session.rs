//! Decode session: one engine, its stream and pixel buffers, and the
//! caller's callbacks.
//!
//! Every engine call runs inside a pinned section that is released on
//! both the success and the error path. Callbacks into the
//! [`LoaderListener`] only ever happen with both buffers released.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::colorspace::{ColorSpace, adjust_color_space, select_scale_denom};
use crate::decoder::{Decompressor, HeaderStatus, ImageInfo, M_APP2, SourceManager, SourceState};
use crate::driver::SourceDriver;
use crate::error::{Error, Result, Warning};
use crate::icc::read_icc_profile;
use crate::pixel_buffer::PixelBuffer;
use crate::source::ByteSource;
use crate::stream_buffer::StreamBuffer;

/// Callbacks from the loader to whoever drives it. All methods have
/// defaults, so a listener only overrides what it cares about.
pub trait LoaderListener {
    /// A recoverable condition (missing EOI, restart resync, ...).
    fn emit_warning(&mut self, warning: Warning) {
        log::warn!("jpeg: {} (code {})", warning, warning.code());
    }

    /// Header attributes, after colorspace adjustment, plus the
    /// reassembled ICC profile if the stream carried one.
    fn input_attributes(&mut self, _info: &ImageInfo, _icc_profile: Option<&[u8]>) {}

    /// Scaled output size, once decompression has started.
    fn output_attributes(&mut self, _width: u32, _height: u32) {}

    /// Called before each row with its index and once more with the
    /// output height when all rows are in.
    fn update_progress(&mut self, _scanline: u32) {}
}

/// Listener that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogListener;

impl LoaderListener for LogListener {}

/// Cancellation flag shared between a session and any other thread.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// What [`DecodeSession::read_header`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderOutcome {
    /// A frame header was read; attributes have been reported.
    Ready(ImageInfo),
    /// The stream carried only tables. They are kept for the next image.
    TablesOnly,
    /// Suspended for input: call
    /// [`fill_suspended_buffer`](DecodeSession::fill_suspended_buffer)
    /// and then `read_header` again.
    Suspended,
}

pub struct DecodeSession<'s> {
    stream: StreamBuffer<'s>,
    pixels: PixelBuffer,
    engine: Decompressor,
    abort: AbortHandle,
}

impl<'s> DecodeSession<'s> {
    /// Allocate the stream buffer and set up an engine that keeps APP2
    /// markers for ICC reassembly.
    pub fn new() -> Result<Self> {
        Self::with_stream(StreamBuffer::new()?)
    }

    /// Like [`new`](Self::new) with a stream buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::with_stream(StreamBuffer::with_capacity(capacity)?)
    }

    fn with_stream(stream: StreamBuffer<'s>) -> Result<Self> {
        let mut engine = Decompressor::new();
        engine.save_markers(M_APP2, 0xFFFF);
        Ok(Self {
            stream,
            pixels: PixelBuffer::new(),
            engine,
            abort: AbortHandle::default(),
        })
    }

    /// Bind a new byte source. Drops the old one along with any
    /// buffered data, abandons the current image and clears the abort
    /// flag. Tables from earlier images are kept.
    pub fn set_source(&mut self, source: Box<dyn ByteSource + 's>) {
        self.stream.set_source(source);
        self.pixels.reset();
        self.engine.abort();
        *self.engine.source_state_mut() = SourceState::default();
        self.abort.clear();
    }

    /// In suspendable mode fills never block: the header reader returns
    /// [`HeaderOutcome::Suspended`] instead, and the caller refills with
    /// [`fill_suspended_buffer`](Self::fill_suspended_buffer).
    pub fn set_suspendable(&mut self, suspendable: bool) {
        self.stream.set_suspendable(suspendable);
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn engine(&self) -> &Decompressor {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Decompressor {
        &mut self.engine
    }

    pub fn stream(&self) -> &StreamBuffer<'s> {
        &self.stream
    }

    /// Run `f` with both buffers pinned and the engine cursor restored;
    /// both are released again whatever `f` returns.
    fn pinned<T>(
        &mut self,
        listener: &mut dyn LoaderListener,
        f: impl FnOnce(&mut Decompressor, &mut SourceDriver<'_, 's>) -> Result<T>,
    ) -> Result<T> {
        let Self {
            stream,
            pixels,
            engine,
            abort,
        } = self;
        let mut driver = SourceDriver::new(stream, pixels, listener, abort);
        driver.acquire(engine.source_state_mut())?;
        let out = f(engine, &mut driver);
        driver.release(engine.source_state().next_input_byte);
        out
    }

    /// Read the header up to the first scan, reassemble the ICC profile,
    /// adjust the colorspace and report the attributes.
    pub fn read_header(&mut self, listener: &mut dyn LoaderListener) -> Result<HeaderOutcome> {
        let status = self.pinned(&mut *listener, |engine, driver| {
            let status = engine.read_header(driver)?;
            if status == HeaderStatus::TablesOnly {
                driver.term_source(engine.source_state_mut())?;
            }
            Ok(status)
        });
        let status = match status {
            Ok(s) => s,
            Err(e) => {
                self.engine.abort();
                return Err(e);
            }
        };

        match status {
            HeaderStatus::Suspended => Ok(HeaderOutcome::Suspended),
            HeaderStatus::TablesOnly => Ok(HeaderOutcome::TablesOnly),
            HeaderStatus::Ready => {
                let profile = match read_icc_profile(self.engine.marker_list()) {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("jpeg: {}", e);
                        self.engine.abort();
                        return Err(e);
                    }
                };
                let info = self
                    .engine
                    .info_mut()
                    .ok_or(Error::Engine("header not available"))?;
                adjust_color_space(info);
                let info = info.clone();
                listener.input_attributes(&info, profile.as_deref());
                Ok(HeaderOutcome::Ready(info))
            }
        }
    }

    /// Whether the source is exhausted. Call between images: bytes read
    /// ahead to find out are handed to the next `read_header`.
    pub fn at_end_of_input(&mut self) -> Result<bool> {
        self.stream.at_end()
    }

    /// Top-level refill after a suspension.
    pub fn fill_suspended_buffer(&mut self, listener: &mut dyn LoaderListener) -> Result<()> {
        self.pinned(listener, |engine, driver| {
            driver.fill_suspended_buffer(engine.source_state_mut())
        })
    }

    /// Start decoding into `out_color_space`, scaled down towards
    /// `dest_width`×`dest_height`. Reports the output size and returns
    /// the number of samples per output pixel.
    pub fn start_decompression(
        &mut self,
        out_color_space: ColorSpace,
        dest_width: u32,
        dest_height: u32,
        listener: &mut dyn LoaderListener,
    ) -> Result<usize> {
        let info = self
            .engine
            .info()
            .ok_or(Error::Engine("improper call to start_decompression"))?;
        let denom = select_scale_denom(info.width, info.height, dest_width, dest_height);

        let started = self.pinned(&mut *listener, |engine, driver| {
            engine.start_decompress(driver, out_color_space, denom)
        });
        if let Err(e) = started {
            self.engine.abort();
            return Err(e);
        }

        listener.output_attributes(self.engine.output_width(), self.engine.output_height());
        Ok(self.engine.output_components())
    }

    /// Decode every row into `pixels` (row-major, tightly packed) and
    /// finish the image. Any input left after EOI stays buffered for the
    /// next `read_header`.
    pub fn decompress(
        &mut self,
        pixels: Vec<u8>,
        report_progress: bool,
        listener: &mut dyn LoaderListener,
    ) -> Result<Vec<u8>> {
        let width = self.engine.output_width() as usize;
        let height = self.engine.output_height();
        let components = self.engine.output_components();
        if components == 0 {
            return Err(Error::Engine("improper call to decompress"));
        }
        let stride = width
            .checked_mul(components)
            .ok_or(Error::Alloc("Reading JPEG Stream"))?;
        let total = stride
            .checked_mul(height as usize)
            .ok_or(Error::Alloc("Reading JPEG Stream"))?;
        if pixels.len() < total {
            return Err(Error::Alloc("Reading JPEG Stream"));
        }

        self.pixels.bind(pixels);
        let result = self.decode_rows(stride, height, report_progress, listener);
        let pixels = self.pixels.reset().unwrap_or_default();
        match result {
            Ok(()) => Ok(pixels),
            Err(e) => {
                self.engine.abort();
                Err(e)
            }
        }
    }

    fn decode_rows(
        &mut self,
        stride: usize,
        height: u32,
        report_progress: bool,
        listener: &mut dyn LoaderListener,
    ) -> Result<()> {
        let mut row = Vec::new();
        row.try_reserve_exact(stride)
            .map_err(|_| Error::Alloc("Reading JPEG Stream"))?;
        row.resize(stride, 0);

        while self.engine.output_scanline() < height {
            if self.abort.is_aborted() {
                log::info!("jpeg: abort requested");
                return Err(Error::Aborted);
            }
            let y = self.engine.output_scanline();
            if report_progress {
                listener.update_progress(y);
            }
            self.pinned(&mut *listener, |engine, driver| {
                engine.read_scanline(driver, &mut row)?;
                let out = driver
                    .pixels()
                    .pixels_mut()
                    .ok_or(Error::Engine("no output buffer bound"))?;
                let at = y as usize * stride;
                out[at..at + stride].copy_from_slice(&row);
                Ok(())
            })?;
        }
        if report_progress {
            listener.update_progress(height);
        }

        self.pinned(listener, |engine, driver| engine.finish_decompress(driver))
    }

    /// Back to a clean slate: no source, no pixels, no tables, flag
    /// cleared. Always succeeds.
    pub fn reset(&mut self) {
        self.stream.reset();
        self.pixels.reset();
        self.engine.reset();
        self.abort.clear();
    }

    /// Reset and release the stream storage. Later decode calls fail
    /// with [`Error::Pin`].
    pub fn dispose(&mut self) {
        self.reset();
        self.stream.destroy();
    }
}
