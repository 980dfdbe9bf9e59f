//! Decompression engine.
//!
//! A small libjpeg-shaped decoder that pulls its input through the
//! [`SourceManager`] hooks. The header reader is resumable: every byte it
//! consumes is committed to its own state, so when a fill reports "would
//! block" it returns [`HeaderStatus::Suspended`] and picks up exactly
//! where it stopped once the caller has refilled the buffer.
//!
//! Scan decoding is sequential Huffman only. Sequential images with one
//! scan per component (or any other split) are buffered and decoded scan
//! by scan. Progressive images decode their first scan (DC plus whatever
//! AC band it carries), which gives a usable low-detail picture.
//! Entropy-coded data cannot suspend.

mod huffman;
mod idct;
mod markers;
mod scan;

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::colorspace::ColorSpace;
use crate::error::{Error, Result, Warning};

use huffman::{BitState, EntropyInput, HuffTable};
use markers::HeaderPhase;
use scan::ScanDecoder;

pub use markers::{M_APP0, M_APP14, M_APP2, M_EOI, M_RST0, M_SOI, M_SOS};

pub const MAX_COMP: usize = 4;

/// Largest image (in pixels) the engine agrees to decode.
pub const MAX_PIXELS: u64 = 1 << 28;

/// The engine's view of the input buffer: a read cursor and how many
/// bytes are valid from there. `None` means the view holds nothing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceState {
    pub next_input_byte: Option<usize>,
    pub bytes_in_buffer: usize,
}

/// What to do with an unexpected marker found at a restart boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResyncAction {
    /// Drop the marker and resume entropy decoding.
    Discard,
    /// Scan forward to the next marker and decide again.
    Advance,
    /// Leave the marker unread; the decoder emits empty blocks until the
    /// next restart boundary.
    Keep,
}

/// libjpeg's default resync policy. `desired` is the restart number
/// (0..=7) the decoder expected.
pub fn resync_action(marker: u8, desired: u8) -> ResyncAction {
    let rst = |n: u8| M_RST0 + (n & 7);
    if marker < markers::M_SOF0 {
        // not a valid marker
        ResyncAction::Advance
    } else if !(M_RST0..=markers::M_RST7).contains(&marker) {
        ResyncAction::Keep
    } else if marker == rst(desired.wrapping_add(1)) || marker == rst(desired.wrapping_add(2)) {
        // one of the next two restarts: the data in between is missing
        ResyncAction::Keep
    } else if marker == rst(desired.wrapping_sub(1)) || marker == rst(desired.wrapping_sub(2)) {
        ResyncAction::Advance
    } else {
        ResyncAction::Discard
    }
}

/// Hooks the engine calls for input. All hooks work on the caller's
/// buffer through `src`; [`buffer`](Self::buffer) exposes the bytes.
pub trait SourceManager {
    /// Called once per image before the first header byte is read.
    fn init_source(&mut self, src: &mut SourceState);

    /// Refill the buffer. `Ok(false)` means "would block": the caller
    /// must supply more data and re-enter the engine.
    fn fill_input_buffer(&mut self, src: &mut SourceState) -> Result<bool>;

    /// Skip `num_bytes` of input. Non-positive counts are ignored.
    fn skip_input_data(&mut self, src: &mut SourceState, num_bytes: i64) -> Result<()>;

    /// Decide what to do with `marker` found where restart `desired`
    /// was expected.
    fn resync_to_restart(&mut self, marker: u8, desired: u8) -> ResyncAction {
        resync_action(marker, desired)
    }

    /// Called after the image (or a tables-only stream) is done.
    fn term_source(&mut self, src: &mut SourceState) -> Result<()>;

    /// Report a recoverable condition.
    fn emit_warning(&mut self, src: &mut SourceState, warning: Warning) -> Result<()>;

    /// Current buffer contents. `src.next_input_byte` indexes into this.
    fn buffer(&self) -> &[u8];
}

/// A marker segment kept by [`Decompressor::save_markers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedMarker {
    pub code: u8,
    /// Payload length in the stream (the kept `data` may be shorter).
    pub original_length: usize,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComponentInfo {
    pub id: u8,
    pub h_samp: u8,
    pub v_samp: u8,
    pub quant_idx: u8,
}

/// Frame attributes known once the header has been read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub num_components: u8,
    pub component_info: [ComponentInfo; MAX_COMP],
    pub progressive: bool,
    pub jpeg_color_space: ColorSpace,
    pub out_color_space: ColorSpace,
    pub saw_jfif_marker: bool,
    pub saw_adobe_marker: bool,
    pub adobe_transform: u8,
}

impl ImageInfo {
    pub fn components(&self) -> &[ComponentInfo] {
        let n = (self.num_components as usize).min(MAX_COMP);
        &self.component_info[..n]
    }
}

/// Result of [`Decompressor::read_header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    /// SOS reached; [`Decompressor::info`] is valid.
    Ready,
    /// EOI before any frame: the stream only carried tables.
    TablesOnly,
    /// Out of input; refill and call again.
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Idle,
    Header,
    Ready,
    Scanning,
}

/// DQT/DHT/DRI state. Survives between images so an abbreviated image
/// can follow a tables-only stream.
pub(crate) struct Tables {
    qt: [[u16; 64]; 4],
    qt_ok: [bool; 4],
    dc: [HuffTable; 4],
    ac: [HuffTable; 4],
    dc_ok: [bool; 4],
    ac_ok: [bool; 4],
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            qt: [[0; 64]; 4],
            qt_ok: [false; 4],
            dc: Default::default(),
            ac: Default::default(),
            dc_ok: [false; 4],
            ac_ok: [false; 4],
        }
    }
}

/// Component selection and spectral parameters from the latest SOS.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ScanHeader {
    num_comp: u8,
    order: [u8; MAX_COMP],
    dc_tbl: [u8; MAX_COMP],
    ac_tbl: [u8; MAX_COMP],
    ss: u8,
    se: u8,
    ah: u8,
    al: u8,
}

pub struct Decompressor {
    src: SourceState,
    state: EngineState,
    header: HeaderPhase,
    save_limits: [u16; 16],
    marker_list: Vec<SavedMarker>,
    has_frame: bool,
    info: ImageInfo,
    tables: Box<Tables>,
    restart_interval: u16,
    scan: ScanHeader,
    bits: BitState,
    // EOI already consumed while looking for the next scan
    saw_eoi: bool,
    output: Option<Box<ScanDecoder>>,
}

impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Decompressor {
    pub fn new() -> Self {
        Self {
            src: SourceState::default(),
            state: EngineState::Idle,
            header: HeaderPhase::default(),
            save_limits: [0; 16],
            marker_list: Vec::new(),
            has_frame: false,
            info: ImageInfo::default(),
            tables: Box::default(),
            restart_interval: 0,
            scan: ScanHeader::default(),
            bits: BitState::default(),
            saw_eoi: false,
            output: None,
        }
    }

    /// Keep up to `limit` payload bytes of every APPn marker `code`
    /// (0xE0..=0xEF) in [`marker_list`](Self::marker_list). A limit of 0
    /// stops saving that marker. Other codes are ignored.
    pub fn save_markers(&mut self, code: u8, limit: u16) {
        if (markers::M_APP0..=markers::M_APP15).contains(&code) {
            self.save_limits[(code - markers::M_APP0) as usize] = limit;
        } else {
            log::debug!("jpeg: not saving marker 0x{:02x}", code);
        }
    }

    pub fn marker_list(&self) -> &[SavedMarker] {
        &self.marker_list
    }

    /// Header attributes; `None` until `read_header` returned `Ready`.
    pub fn info(&self) -> Option<&ImageInfo> {
        match self.state {
            EngineState::Ready | EngineState::Scanning => Some(&self.info),
            _ => None,
        }
    }

    /// Mutable header attributes, for colorspace overrides before
    /// [`start_decompress`](Self::start_decompress).
    pub fn info_mut(&mut self) -> Option<&mut ImageInfo> {
        match self.state {
            EngineState::Ready => Some(&mut self.info),
            _ => None,
        }
    }

    pub fn source_state(&self) -> &SourceState {
        &self.src
    }

    pub fn source_state_mut(&mut self) -> &mut SourceState {
        &mut self.src
    }

    /// Abandon the current image. Tables and marker settings are kept;
    /// the next `read_header` starts a fresh image (and calls
    /// `init_source` again).
    pub fn abort(&mut self) {
        self.state = EngineState::Idle;
        self.header = HeaderPhase::default();
        self.output = None;
        self.bits = BitState::default();
        self.saw_eoi = false;
    }

    /// Forget everything, including tables and the buffer view.
    pub fn reset(&mut self) {
        self.abort();
        self.src = SourceState::default();
        self.marker_list.clear();
        self.has_frame = false;
        self.info = ImageInfo::default();
        *self.tables = Tables::default();
        self.restart_interval = 0;
        self.scan = ScanHeader::default();
    }

    /// Read markers up to the first SOS. Resumable: after `Suspended`,
    /// refill and call again.
    pub fn read_header<M: SourceManager + ?Sized>(&mut self, mgr: &mut M) -> Result<HeaderStatus> {
        match self.state {
            EngineState::Idle => {
                mgr.init_source(&mut self.src);
                self.begin_image();
                self.state = EngineState::Header;
            }
            EngineState::Header => {}
            EngineState::Ready | EngineState::Scanning => {
                return Err(Error::Engine("improper call to read_header"));
            }
        }

        let status = self.read_markers(mgr)?;
        match status {
            HeaderStatus::Ready => {
                self.state = EngineState::Ready;
                log::debug!(
                    "jpeg: header {}x{} comps={} cs={:?} progressive={}",
                    self.info.width,
                    self.info.height,
                    self.info.num_components,
                    self.info.jpeg_color_space,
                    self.info.progressive
                );
            }
            HeaderStatus::TablesOnly => {
                log::debug!("jpeg: tables-only stream");
                self.abort();
            }
            HeaderStatus::Suspended => {}
        }
        Ok(status)
    }

    fn begin_image(&mut self) {
        self.marker_list.clear();
        self.has_frame = false;
        self.info = ImageInfo::default();
        self.header = HeaderPhase::default();
        self.bits = BitState::default();
        self.saw_eoi = false;
        self.output = None;
    }

    /// Prepare scan decoding into `out_color_space`, decimating by
    /// `scale_denom` (1, 2, 4 or 8).
    pub fn start_decompress<M: SourceManager + ?Sized>(
        &mut self,
        mgr: &mut M,
        out_color_space: ColorSpace,
        scale_denom: u8,
    ) -> Result<()> {
        if self.state != EngineState::Ready {
            return Err(Error::Engine("improper call to start_decompress"));
        }
        if !matches!(scale_denom, 1 | 2 | 4 | 8) {
            return Err(Error::Engine("unsupported scale denominator"));
        }
        self.info.out_color_space = out_color_space;
        let decoder = ScanDecoder::new(
            &self.info,
            &self.scan,
            self.restart_interval,
            scale_denom,
        )?;
        if self.info.progressive {
            log::warn!(
                "jpeg: progressive {}x{}, decoding first scan only (Ss={} Se={} Al={})",
                self.info.width,
                self.info.height,
                self.scan.ss,
                self.scan.se,
                self.scan.al
            );
            mgr.emit_warning(&mut self.src, Warning::FirstScanOnly)?;
        } else {
            log::info!(
                "jpeg: baseline {}x{} -> {}x{} (1/{})",
                self.info.width,
                self.info.height,
                decoder.output_width(),
                decoder.output_height(),
                scale_denom
            );
        }
        self.output = Some(Box::new(decoder));
        self.state = EngineState::Scanning;
        Ok(())
    }

    pub fn output_width(&self) -> u32 {
        self.output.as_ref().map_or(0, |o| o.output_width())
    }

    pub fn output_height(&self) -> u32 {
        self.output.as_ref().map_or(0, |o| o.output_height())
    }

    pub fn output_components(&self) -> usize {
        self.output.as_ref().map_or(0, |o| o.output_components())
    }

    /// Rows handed out so far.
    pub fn output_scanline(&self) -> u32 {
        self.output.as_ref().map_or(0, |o| o.output_scanline())
    }

    /// Decode the next output row into `row`, which must hold at least
    /// `output_width * output_components` bytes.
    pub fn read_scanline<M: SourceManager + ?Sized>(&mut self, mgr: &mut M, row: &mut [u8]) -> Result<()> {
        if self.state != EngineState::Scanning {
            return Err(Error::Engine("improper call to read_scanline"));
        }
        if self.output.as_ref().is_some_and(|o| o.needs_scans()) {
            self.load_scans(mgr)?;
        }
        let out = self
            .output
            .as_deref_mut()
            .ok_or(Error::Engine("improper call to read_scanline"))?;
        let mut input = Input {
            mgr,
            src: &mut self.src,
        };
        out.read_row(&self.tables, &mut self.bits, &mut input, row)
    }

    /// Consume input up to EOI, hand leftovers back through
    /// `term_source`, and return to idle for the next image.
    pub fn finish_decompress<M: SourceManager + ?Sized>(&mut self, mgr: &mut M) -> Result<()> {
        if self.state != EngineState::Scanning {
            return Err(Error::Engine("improper call to finish_decompress"));
        }
        if self.output_scanline() < self.output_height() {
            return Err(Error::Engine("too few scanlines read"));
        }
        if !self.saw_eoi {
            let pending = self.bits.take_marker();
            self.skip_to_eoi(mgr, pending)?;
        }
        mgr.term_source(&mut self.src)?;
        self.abort();
        Ok(())
    }
}

/// Byte input for entropy data. Suspension is not supported here.
pub(crate) struct Input<'m, M: ?Sized> {
    mgr: &'m mut M,
    src: &'m mut SourceState,
}

impl<M: SourceManager + ?Sized> Input<'_, M> {
    pub(crate) fn warn(&mut self, warning: Warning) -> Result<()> {
        self.mgr.emit_warning(self.src, warning)
    }

    pub(crate) fn resync(&mut self, marker: u8, desired: u8) -> ResyncAction {
        self.mgr.resync_to_restart(marker, desired)
    }
}

impl<M: SourceManager + ?Sized> EntropyInput for Input<'_, M> {
    fn read_byte(&mut self) -> Result<u8> {
        match next_byte(self.src, self.mgr)? {
            Some(b) => Ok(b),
            None => Err(Error::Engine("input suspended inside entropy-coded data")),
        }
    }
}

/// Take one byte from the buffer, filling when empty. `None` when the
/// fill would block.
pub(crate) fn next_byte<M: SourceManager + ?Sized>(src: &mut SourceState, mgr: &mut M) -> Result<Option<u8>> {
    if src.bytes_in_buffer == 0 {
        if !mgr.fill_input_buffer(src)? {
            return Ok(None);
        }
        if src.bytes_in_buffer == 0 {
            return Err(Error::Engine("source manager returned no data"));
        }
    }
    let pos = src.next_input_byte.unwrap_or(0);
    let b = *mgr
        .buffer()
        .get(pos)
        .ok_or(Error::Engine("read cursor outside buffer"))?;
    src.next_input_byte = Some(pos + 1);
    src.bytes_in_buffer -= 1;
    Ok(Some(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resync_table_matches_libjpeg() {
        // expected RST3
        assert_eq!(resync_action(0x01, 3), ResyncAction::Advance);
        assert_eq!(resync_action(M_EOI, 3), ResyncAction::Keep);
        assert_eq!(resync_action(M_RST0 + 4, 3), ResyncAction::Keep);
        assert_eq!(resync_action(M_RST0 + 5, 3), ResyncAction::Keep);
        assert_eq!(resync_action(M_RST0 + 2, 3), ResyncAction::Advance);
        assert_eq!(resync_action(M_RST0 + 1, 3), ResyncAction::Advance);
        assert_eq!(resync_action(M_RST0 + 3, 3), ResyncAction::Discard);
        assert_eq!(resync_action(M_RST0 + 7, 3), ResyncAction::Discard);
        // wraps modulo 8
        assert_eq!(resync_action(M_RST0 + 7, 0), ResyncAction::Advance);
        assert_eq!(resync_action(M_RST0, 7), ResyncAction::Keep);
    }

    #[test]
    fn info_is_hidden_until_header_is_read() {
        let d = Decompressor::new();
        assert!(d.info().is_none());
        assert_eq!(d.output_height(), 0);
    }

    #[test]
    fn save_markers_ignores_non_app_codes() {
        let mut d = Decompressor::new();
        d.save_markers(M_APP2, 0xFFFF);
        d.save_markers(0xFE, 100);
        assert_eq!(d.save_limits[2], 0xFFFF);
        assert_eq!(d.save_limits.iter().filter(|&&l| l != 0).count(), 1);
    }
}
