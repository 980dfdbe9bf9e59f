//! Scan decoding and output rows.
//!
//! Entropy data is decoded one row group at a time (an MCU row for
//! interleaved scans, a block row for single-component scans) into
//! per-component sample bands. Output rows are produced from those bands
//! by box upsampling, colour conversion and integer decimation.
//!
//! A sequential frame whose first scan leaves components out is
//! buffered instead: every band covers its whole component, and all
//! scans are decoded before the first row is handed out.

extern crate alloc;

use alloc::vec::Vec;

use super::huffman::{BitReader, BitState, EntropyInput, Spectral, decode_block};
use super::idct::{clamp, idct};
use super::markers::M_RST0;
use super::{ImageInfo, Input, MAX_COMP, ResyncAction, ScanHeader, SourceManager, Tables};
use crate::colorspace::ColorSpace;
use crate::error::{Error, Result, Warning};

/// Entropy input that can also report warnings and ask for a resync
/// decision.
pub(super) trait ScanInput: EntropyInput {
    fn warn(&mut self, warning: Warning) -> Result<()>;
    fn resync(&mut self, marker: u8, desired: u8) -> ResyncAction;
}

impl<M: SourceManager + ?Sized> ScanInput for Input<'_, M> {
    fn warn(&mut self, warning: Warning) -> Result<()> {
        Input::warn(self, warning)
    }

    fn resync(&mut self, marker: u8, desired: u8) -> ResyncAction {
        Input::resync(self, marker, desired)
    }
}

impl<T: ScanInput + ?Sized> ScanInput for &mut T {
    fn warn(&mut self, warning: Warning) -> Result<()> {
        (**self).warn(warning)
    }

    fn resync(&mut self, marker: u8, desired: u8) -> ResyncAction {
        (**self).resync(marker, desired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Convert {
    Copy,
    GrayToRgb,
    Luma,
    YccToRgb,
    CmykToRgb,
    YcckToRgb,
    YcckToCmyk,
}

impl Convert {
    fn select(jpeg: ColorSpace, out: ColorSpace, ncomp: u8) -> Result<(Self, usize)> {
        use ColorSpace::*;

        if let Some(n) = jpeg.components() {
            if n != ncomp {
                return Err(Error::Engine("bogus colorspace for component count"));
            }
        }
        Ok(match (jpeg, out) {
            (Grayscale, Rgb) => (Convert::GrayToRgb, 3),
            (YCbCr, Grayscale) => (Convert::Luma, 1),
            (YCbCr, Rgb) => (Convert::YccToRgb, 3),
            (Cmyk, Rgb) => (Convert::CmykToRgb, 3),
            (Ycck, Rgb) => (Convert::YcckToRgb, 3),
            (Ycck, Cmyk) => (Convert::YcckToCmyk, 4),
            (a, b) if a == b => (Convert::Copy, ncomp as usize),
            _ => return Err(Error::Engine("unsupported color conversion request")),
        })
    }

    fn apply(self, px: &[u8; MAX_COMP], out: &mut [u8]) {
        match self {
            Convert::Copy => out.copy_from_slice(&px[..out.len()]),
            Convert::GrayToRgb => out.fill(px[0]),
            Convert::Luma => out[0] = px[0],
            Convert::YccToRgb => out.copy_from_slice(&ycc_to_rgb(px[0], px[1], px[2])),
            Convert::CmykToRgb => out.copy_from_slice(&cmyk_to_rgb(px[0], px[1], px[2], px[3])),
            Convert::YcckToRgb => {
                let [c, m, y] = ycc_to_rgb(px[0], px[1], px[2]).map(|v| 255 - v);
                out.copy_from_slice(&cmyk_to_rgb(c, m, y, px[3]));
            }
            Convert::YcckToCmyk => {
                let [c, m, y] = ycc_to_rgb(px[0], px[1], px[2]).map(|v| 255 - v);
                out.copy_from_slice(&[c, m, y, px[3]]);
            }
        }
    }
}

// JFIF YCbCr -> RGB, 16-bit fixed point
fn ycc_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    const HALF: i32 = 1 << 15;
    let y = y as i32;
    let cb = cb as i32 - 128;
    let cr = cr as i32 - 128;
    [
        clamp(y + ((91881 * cr + HALF) >> 16)),
        clamp(y + ((-22554 * cb - 46802 * cr + HALF) >> 16)),
        clamp(y + ((116130 * cb + HALF) >> 16)),
    ]
}

// Adobe CMYK is stored inverted: 255 means no ink
fn cmyk_to_rgb(c: u8, m: u8, y: u8, k: u8) -> [u8; 3] {
    let mul = |a: u8| ((a as u32 * k as u32 + 127) / 255) as u8;
    [mul(c), mul(m), mul(y)]
}

/// Decoded samples of one component for the current row group, or for
/// the whole component when the frame is buffered.
#[derive(Default)]
struct Band {
    // holds decoded samples (or will, once its group is decoded)
    scanned: bool,
    h: usize,
    v: usize,
    quant: usize,
    // blocks per MCU in the current scan
    bw: usize,
    bh: usize,
    stride: usize,
    rows: usize,
    // first component row held; None before the first group
    start: Option<usize>,
    data: Vec<u8>,
}

impl Band {
    fn holds(&self, cy: usize) -> bool {
        self.start
            .is_some_and(|s| cy >= s && cy < s + self.rows)
    }

    fn allocate(&mut self, stride: usize, rows: usize) -> Result<()> {
        let len = stride * rows;
        self.data.clear();
        self.data
            .try_reserve_exact(len)
            .map_err(|_| Error::Alloc("sample rows"))?;
        self.data.resize(len, 128);
        self.stride = stride;
        self.rows = rows;
        Ok(())
    }
}

pub(super) struct ScanDecoder {
    ncomp: usize,
    max_h: usize,
    max_v: usize,
    width: usize,
    height: usize,
    bands: [Band; MAX_COMP],
    // whole-frame bands, filled scan by scan
    buffered: bool,
    loaded: bool,
    scan: ScanHeader,
    spectral: Spectral,
    mcus_x: usize,
    mcus_y: usize,
    next_group: usize,
    restart_interval: u32,
    restarts_to_go: u32,
    next_restart: u8,
    dc_pred: [i32; MAX_COMP],
    warned_premature: bool,
    denom: usize,
    out_w: usize,
    out_h: usize,
    out_scanline: usize,
    convert: Convert,
    out_components: usize,
}

impl ScanDecoder {
    pub(super) fn new(info: &ImageInfo, scan: &ScanHeader, restart_interval: u16, denom: u8) -> Result<Self> {
        let (convert, out_components) =
            Convert::select(info.jpeg_color_space, info.out_color_space, info.num_components)?;

        if info.progressive && scan.ss != 0 {
            return Err(Error::Engine("progressive image must start with a DC scan"));
        }

        let comps = info.components();
        let max_h = comps.iter().map(|c| c.h_samp as usize).max().unwrap_or(1);
        let max_v = comps.iter().map(|c| c.v_samp as usize).max().unwrap_or(1);
        let width = info.width as usize;
        let height = info.height as usize;
        let buffered = !info.progressive && (scan.num_comp as usize) < comps.len();

        let mut bands: [Band; MAX_COMP] = Default::default();
        for (band, c) in bands.iter_mut().zip(comps) {
            band.h = c.h_samp as usize;
            band.v = c.v_samp as usize;
            band.quant = c.quant_idx as usize;
            if buffered {
                // large enough for both the interleaved and the
                // single-component block layout
                let stride = width.div_ceil(max_h * 8) * band.h * 8;
                let rows = height.div_ceil(max_v * 8) * band.v * 8;
                band.allocate(stride, rows)?;
            }
        }
        if buffered {
            log::debug!(
                "jpeg: first scan covers {} of {} components, buffering the frame",
                scan.num_comp,
                comps.len()
            );
        }

        let denom = denom as usize;
        let mut decoder = Self {
            ncomp: comps.len(),
            max_h,
            max_v,
            width,
            height,
            bands,
            buffered,
            loaded: !buffered,
            scan: ScanHeader::default(),
            spectral: Spectral::default(),
            mcus_x: 0,
            mcus_y: 0,
            next_group: 0,
            restart_interval: 0,
            restarts_to_go: 0,
            next_restart: 0,
            dc_pred: [0; MAX_COMP],
            warned_premature: false,
            denom,
            out_w: width.div_ceil(denom),
            out_h: height.div_ceil(denom),
            out_scanline: 0,
            convert,
            out_components,
        };
        decoder.begin_scan(scan, restart_interval)?;
        Ok(decoder)
    }

    /// Set up entropy decoding for `scan`. Streaming frames size their
    /// bands to one row group here; buffered frames keep theirs.
    pub(super) fn begin_scan(&mut self, scan: &ScanHeader, restart_interval: u16) -> Result<()> {
        let interleaved = scan.num_comp > 1;
        let (mcus_x, mcus_y) = if interleaved {
            (
                self.width.div_ceil(self.max_h * 8),
                self.height.div_ceil(self.max_v * 8),
            )
        } else {
            let b = &self.bands[scan.order[0] as usize];
            let comp_w = (self.width * b.h).div_ceil(self.max_h);
            let comp_h = (self.height * b.v).div_ceil(self.max_v);
            (comp_w.div_ceil(8), comp_h.div_ceil(8))
        };

        for &ci in &scan.order[..scan.num_comp as usize] {
            let band = &mut self.bands[ci as usize];
            band.scanned = true;
            (band.bw, band.bh) = if interleaved { (band.h, band.v) } else { (1, 1) };
            if self.buffered {
                band.start = Some(0);
            } else {
                band.allocate(mcus_x * band.bw * 8, band.bh * 8)?;
            }
        }

        self.scan = *scan;
        self.spectral = Spectral {
            se: scan.se as usize,
            al: scan.al,
        };
        self.mcus_x = mcus_x;
        self.mcus_y = mcus_y;
        self.next_group = 0;
        self.restart_interval = restart_interval as u32;
        self.restarts_to_go = restart_interval as u32;
        self.next_restart = 0;
        self.dc_pred = [0; MAX_COMP];
        Ok(())
    }

    /// Buffered frame still waiting for its scans.
    pub(super) fn needs_scans(&self) -> bool {
        !self.loaded
    }

    /// Every frame component has appeared in some scan.
    pub(super) fn all_scanned(&self) -> bool {
        self.bands[..self.ncomp].iter().all(|b| b.scanned)
    }

    pub(super) fn unscanned(&self) -> usize {
        self.bands[..self.ncomp].iter().filter(|b| !b.scanned).count()
    }

    pub(super) fn mark_loaded(&mut self) {
        self.loaded = true;
    }

    /// Decode what is left of the current scan into the frame bands.
    pub(super) fn decode_scan<I: ScanInput>(&mut self, tables: &Tables, bits: &mut BitState, input: &mut I) -> Result<()> {
        while self.next_group < self.mcus_y {
            self.decode_group(tables, bits, &mut *input)?;
        }
        Ok(())
    }

    pub(super) fn output_width(&self) -> u32 {
        self.out_w as u32
    }

    pub(super) fn output_height(&self) -> u32 {
        self.out_h as u32
    }

    pub(super) fn output_components(&self) -> usize {
        self.out_components
    }

    pub(super) fn output_scanline(&self) -> u32 {
        self.out_scanline as u32
    }

    /// Produce the next output row.
    pub(super) fn read_row<I: ScanInput>(
        &mut self,
        tables: &Tables,
        bits: &mut BitState,
        input: &mut I,
        row: &mut [u8],
    ) -> Result<()> {
        if self.out_scanline >= self.out_h {
            return Err(Error::Engine("application transferred too many scanlines"));
        }
        if !self.loaded {
            return Err(Error::Engine("buffered frame read before its scans"));
        }
        let need = self.out_w * self.out_components;
        let row = row
            .get_mut(..need)
            .ok_or(Error::Engine("scanline buffer too small"))?;

        let y = self.out_scanline * self.denom;
        while !self.rows_ready(y) {
            if self.next_group >= self.mcus_y {
                return Err(Error::Engine("scan ended before the last row"));
            }
            self.decode_group(tables, bits, input)?;
        }

        let mut px = [0u8; MAX_COMP];
        for (i, out) in row.chunks_exact_mut(self.out_components).enumerate() {
            let x = i * self.denom;
            for (c, p) in px.iter_mut().enumerate().take(self.ncomp) {
                *p = self.sample(c, x, y);
            }
            self.convert.apply(&px, out);
        }
        self.out_scanline += 1;
        Ok(())
    }

    fn rows_ready(&self, y: usize) -> bool {
        self.bands[..self.ncomp]
            .iter()
            .all(|b| !b.scanned || b.holds(y * b.v / self.max_v))
    }

    fn sample(&self, c: usize, x: usize, y: usize) -> u8 {
        let b = &self.bands[c];
        let Some(start) = b.start.filter(|_| b.scanned) else {
            return 128;
        };
        let cx = x * b.h / self.max_h;
        let cy = y * b.v / self.max_v;
        b.data[(cy - start) * b.stride + cx]
    }

    fn decode_group<I: ScanInput>(&mut self, tables: &Tables, bits: &mut BitState, input: &mut I) -> Result<()> {
        let mut r = BitReader::new(input, bits);
        let mut blk = [0i32; 64];
        let mut pix = [0u8; 64];
        let group = self.next_group;

        for mcu_col in 0..self.mcus_x {
            if self.restart_interval > 0 {
                if self.restarts_to_go == 0 {
                    self.process_restart(&mut r)?;
                }
                self.restarts_to_go -= 1;
            }
            for sci in 0..self.scan.num_comp as usize {
                let band = &mut self.bands[self.scan.order[sci] as usize];
                let dc = &tables.dc[self.scan.dc_tbl[sci] as usize];
                let ac = &tables.ac[self.scan.ac_tbl[sci] as usize];
                let qt = &tables.qt[band.quant];
                let base = if self.buffered { group * band.bh * 8 } else { 0 };
                for by in 0..band.bh {
                    for bx in 0..band.bw {
                        decode_block(&mut r, dc, ac, &mut self.dc_pred[sci], qt, &mut blk, self.spectral)?;
                        idct(&blk, &mut pix);
                        let x0 = (mcu_col * band.bw + bx) * 8;
                        for (row, src) in pix.chunks_exact(8).enumerate() {
                            let dst = (base + by * 8 + row) * band.stride + x0;
                            band.data[dst..dst + 8].copy_from_slice(src);
                        }
                    }
                }
            }

            if r.state().overrun && !self.warned_premature {
                self.warned_premature = true;
                log::warn!("jpeg: corrupt data: premature end of data segment");
                r.source().warn(Warning::PrematureEnd)?;
            }
        }

        if !self.buffered {
            for &ci in &self.scan.order[..self.scan.num_comp as usize] {
                let band = &mut self.bands[ci as usize];
                band.start = Some(group * band.rows);
            }
        }
        self.next_group += 1;
        Ok(())
    }

    fn process_restart<I: ScanInput>(&mut self, r: &mut BitReader<'_, I>) -> Result<()> {
        r.state().discard_bits();
        let mut marker = match r.state().take_marker() {
            Some(m) => m,
            None => read_marker(r.source())?,
        };
        let expected = M_RST0 + self.next_restart;
        if marker != expected {
            log::warn!(
                "jpeg: corrupt data: found marker 0x{:02x} instead of RST{}",
                marker,
                self.next_restart
            );
            r.source().warn(Warning::RestartResync {
                found: marker,
                expected: self.next_restart,
            })?;
            loop {
                match r.source().resync(marker, self.next_restart) {
                    ResyncAction::Discard => break,
                    ResyncAction::Keep => {
                        r.state().marker = marker;
                        break;
                    }
                    ResyncAction::Advance => marker = read_marker(r.source())?,
                }
            }
        }
        self.next_restart = (self.next_restart + 1) & 7;
        self.dc_pred = [0; MAX_COMP];
        self.restarts_to_go = self.restart_interval;
        Ok(())
    }
}

// next marker code in entropy-coded data
fn read_marker<I: EntropyInput + ?Sized>(input: &mut I) -> Result<u8> {
    loop {
        if input.read_byte()? != 0xFF {
            continue;
        }
        loop {
            match input.read_byte()? {
                0xFF => continue,
                0x00 => break,
                m => return Ok(m),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{ComponentInfo, resync_action};

    #[test]
    fn neutral_ycc_is_grey() {
        assert_eq!(ycc_to_rgb(128, 128, 128), [128, 128, 128]);
        assert_eq!(ycc_to_rgb(255, 128, 128), [255, 255, 255]);
        // strong red
        let [r, g, b] = ycc_to_rgb(76, 85, 255);
        assert!(r > 250 && g < 5 && b < 5);
    }

    #[test]
    fn inverted_cmyk_white_and_black() {
        assert_eq!(cmyk_to_rgb(255, 255, 255, 255), [255, 255, 255]);
        assert_eq!(cmyk_to_rgb(255, 255, 255, 0), [0, 0, 0]);
    }

    #[test]
    fn conversion_table() {
        use ColorSpace::*;
        assert_eq!(Convert::select(YCbCr, Rgb, 3).unwrap(), (Convert::YccToRgb, 3));
        assert_eq!(Convert::select(Grayscale, Grayscale, 1).unwrap(), (Convert::Copy, 1));
        assert_eq!(Convert::select(Unknown, Unknown, 2).unwrap(), (Convert::Copy, 2));
        assert_eq!(Convert::select(Ycck, Rgb, 4).unwrap(), (Convert::YcckToRgb, 3));
        assert!(Convert::select(Rgb, Cmyk, 3).is_err());
        assert!(Convert::select(Grayscale, Grayscale, 3).is_err());
    }

    struct Bytes(Vec<u8>, usize, Vec<Warning>);

    impl EntropyInput for Bytes {
        fn read_byte(&mut self) -> Result<u8> {
            let b = *self.0.get(self.1).unwrap_or(&0xD9);
            self.1 += 1;
            Ok(b)
        }
    }

    impl ScanInput for Bytes {
        fn warn(&mut self, warning: Warning) -> Result<()> {
            self.2.push(warning);
            Ok(())
        }

        fn resync(&mut self, marker: u8, desired: u8) -> ResyncAction {
            resync_action(marker, desired)
        }
    }

    fn grey_decoder(width: u32, height: u32, restart: u16) -> (ScanDecoder, Tables) {
        let mut info = ImageInfo {
            width,
            height,
            num_components: 1,
            jpeg_color_space: ColorSpace::Grayscale,
            out_color_space: ColorSpace::Grayscale,
            ..ImageInfo::default()
        };
        info.component_info[0] = ComponentInfo {
            id: 1,
            h_samp: 1,
            v_samp: 1,
            quant_idx: 0,
        };
        let scan = ScanHeader {
            num_comp: 1,
            se: 63,
            ..ScanHeader::default()
        };
        let mut tables = Tables::default();
        let mut bits = [0u8; 16];
        bits[0] = 1;
        tables.dc[0].build(&bits, &[0]).unwrap();
        tables.ac[0].build(&bits, &[0]).unwrap();
        tables.qt[0] = [1; 64];
        (ScanDecoder::new(&info, &scan, restart, 1).unwrap(), tables)
    }

    #[test]
    fn flat_blocks_decode_to_mid_grey() {
        // each block is "0 0" (DC diff 0, EOB): two blocks per byte
        let (mut dec, tables) = grey_decoder(16, 8, 0);
        let mut input = Bytes(alloc::vec![0x00, 0xFF, 0xD9], 0, Vec::new());
        let mut bits = BitState::default();
        let mut row = [0u8; 16];
        for _ in 0..8 {
            dec.read_row(&tables, &mut bits, &mut input, &mut row).unwrap();
            assert!(row.iter().all(|&p| p == 128));
        }
        assert!(input.2.is_empty());
        assert!(dec.read_row(&tables, &mut bits, &mut input, &mut row).is_err());
    }

    #[test]
    fn truncated_data_warns_once_and_pads() {
        let (mut dec, tables) = grey_decoder(32, 16, 0);
        // only a few bits of data, then EOI
        let mut input = Bytes(alloc::vec![0x00, 0xFF, 0xD9], 0, Vec::new());
        let mut bits = BitState::default();
        let mut row = [0u8; 32];
        for _ in 0..16 {
            dec.read_row(&tables, &mut bits, &mut input, &mut row).unwrap();
        }
        assert_eq!(input.2, [Warning::PrematureEnd]);
    }

    #[test]
    fn restart_markers_are_consumed_in_order() {
        // 2 MCUs per interval; byte 0x00 carries both, then RST0
        let (mut dec, tables) = grey_decoder(32, 8, 2);
        let mut input = Bytes(alloc::vec![0x00, 0xFF, 0xD0, 0x00, 0xFF, 0xD9], 0, Vec::new());
        let mut bits = BitState::default();
        let mut row = [0u8; 32];
        dec.read_row(&tables, &mut bits, &mut input, &mut row).unwrap();
        assert!(input.2.is_empty());
        assert_eq!(dec.next_restart, 1);
    }

    #[test]
    fn wrong_restart_number_warns_and_resyncs() {
        let (mut dec, tables) = grey_decoder(32, 8, 2);
        // RST5 where RST0 is expected: too far away, discarded
        let mut input = Bytes(alloc::vec![0x00, 0xFF, 0xD5, 0x00, 0xFF, 0xD9], 0, Vec::new());
        let mut bits = BitState::default();
        let mut row = [0u8; 32];
        dec.read_row(&tables, &mut bits, &mut input, &mut row).unwrap();
        assert_eq!(
            input.2,
            [Warning::RestartResync {
                found: 0xD5,
                expected: 0
            }]
        );
        assert!(row.iter().all(|&p| p == 128));
    }

    #[test]
    fn partial_first_scan_buffers_the_frame() {
        let mut info = ImageInfo {
            width: 8,
            height: 8,
            num_components: 3,
            jpeg_color_space: ColorSpace::YCbCr,
            out_color_space: ColorSpace::Rgb,
            ..ImageInfo::default()
        };
        for (i, c) in info.component_info[..3].iter_mut().enumerate() {
            *c = ComponentInfo {
                id: i as u8 + 1,
                h_samp: 1,
                v_samp: 1,
                quant_idx: 0,
            };
        }
        let scan = ScanHeader {
            num_comp: 1,
            se: 63,
            ..ScanHeader::default()
        };
        let mut dec = ScanDecoder::new(&info, &scan, 0, 1).unwrap();
        assert!(dec.needs_scans());
        assert_eq!(dec.unscanned(), 2);

        let tables = Tables::default();
        let mut bits = BitState::default();
        let mut input = Bytes(Vec::new(), 0, Vec::new());
        let mut row = [0u8; 24];
        assert!(dec.read_row(&tables, &mut bits, &mut input, &mut row).is_err());
        dec.mark_loaded();
        dec.read_row(&tables, &mut bits, &mut input, &mut row).unwrap();
        assert!(row.iter().all(|&p| p == 128));
    }

    #[test]
    fn decimation_picks_every_nth_sample() {
        let (mut dec, tables) = grey_decoder(17, 9, 0);
        dec.denom = 2;
        dec.out_w = 9;
        dec.out_h = 5;
        let mut input = Bytes(alloc::vec![0x00, 0x00, 0xFF, 0xD9], 0, Vec::new());
        let mut bits = BitState::default();
        let mut row = [0u8; 9];
        for _ in 0..5 {
            dec.read_row(&tables, &mut bits, &mut input, &mut row).unwrap();
        }
        assert_eq!(dec.output_scanline(), 5);
    }
}
