//! Marker reader: a byte-at-a-time state machine over the header, plus
//! parsers for the table and frame segments it collects.

extern crate alloc;

use alloc::vec::Vec;

use super::huffman::{BitState, HuffTable};
use super::scan::ScanDecoder;
use super::{
    Decompressor, HeaderStatus, Input, MAX_COMP, MAX_PIXELS, SavedMarker, SourceManager, Tables, next_byte,
};
use crate::colorspace::guess_color_space;
use crate::error::{Error, Result, Warning};

pub(super) const M_SOF0: u8 = 0xC0;
const M_SOF1: u8 = 0xC1;
const M_SOF2: u8 = 0xC2;
const M_DHT: u8 = 0xC4;
const M_JPG: u8 = 0xC8;
const M_DAC: u8 = 0xCC;
const M_SOF15: u8 = 0xCF;
pub const M_RST0: u8 = 0xD0;
pub(super) const M_RST7: u8 = 0xD7;
pub const M_SOI: u8 = 0xD8;
pub const M_EOI: u8 = 0xD9;
pub const M_SOS: u8 = 0xDA;
const M_DQT: u8 = 0xDB;
const M_DRI: u8 = 0xDD;
pub const M_APP0: u8 = 0xE0;
pub const M_APP2: u8 = 0xE2;
pub const M_APP14: u8 = 0xEE;
pub(super) const M_APP15: u8 = 0xEF;
const M_TEM: u8 = 0x01;

// bytes of APP0/APP14 needed to recognise JFIF / Adobe
const APP0_DATA_LEN: usize = 14;
const APP14_DATA_LEN: usize = 12;

/// Where the header reader stopped.
#[derive(Debug)]
pub(super) enum HeaderPhase {
    Signature { have_ff: bool },
    NextMarker { discarded: usize, seen_ff: bool },
    Length { marker: u8, hi: Option<u8> },
    Body(Segment),
}

impl Default for HeaderPhase {
    fn default() -> Self {
        HeaderPhase::Signature { have_ff: false }
    }
}

/// A marker segment being collected.
#[derive(Debug)]
pub(super) struct Segment {
    marker: u8,
    // payload length (without the two length bytes)
    length: usize,
    // payload bytes not yet consumed
    left: usize,
    // payload bytes still to copy into `data`; the rest is skipped
    keep: usize,
    data: Vec<u8>,
}

enum Step {
    Continue(HeaderPhase),
    Suspend(HeaderPhase),
    Done(HeaderStatus),
}

fn is_sof(marker: u8) -> bool {
    (M_SOF0..=M_SOF15).contains(&marker) && !matches!(marker, M_DHT | M_JPG | M_DAC)
}

fn is_app(marker: u8) -> bool {
    (M_APP0..=M_APP15).contains(&marker)
}

impl Decompressor {
    pub(super) fn read_markers<M: SourceManager + ?Sized>(&mut self, mgr: &mut M) -> Result<HeaderStatus> {
        loop {
            let phase = core::mem::take(&mut self.header);
            match self.step(phase, mgr)? {
                Step::Continue(next) => self.header = next,
                Step::Suspend(next) => {
                    self.header = next;
                    return Ok(HeaderStatus::Suspended);
                }
                Step::Done(status) => return Ok(status),
            }
        }
    }

    fn step<M: SourceManager + ?Sized>(&mut self, phase: HeaderPhase, mgr: &mut M) -> Result<Step> {
        if let HeaderPhase::Body(seg) = phase {
            return self.step_body(seg, mgr);
        }
        let Some(b) = next_byte(&mut self.src, mgr)? else {
            return Ok(Step::Suspend(phase));
        };
        match phase {
            HeaderPhase::Signature { have_ff: false } if b == 0xFF => {
                Ok(Step::Continue(HeaderPhase::Signature { have_ff: true }))
            }
            HeaderPhase::Signature { have_ff: true } if b == M_SOI => {
                self.on_soi();
                Ok(Step::Continue(HeaderPhase::NextMarker {
                    discarded: 0,
                    seen_ff: false,
                }))
            }
            HeaderPhase::Signature { .. } => Err(Error::Engine("not a JPEG file: starts with something other than SOI")),

            HeaderPhase::NextMarker { discarded, seen_ff: false } => Ok(Step::Continue(HeaderPhase::NextMarker {
                discarded: if b == 0xFF { discarded } else { discarded + 1 },
                seen_ff: b == 0xFF,
            })),
            HeaderPhase::NextMarker { discarded, seen_ff: true } => match b {
                // fill byte
                0xFF => Ok(Step::Continue(HeaderPhase::NextMarker {
                    discarded,
                    seen_ff: true,
                })),
                // stuffed zero outside entropy data is garbage too
                0x00 => Ok(Step::Continue(HeaderPhase::NextMarker {
                    discarded: discarded + 2,
                    seen_ff: false,
                })),
                marker => {
                    if discarded > 0 {
                        log::warn!(
                            "jpeg: corrupt data: {} extraneous bytes before marker 0x{:02x}",
                            discarded,
                            marker
                        );
                    }
                    self.on_marker(marker)
                }
            },

            HeaderPhase::Length { marker, hi: None } => Ok(Step::Continue(HeaderPhase::Length { marker, hi: Some(b) })),
            HeaderPhase::Length { marker, hi: Some(hi) } => {
                let length = u16::from_be_bytes([hi, b]) as usize;
                if length < 2 {
                    return Err(Error::Engine("bogus marker length"));
                }
                self.begin_segment(marker, length - 2)
            }

            HeaderPhase::Body(_) => Err(Error::Engine("header reader out of sync")),
        }
    }

    fn on_soi(&mut self) {
        self.restart_interval = 0;
        self.info.saw_jfif_marker = false;
        self.info.saw_adobe_marker = false;
        self.info.adobe_transform = 0;
    }

    fn on_marker(&mut self, marker: u8) -> Result<Step> {
        let next = HeaderPhase::NextMarker {
            discarded: 0,
            seen_ff: false,
        };
        match marker {
            M_SOI => Err(Error::Engine("invalid JPEG file structure: two SOI markers")),
            M_EOI => Ok(Step::Done(HeaderStatus::TablesOnly)),
            M_RST0..=M_RST7 | M_TEM => {
                log::debug!("jpeg: stray marker 0x{:02x} in header", marker);
                Ok(Step::Continue(next))
            }
            _ => Ok(Step::Continue(HeaderPhase::Length { marker, hi: None })),
        }
    }

    fn save_limit(&self, marker: u8) -> usize {
        if is_app(marker) {
            self.save_limits[(marker - M_APP0) as usize] as usize
        } else {
            0
        }
    }

    fn begin_segment(&mut self, marker: u8, length: usize) -> Result<Step> {
        let needed = match marker {
            m if is_sof(m) => length,
            M_DHT | M_DQT | M_DRI | M_SOS => length,
            M_APP0 => length.min(APP0_DATA_LEN),
            M_APP14 => length.min(APP14_DATA_LEN),
            _ => 0,
        };
        let keep = needed.max(self.save_limit(marker).min(length));
        let mut data = Vec::new();
        data.try_reserve_exact(keep)
            .map_err(|_| Error::Alloc("marker segment"))?;
        Ok(Step::Continue(HeaderPhase::Body(Segment {
            marker,
            length,
            left: length,
            keep,
            data,
        })))
    }

    fn step_body<M: SourceManager + ?Sized>(&mut self, mut seg: Segment, mgr: &mut M) -> Result<Step> {
        while seg.keep > 0 {
            if self.src.bytes_in_buffer == 0 {
                if !mgr.fill_input_buffer(&mut self.src)? {
                    return Ok(Step::Suspend(HeaderPhase::Body(seg)));
                }
                if self.src.bytes_in_buffer == 0 {
                    return Err(Error::Engine("source manager returned no data"));
                }
            }
            let pos = self.src.next_input_byte.unwrap_or(0);
            let n = self.src.bytes_in_buffer.min(seg.keep);
            let chunk = mgr
                .buffer()
                .get(pos..pos + n)
                .ok_or(Error::Engine("read cursor outside buffer"))?;
            seg.data.extend_from_slice(chunk);
            self.src.next_input_byte = Some(pos + n);
            self.src.bytes_in_buffer -= n;
            seg.keep -= n;
            seg.left -= n;
        }
        if seg.left > 0 {
            // a skip never suspends; while suspendable it is deferred
            mgr.skip_input_data(&mut self.src, seg.left as i64)?;
            seg.left = 0;
        }
        self.finish_segment(seg, mgr)
    }

    fn finish_segment<M: SourceManager + ?Sized>(&mut self, seg: Segment, mgr: &mut M) -> Result<Step> {
        let Segment {
            marker,
            length,
            mut data,
            ..
        } = seg;
        let next = HeaderPhase::NextMarker {
            discarded: 0,
            seen_ff: false,
        };

        match marker {
            M_SOF0 | M_SOF1 => self.parse_sof(&data, false)?,
            M_SOF2 => self.parse_sof(&data, true)?,
            m if is_sof(m) => return Err(Error::Engine("unsupported JPEG process: SOF type")),
            M_DHT => parse_dht(&data, &mut self.tables)?,
            M_DQT => parse_dqt(&data, &mut self.tables)?,
            M_DRI => self.restart_interval = parse_dri(&data)?,
            M_DAC => return Err(Error::Engine("arithmetic coding is not supported")),
            M_SOS => {
                self.parse_sos(&data)?;
                self.validate_tables()?;
                if let Some(w) = guess_color_space(&mut self.info) {
                    mgr.emit_warning(&mut self.src, w)?;
                }
                return Ok(Step::Done(HeaderStatus::Ready));
            }
            M_APP0 => self.examine_app0(&data),
            M_APP14 => self.examine_app14(&data),
            _ => {}
        }

        let limit = self.save_limit(marker);
        if limit > 0 {
            data.truncate(limit);
            log::debug!("jpeg: saved marker 0x{:02x} ({} of {} bytes)", marker, data.len(), length);
            self.marker_list.try_reserve(1).map_err(|_| Error::Alloc("marker list"))?;
            self.marker_list.push(SavedMarker {
                code: marker,
                original_length: length,
                data,
            });
        }
        Ok(Step::Continue(next))
    }

    fn examine_app0(&mut self, data: &[u8]) {
        if data.len() >= 5 && &data[..5] == b"JFIF\0" {
            self.info.saw_jfif_marker = true;
            if data.len() >= 7 {
                log::debug!("jpeg: JFIF {}.{:02}", data[5], data[6]);
            }
        }
    }

    fn examine_app14(&mut self, data: &[u8]) {
        if data.len() >= APP14_DATA_LEN && &data[..5] == b"Adobe" {
            self.info.saw_adobe_marker = true;
            self.info.adobe_transform = data[11];
            log::debug!("jpeg: Adobe APP14, transform {}", data[11]);
        }
    }

    fn parse_sof(&mut self, data: &[u8], progressive: bool) -> Result<()> {
        if self.has_frame {
            return Err(Error::Engine("invalid JPEG file structure: two SOF markers"));
        }
        if data.len() < 6 {
            return Err(Error::Engine("SOF truncated"));
        }
        if data[0] != 8 {
            return Err(Error::Engine("unsupported JPEG data precision"));
        }
        let height = be_u16(data, 1) as u32;
        let width = be_u16(data, 3) as u32;
        let num_comp = data[5];
        if width == 0 || height == 0 {
            return Err(Error::Engine("empty JPEG image (DNL not supported)"));
        }
        if width as u64 * height as u64 > MAX_PIXELS {
            return Err(Error::Engine("image exceeds pixel limit"));
        }
        if num_comp == 0 || num_comp as usize > MAX_COMP {
            return Err(Error::Engine("bad component count"));
        }
        if data.len() < 6 + num_comp as usize * 3 {
            return Err(Error::Engine("SOF truncated"));
        }

        for (i, c) in data[6..6 + num_comp as usize * 3].chunks_exact(3).enumerate() {
            let comp = &mut self.info.component_info[i];
            comp.id = c[0];
            comp.h_samp = c[1] >> 4;
            comp.v_samp = c[1] & 0x0F;
            comp.quant_idx = c[2];
            if !(1..=4).contains(&comp.h_samp) || !(1..=4).contains(&comp.v_samp) {
                return Err(Error::Engine("bad sampling factor"));
            }
            if comp.quant_idx >= 4 {
                return Err(Error::Engine("bad quantisation table index"));
            }
        }
        self.info.width = width;
        self.info.height = height;
        self.info.num_components = num_comp;
        self.info.progressive = progressive;
        self.has_frame = true;
        Ok(())
    }

    fn parse_sos(&mut self, data: &[u8]) -> Result<()> {
        if !self.has_frame {
            return Err(Error::Engine("invalid JPEG file structure: SOS before SOF"));
        }
        let n = *data.first().ok_or(Error::Engine("SOS truncated"))?;
        if n == 0 || n > self.info.num_components {
            return Err(Error::Engine("bad SOS component count"));
        }
        if data.len() < 1 + n as usize * 2 + 3 {
            return Err(Error::Engine("SOS truncated"));
        }
        let mut scan = super::ScanHeader {
            num_comp: n,
            ..Default::default()
        };
        for (sci, c) in data[1..1 + n as usize * 2].chunks_exact(2).enumerate() {
            let ci = self
                .info
                .components()
                .iter()
                .position(|comp| comp.id == c[0])
                .ok_or(Error::Engine("SOS references unknown component"))?;
            if scan.order[..sci].contains(&(ci as u8)) {
                return Err(Error::Engine("SOS lists a component twice"));
            }
            scan.order[sci] = ci as u8;
            scan.dc_tbl[sci] = c[1] >> 4;
            scan.ac_tbl[sci] = c[1] & 0x0F;
            if scan.dc_tbl[sci] >= 4 || scan.ac_tbl[sci] >= 4 {
                return Err(Error::Engine("bad Huffman table index"));
            }
        }
        let p = 1 + n as usize * 2;
        scan.ss = data[p];
        scan.se = data[p + 1];
        scan.ah = data[p + 2] >> 4;
        scan.al = data[p + 2] & 0x0F;

        if self.info.progressive {
            if scan.ah != 0 || scan.ss > scan.se || scan.se > 63 || scan.al > 13 {
                return Err(Error::Engine("invalid progressive parameters"));
            }
        } else if scan.ss != 0 || scan.se != 63 || scan.ah != 0 || scan.al != 0 {
            // libjpeg only warns here; the values are ignored for sequential
            log::warn!("jpeg: invalid sequential scan parameters, assuming full band");
            scan.ss = 0;
            scan.se = 63;
            scan.ah = 0;
            scan.al = 0;
        }
        self.scan = scan;
        Ok(())
    }

    fn validate_tables(&self) -> Result<()> {
        let t = &self.tables;
        for sci in 0..self.scan.num_comp as usize {
            let c = &self.info.component_info[self.scan.order[sci] as usize];
            if !t.qt_ok[c.quant_idx as usize] {
                return Err(Error::Engine("quantisation table not defined"));
            }
            if self.scan.ss == 0 && !t.dc_ok[self.scan.dc_tbl[sci] as usize] {
                return Err(Error::Engine("Huffman table not defined (DC)"));
            }
            if self.scan.se > 0 && !t.ac_ok[self.scan.ac_tbl[sci] as usize] {
                return Err(Error::Engine("Huffman table not defined (AC)"));
            }
        }
        Ok(())
    }

    /// Decode every scan of a buffered frame, reading the table and SOS
    /// segments between them. Stops once each component has been
    /// scanned, or at EOI.
    pub(super) fn load_scans<M: SourceManager + ?Sized>(&mut self, mgr: &mut M) -> Result<()> {
        let mut out = self
            .output
            .take()
            .ok_or(Error::Engine("improper call to read_scanline"))?;
        let loaded = self.run_scans(&mut out, mgr);
        self.output = Some(out);
        loaded
    }

    fn run_scans<M: SourceManager + ?Sized>(&mut self, out: &mut ScanDecoder, mgr: &mut M) -> Result<()> {
        loop {
            let mut input = Input {
                mgr: &mut *mgr,
                src: &mut self.src,
            };
            out.decode_scan(&self.tables, &mut self.bits, &mut input)?;
            if out.all_scanned() {
                break;
            }
            if !self.next_scan(mgr)? {
                self.saw_eoi = true;
                log::warn!("jpeg: corrupt data: EOI with {} component(s) never scanned", out.unscanned());
                mgr.emit_warning(&mut self.src, Warning::MissingScan)?;
                break;
            }
            out.begin_scan(&self.scan, self.restart_interval)?;
        }
        out.mark_loaded();
        Ok(())
    }

    // read up to the next SOS, applying tables on the way; false at EOI
    fn next_scan<M: SourceManager + ?Sized>(&mut self, mgr: &mut M) -> Result<bool> {
        let mut pending = self.bits.take_marker();
        self.bits = BitState::default();
        loop {
            let marker = match pending.take() {
                Some(m) => m,
                None => self.scan_for_marker(mgr)?,
            };
            match marker {
                M_EOI => return Ok(false),
                M_RST0..=M_RST7 | M_TEM => {}
                M_SOI => return Err(Error::Engine("invalid JPEG file structure: two SOI markers")),
                M_SOS => {
                    let data = self.read_segment(mgr)?;
                    self.parse_sos(&data)?;
                    self.validate_tables()?;
                    log::debug!("jpeg: next scan, {} component(s)", self.scan.num_comp);
                    return Ok(true);
                }
                M_DHT => {
                    let data = self.read_segment(mgr)?;
                    parse_dht(&data, &mut self.tables)?;
                }
                M_DQT => {
                    let data = self.read_segment(mgr)?;
                    parse_dqt(&data, &mut self.tables)?;
                }
                M_DRI => {
                    let data = self.read_segment(mgr)?;
                    self.restart_interval = parse_dri(&data)?;
                }
                m if is_sof(m) => return Err(Error::Engine("invalid JPEG file structure: two SOF markers")),
                _ => {
                    let length = self.read_length(mgr)?;
                    mgr.skip_input_data(&mut self.src, length as i64)?;
                }
            }
        }
    }

    // payload length of the segment whose marker was just read
    fn read_length<M: SourceManager + ?Sized>(&mut self, mgr: &mut M) -> Result<usize> {
        let hi = self.require_byte(mgr)?;
        let lo = self.require_byte(mgr)?;
        let length = u16::from_be_bytes([hi, lo]) as usize;
        if length < 2 {
            return Err(Error::Engine("bogus marker length"));
        }
        Ok(length - 2)
    }

    fn read_segment<M: SourceManager + ?Sized>(&mut self, mgr: &mut M) -> Result<Vec<u8>> {
        let length = self.read_length(mgr)?;
        let mut data = Vec::new();
        data.try_reserve_exact(length)
            .map_err(|_| Error::Alloc("marker segment"))?;
        for _ in 0..length {
            data.push(self.require_byte(mgr)?);
        }
        Ok(data)
    }

    /// Discard everything up to EOI. `pending` is a marker the entropy
    /// decoder already consumed.
    pub(super) fn skip_to_eoi<M: SourceManager + ?Sized>(&mut self, mgr: &mut M, pending: Option<u8>) -> Result<()> {
        let mut marker = pending;
        loop {
            let m = match marker.take() {
                Some(m) => m,
                None => self.scan_for_marker(mgr)?,
            };
            match m {
                M_EOI => return Ok(()),
                M_RST0..=M_RST7 | M_TEM | M_SOI => {}
                _ => {
                    // any other marker carries a length
                    let length = self.read_length(mgr)?;
                    mgr.skip_input_data(&mut self.src, length as i64)?;
                }
            }
        }
    }

    // next marker code, skipping entropy-coded bytes and stuffing
    pub(super) fn scan_for_marker<M: SourceManager + ?Sized>(&mut self, mgr: &mut M) -> Result<u8> {
        loop {
            if self.require_byte(mgr)? != 0xFF {
                continue;
            }
            loop {
                match self.require_byte(mgr)? {
                    0xFF => continue,
                    0x00 => break,
                    m => return Ok(m),
                }
            }
        }
    }

    fn require_byte<M: SourceManager + ?Sized>(&mut self, mgr: &mut M) -> Result<u8> {
        next_byte(&mut self.src, mgr)?.ok_or(Error::Engine("input suspended while finishing the image"))
    }
}

fn parse_dqt(data: &[u8], t: &mut Tables) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let info = data[pos];
        pos += 1;
        let prec = info >> 4;
        let id = (info & 0x0F) as usize;
        if id >= 4 {
            return Err(Error::Engine("DQT table index out of range"));
        }
        let width = if prec == 0 { 1 } else { 2 };
        let body = data
            .get(pos..pos + 64 * width)
            .ok_or(Error::Engine("DQT truncated"))?;
        for (q, v) in t.qt[id].iter_mut().zip(body.chunks_exact(width)) {
            *q = if width == 1 { v[0] as u16 } else { u16::from_be_bytes([v[0], v[1]]) };
        }
        pos += 64 * width;
        t.qt_ok[id] = true;
    }
    Ok(())
}

fn parse_dht(data: &[u8], t: &mut Tables) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        if pos + 17 > data.len() {
            return Err(Error::Engine("DHT truncated"));
        }
        let info = data[pos];
        let class = info >> 4;
        let id = (info & 0x0F) as usize;
        if id >= 4 || class > 1 {
            return Err(Error::Engine("DHT table index out of range"));
        }
        let mut bits = [0u8; 16];
        bits.copy_from_slice(&data[pos + 1..pos + 17]);
        pos += 17;
        let total: usize = bits.iter().map(|&b| b as usize).sum();
        let vals = data
            .get(pos..pos + total)
            .ok_or(Error::Engine("DHT truncated"))?;
        pos += total;
        let (table, ok): (&mut HuffTable, &mut bool) = if class == 0 {
            (&mut t.dc[id], &mut t.dc_ok[id])
        } else {
            (&mut t.ac[id], &mut t.ac_ok[id])
        };
        table.build(&bits, vals)?;
        *ok = true;
    }
    Ok(())
}

fn parse_dri(data: &[u8]) -> Result<u16> {
    if data.len() != 2 {
        return Err(Error::Engine("bogus DRI length"));
    }
    Ok(be_u16(data, 0))
}

#[inline]
fn be_u16(d: &[u8], o: usize) -> u16 {
    u16::from_be_bytes([d[o], d[o + 1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sof_classification() {
        assert!(is_sof(M_SOF0));
        assert!(is_sof(M_SOF2));
        assert!(is_sof(0xC3));
        assert!(!is_sof(M_DHT));
        assert!(!is_sof(M_DAC));
        assert!(!is_sof(M_JPG));
        assert!(is_app(M_APP2) && !is_app(0xFE));
    }

    #[test]
    fn dqt_reads_both_precisions() {
        let mut t = Tables::default();
        let mut seg = alloc::vec![0x00];
        seg.extend((0..64).map(|i| i as u8));
        seg.push(0x11);
        seg.extend((0..64).flat_map(|_| [0x01, 0x00]));
        parse_dqt(&seg, &mut t).unwrap();
        assert!(t.qt_ok[0] && t.qt_ok[1]);
        assert_eq!(t.qt[0][63], 63);
        assert_eq!(t.qt[1][0], 256);
    }

    #[test]
    fn dqt_truncation_is_an_error() {
        let mut t = Tables::default();
        assert!(parse_dqt(&[0x00, 1, 2, 3], &mut t).is_err());
        assert!(parse_dqt(&[0x05], &mut t).is_err());
    }

    #[test]
    fn dht_rejects_bad_class_and_short_values() {
        let mut t = Tables::default();
        let mut seg = alloc::vec![0x20];
        seg.extend([0u8; 16]);
        assert!(parse_dht(&seg, &mut t).is_err());

        let mut seg = alloc::vec![0x10, 2];
        seg.extend([0u8; 15]);
        seg.push(0x00);
        assert!(parse_dht(&seg, &mut t).is_err());
    }

    #[test]
    fn dri_needs_exactly_two_bytes() {
        assert_eq!(parse_dri(&[0, 4]).unwrap(), 4);
        assert!(parse_dri(&[0]).is_err());
    }
}
