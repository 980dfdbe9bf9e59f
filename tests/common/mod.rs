// shared helpers: a tiny baseline JPEG writer, a trickling byte source
// and a recording listener

#![allow(dead_code)]

use jpeg_stream::{ByteSource, ImageInfo, LoaderListener, Warning};

/// Packs entropy-coded bits MSB first, stuffing 0x00 after every 0xFF.
#[derive(Default)]
pub struct BitWriter {
    out: Vec<u8>,
    acc: u32,
    n: u8,
}

impl BitWriter {
    pub fn put(&mut self, bits: u32, len: u8) {
        for i in (0..len).rev() {
            self.acc = (self.acc << 1) | ((bits >> i) & 1);
            self.n += 1;
            if self.n == 8 {
                self.emit(self.acc as u8);
                self.acc = 0;
                self.n = 0;
            }
        }
    }

    fn emit(&mut self, b: u8) {
        self.out.push(b);
        if b == 0xFF {
            self.out.push(0x00);
        }
    }

    /// Pad the last byte with one bits.
    pub fn align(&mut self) {
        if self.n > 0 {
            let pad = 8 - self.n;
            self.put((1 << pad) - 1, pad);
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.align();
        self.out
    }

    /// Align, then append an RSTn marker.
    pub fn restart(&mut self, n: u8) {
        self.align();
        self.out.extend_from_slice(&[0xFF, 0xD0 + (n & 7)]);
    }
}

/// Marker-level JPEG writer. Tables are chosen so every block costs a
/// few bits: DC table 0 has code `0` for "no change" and code `10` for
/// category 4 (four diff bits follow), AC table 0 has the single 1-bit
/// code `0` for EOB. With an all-8 quantiser a DC diff of `d` moves the
/// block by `d` grey levels.
#[derive(Default)]
pub struct JpegWriter {
    pub bytes: Vec<u8>,
}

pub const DC_CATEGORY: u8 = 4;

impl JpegWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn segment(&mut self, marker: u8, payload: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(&[0xFF, marker]);
        let len = (payload.len() + 2) as u16;
        self.bytes.extend_from_slice(&len.to_be_bytes());
        self.bytes.extend_from_slice(payload);
        self
    }

    pub fn soi(&mut self) -> &mut Self {
        self.bytes.extend_from_slice(&[0xFF, 0xD8]);
        self
    }

    pub fn eoi(&mut self) -> &mut Self {
        self.bytes.extend_from_slice(&[0xFF, 0xD9]);
        self
    }

    pub fn jfif(&mut self) -> &mut Self {
        self.segment(0xE0, b"JFIF\0\x01\x02\x00\x00\x01\x00\x01\x00\x00")
    }

    pub fn adobe(&mut self, transform: u8) -> &mut Self {
        let mut p = b"Adobe\x00\x64\x00\x00\x00\x00".to_vec();
        p.push(transform);
        self.segment(0xEE, &p)
    }

    pub fn icc(&mut self, seq: u8, count: u8, payload: &[u8]) -> &mut Self {
        let mut p = b"ICC_PROFILE\0".to_vec();
        p.push(seq);
        p.push(count);
        p.extend_from_slice(payload);
        self.segment(0xE2, &p)
    }

    pub fn app(&mut self, marker: u8, len: usize) -> &mut Self {
        let p: Vec<u8> = (0..len).map(|i| i as u8).collect();
        self.segment(marker, &p)
    }

    pub fn dqt(&mut self, id: u8, value: u8) -> &mut Self {
        let mut p = vec![id];
        p.extend_from_slice(&[value; 64]);
        self.segment(0xDB, &p)
    }

    /// DC and AC table 0 as described on the type.
    pub fn dht(&mut self) -> &mut Self {
        let mut bits = [0u8; 16];
        bits[0] = 1;
        bits[1] = 1;
        let mut dc = vec![0x00];
        dc.extend_from_slice(&bits);
        dc.extend_from_slice(&[0, DC_CATEGORY]);
        self.segment(0xC4, &dc);
        bits[1] = 0;
        let mut ac = vec![0x10];
        ac.extend_from_slice(&bits);
        ac.push(0x00);
        self.segment(0xC4, &ac)
    }

    pub fn dri(&mut self, interval: u16) -> &mut Self {
        self.segment(0xDD, &interval.to_be_bytes())
    }

    /// Baseline frame; `comps` are `(id, h, v)` all using quant table 0.
    pub fn sof0(&mut self, width: u16, height: u16, comps: &[(u8, u8, u8)]) -> &mut Self {
        let mut p = vec![8];
        p.extend_from_slice(&height.to_be_bytes());
        p.extend_from_slice(&width.to_be_bytes());
        p.push(comps.len() as u8);
        for &(id, h, v) in comps {
            p.extend_from_slice(&[id, (h << 4) | v, 0]);
        }
        self.segment(0xC0, &p)
    }

    /// Scan over component ids, all using tables 0/0.
    pub fn sos(&mut self, ids: &[u8]) -> &mut Self {
        let mut p = vec![ids.len() as u8];
        for &id in ids {
            p.extend_from_slice(&[id, 0x00]);
        }
        p.extend_from_slice(&[0, 63, 0]);
        self.segment(0xDA, &p)
    }

    pub fn raw(&mut self, data: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(data);
        self
    }

    pub fn build(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.bytes)
    }
}

/// Encode one block whose DC differs from the previous by `diff`
/// (0, or 8..=15 in magnitude) followed by EOB.
pub fn block(w: &mut BitWriter, diff: i32) {
    assert!(diff == 0 || (8..=15).contains(&diff.abs()), "diff {} not in category 4", diff);
    if diff == 0 {
        w.put(0, 1);
    } else {
        w.put(0b10, 2);
        let bits = if diff < 0 { (diff + 15) as u32 } else { diff as u32 };
        w.put(bits, DC_CATEGORY);
    }
    w.put(0, 1);
}

/// Entropy data for `blocks` blocks that each step the DC by `diff`.
pub fn staircase(blocks: usize, diff: i32) -> Vec<u8> {
    let mut w = BitWriter::default();
    for _ in 0..blocks {
        block(&mut w, diff);
    }
    w.finish()
}

/// Complete single-component image of `w`×`h` (multiples of 8) whose
/// blocks step by `diff` in raster order.
pub fn gray_image(w: u16, h: u16, diff: i32) -> Vec<u8> {
    let blocks = (w as usize / 8) * (h as usize / 8);
    JpegWriter::new()
        .soi()
        .jfif()
        .dqt(0, 8)
        .dht()
        .sof0(w, h, &[(1, 1, 1)])
        .sos(&[1])
        .raw(&staircase(blocks, diff))
        .eoi()
        .build()
}

/// Serves its data at most `step` bytes per read.
pub struct Trickle {
    data: Vec<u8>,
    pos: usize,
    step: usize,
    pub reads: usize,
}

impl Trickle {
    pub fn new(data: Vec<u8>, step: usize) -> Self {
        Self {
            data,
            pos: 0,
            step,
            reads: 0,
        }
    }
}

impl ByteSource for Trickle {
    fn read(&mut self, buf: &mut [u8]) -> jpeg_stream::Result<usize> {
        self.reads += 1;
        let n = buf.len().min(self.step).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn skip(&mut self, count: u64) -> jpeg_stream::Result<u64> {
        let n = (count as usize).min(self.data.len() - self.pos);
        self.pos += n;
        Ok(n as u64)
    }
}

#[derive(Default)]
pub struct Recorder {
    pub warnings: Vec<Warning>,
    pub inputs: Vec<(ImageInfo, Option<Vec<u8>>)>,
    pub outputs: Vec<(u32, u32)>,
    pub progress: Vec<u32>,
}

impl LoaderListener for Recorder {
    fn emit_warning(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    fn input_attributes(&mut self, info: &ImageInfo, icc_profile: Option<&[u8]>) {
        self.inputs.push((info.clone(), icc_profile.map(<[u8]>::to_vec)));
    }

    fn output_attributes(&mut self, width: u32, height: u32) {
        self.outputs.push((width, height));
    }

    fn update_progress(&mut self, scanline: u32) {
        self.progress.push(scanline);
    }
}
