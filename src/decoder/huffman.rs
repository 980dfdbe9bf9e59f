//! Huffman tables, the entropy bit reader and per-block coefficient decode.

use crate::error::{Error, Result};

// zig-zag scan order
#[rustfmt::skip]
pub(super) const ZZ: [usize; 64] = [
     0,  1,  8, 16,  9,  2,  3, 10,
    17, 24, 32, 25, 18, 11,  4,  5,
    12, 19, 26, 33, 40, 48, 41, 34,
    27, 20, 13,  6,  7, 14, 21, 28,
    35, 42, 49, 56, 57, 50, 43, 36,
    29, 22, 15, 23, 30, 37, 44, 51,
    58, 59, 52, 45, 38, 31, 39, 46,
    53, 60, 61, 54, 47, 55, 62, 63,
];

/// Decoding table for one DHT class/id: an 8-bit lookahead table for
/// short codes plus the canonical mincode/maxcode arrays for long ones.
pub(super) struct HuffTable {
    lut: [(u8, u8); 256],
    mincode: [i32; 17],
    maxcode: [i32; 17],
    valptr: [usize; 17],
    values: [u8; 256],
}

impl Default for HuffTable {
    fn default() -> Self {
        Self {
            lut: [(0, 0); 256],
            mincode: [0; 17],
            maxcode: [-1; 17],
            valptr: [0; 17],
            values: [0; 256],
        }
    }
}

impl HuffTable {
    /// Build from the DHT `bits` counts and symbol list. Rejects code
    /// sets that overflow their length (libjpeg's "bad Huffman table").
    pub(super) fn build(&mut self, bits: &[u8; 16], vals: &[u8]) -> Result<()> {
        let total: usize = bits.iter().map(|&b| b as usize).sum();
        if total > 256 || vals.len() < total {
            return Err(Error::Engine("bad Huffman table"));
        }
        self.values[..total].copy_from_slice(&vals[..total]);
        self.lut.fill((0, 0));
        self.maxcode.fill(-1);

        let mut code: u32 = 0;
        let mut si: usize = 0;

        for bl in 1..=16usize {
            let cnt = bits[bl - 1] as usize;
            if cnt > 0 {
                self.valptr[bl] = si;
                self.mincode[bl] = code as i32;
                for _ in 0..cnt {
                    if bl <= 8 {
                        let prefix = (code << (8 - bl)) as usize;
                        let fill = 1usize << (8 - bl);
                        for k in 0..fill {
                            if prefix + k < 256 {
                                self.lut[prefix + k] = (vals[si], bl as u8);
                            }
                        }
                    }
                    si += 1;
                    code += 1;
                }
                if code > (1u32 << bl) {
                    return Err(Error::Engine("bad Huffman table"));
                }
                self.maxcode[bl] = (code - 1) as i32;
            }
            code <<= 1;
        }
        Ok(())
    }
}

/// Where entropy-coded bytes come from.
pub(super) trait EntropyInput {
    fn read_byte(&mut self) -> Result<u8>;
}

impl<T: EntropyInput + ?Sized> EntropyInput for &mut T {
    fn read_byte(&mut self) -> Result<u8> {
        (**self).read_byte()
    }
}

/// Bit-level state that survives between scanline calls.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct BitState {
    buf: u32,
    avail: u8,
    // leading bits of `buf` that came from the stream rather than padding
    real: u8,
    // stashed marker code; non-zero once entropy data hit a marker
    pub(super) marker: u8,
    // a decode consumed padding: the segment ended too early
    pub(super) overrun: bool,
}

impl BitState {
    /// Drop buffered bits (restart boundary).
    pub(super) fn discard_bits(&mut self) {
        self.buf = 0;
        self.avail = 0;
        self.real = 0;
    }

    pub(super) fn take_marker(&mut self) -> Option<u8> {
        match core::mem::take(&mut self.marker) {
            0 => None,
            m => Some(m),
        }
    }
}

pub(super) struct BitReader<'b, R> {
    source: R,
    st: &'b mut BitState,
}

impl<'b, R: EntropyInput> BitReader<'b, R> {
    pub(super) fn new(source: R, st: &'b mut BitState) -> Self {
        Self { source, st }
    }

    pub(super) fn source(&mut self) -> &mut R {
        &mut self.source
    }

    pub(super) fn state(&mut self) -> &mut BitState {
        self.st
    }

    // fetch next entropy-coded byte, handling byte stuffing; None (pad
    // with zeros) once a marker has been seen
    fn next_byte(&mut self) -> Result<Option<u8>> {
        if self.st.marker != 0 {
            return Ok(None);
        }
        let b = self.source.read_byte()?;
        if b != 0xFF {
            return Ok(Some(b));
        }
        loop {
            match self.source.read_byte()? {
                0x00 => return Ok(Some(0xFF)),
                0xFF => continue,
                m => {
                    self.st.marker = m;
                    return Ok(None);
                }
            }
        }
    }

    fn ensure(&mut self, n: u8) -> Result<()> {
        while self.st.avail < n {
            let b = match self.next_byte()? {
                Some(b) => {
                    self.st.real += 8;
                    b
                }
                None => 0,
            };
            self.st.buf |= (b as u32) << (24 - self.st.avail);
            self.st.avail += 8;
        }
        Ok(())
    }

    #[inline]
    fn peek(&mut self, n: u8) -> Result<u32> {
        self.ensure(n)?;
        Ok(self.st.buf >> (32 - n as u32))
    }

    #[inline]
    fn drop_bits(&mut self, n: u8) {
        self.st.buf <<= n as u32;
        self.st.avail -= n;
        if n > self.st.real {
            self.st.overrun = true;
        }
        self.st.real = self.st.real.saturating_sub(n);
    }

    #[inline]
    fn read_bits(&mut self, n: u8) -> Result<u32> {
        if n == 0 {
            return Ok(0);
        }
        self.ensure(n)?;
        let val = self.st.buf >> (32 - n as u32);
        self.drop_bits(n);
        Ok(val)
    }

    fn decode(&mut self, t: &HuffTable) -> Result<u8> {
        let peek8 = self.peek(8)? as usize;
        let (sym, nb) = t.lut[peek8];
        if nb > 0 {
            self.drop_bits(nb);
            return Ok(sym);
        }
        let peek16 = self.peek(16)? as i32;
        for bl in 9..=16u8 {
            let code = peek16 >> (16 - bl);
            if t.maxcode[bl as usize] >= 0 && code <= t.maxcode[bl as usize] {
                self.drop_bits(bl);
                let idx = t.valptr[bl as usize] as i32 + code - t.mincode[bl as usize];
                return Ok(t.values[idx as usize]);
            }
        }
        if self.st.marker != 0 {
            // ran into a marker: libjpeg substitutes zero coefficients
            return Ok(0);
        }
        Err(Error::Engine("corrupt JPEG data: bad Huffman code"))
    }
}

#[inline]
fn extend(bits: u32, size: u8) -> i32 {
    let half = 1u32 << (size as u32 - 1);
    if bits < half {
        bits as i32 - ((1u32 << size as u32) as i32 - 1)
    } else {
        bits as i32
    }
}

// coefficients are held in 16 bits before dequantisation, like libjpeg's
// JCOEF, so the product always fits an i32
#[inline]
fn dequantise(coef: i32, q: u16) -> i32 {
    coef as i16 as i32 * q as i32
}

/// Spectral selection and point transform of the scan being decoded.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct Spectral {
    pub se: usize,
    pub al: u8,
}

/// Decode one 8x8 block into dequantised natural-order coefficients.
/// `qt` is in zig-zag order as stored in DQT.
pub(super) fn decode_block<R: EntropyInput>(
    r: &mut BitReader<'_, R>,
    dc_ht: &HuffTable,
    ac_ht: &HuffTable,
    dc_pred: &mut i32,
    qt: &[u16; 64],
    blk: &mut [i32; 64],
    spec: Spectral,
) -> Result<()> {
    blk.fill(0);

    let dc_size = r.decode(dc_ht)?;
    if dc_size > 0 {
        if dc_size > 11 {
            return Err(Error::Engine("corrupt JPEG data: DC size > 11"));
        }
        let bits = r.read_bits(dc_size)?;
        *dc_pred = dc_pred.wrapping_add(extend(bits, dc_size));
    }
    blk[0] = dequantise(*dc_pred << spec.al, qt[0]);

    let mut k: usize = 1;
    while k <= spec.se {
        let sym = r.decode(ac_ht)?;
        let run = (sym >> 4) as usize;
        let size = sym & 0x0F;
        if size == 0 {
            if run == 15 {
                k += 16;
            } else {
                break;
            }
        } else {
            k += run;
            if k > spec.se {
                return Err(Error::Engine("corrupt JPEG data: AC index overflow"));
            }
            let bits = r.read_bits(size)?;
            let val = extend(bits, size);
            blk[ZZ[k]] = dequantise(val << spec.al, qt[k]);
            k += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bytes<'a>(&'a [u8], usize);

    impl EntropyInput for Bytes<'_> {
        fn read_byte(&mut self) -> Result<u8> {
            let b = *self.0.get(self.1).unwrap_or(&0);
            self.1 += 1;
            Ok(b)
        }
    }

    fn single_code_table(symbol: u8) -> HuffTable {
        let mut bits = [0u8; 16];
        bits[0] = 1;
        let mut t = HuffTable::default();
        t.build(&bits, &[symbol]).unwrap();
        t
    }

    #[test]
    fn stuffed_ff_is_data_and_marker_is_stashed() {
        let mut st = BitState::default();
        let mut r = BitReader::new(Bytes(&[0xFF, 0x00, 0xAB, 0xFF, 0xD9], 0), &mut st);
        assert_eq!(r.read_bits(8).unwrap(), 0xFF);
        assert_eq!(r.read_bits(8).unwrap(), 0xAB);
        assert!(!r.state().overrun);
        assert_eq!(r.read_bits(8).unwrap(), 0);
        assert_eq!(st.marker, 0xD9);
        assert!(st.overrun);
    }

    #[test]
    fn short_and_long_codes_decode() {
        // one 1-bit code (0 -> 'a'), one 9-bit code (0b1_0000_0000 -> 'b')
        let mut bits = [0u8; 16];
        bits[0] = 1;
        bits[8] = 1;
        let mut t = HuffTable::default();
        t.build(&bits, b"ab").unwrap();

        let mut st = BitState::default();
        // 0 | 100000000 | padding 1s
        let mut r = BitReader::new(Bytes(&[0b0100_0000, 0b0011_1111], 0), &mut st);
        assert_eq!(r.decode(&t).unwrap(), b'a');
        assert_eq!(r.decode(&t).unwrap(), b'b');
    }

    #[test]
    fn oversubscribed_table_is_rejected() {
        let mut bits = [0u8; 16];
        bits[0] = 3;
        let mut t = HuffTable::default();
        assert!(t.build(&bits, &[1, 2, 3]).is_err());
    }

    #[test]
    fn dc_only_block_is_dequantised() {
        // DC category 2, bits 11 -> +3; AC EOB
        let dc = {
            let mut bits = [0u8; 16];
            bits[0] = 1;
            let mut t = HuffTable::default();
            t.build(&bits, &[2]).unwrap();
            t
        };
        let ac = single_code_table(0x00);
        let qt = [2u16; 64];
        let mut st = BitState::default();
        // 0 (dc sym) 11 (bits) 0 (eob) -> 0110_0000
        let mut r = BitReader::new(Bytes(&[0b0110_0000], 0), &mut st);
        let mut pred = 0;
        let mut blk = [0i32; 64];
        decode_block(&mut r, &dc, &ac, &mut pred, &qt, &mut blk, Spectral { se: 63, al: 0 }).unwrap();
        assert_eq!(pred, 3);
        assert_eq!(blk[0], 6);
        assert!(blk[1..].iter().all(|&c| c == 0));
    }

    #[test]
    fn dc_predictor_wraps_on_hostile_input() {
        // DC category 11 with all-ones bits (+2047), then EOB
        let dc = single_code_table(11);
        let ac = single_code_table(0x00);
        let qt = [2u16; 64];
        let mut st = BitState::default();
        let mut r = BitReader::new(Bytes(&[0x7F, 0xF7], 0), &mut st);
        let mut pred = i32::MAX - 10;
        let mut blk = [0i32; 64];
        decode_block(&mut r, &dc, &ac, &mut pred, &qt, &mut blk, Spectral { se: 63, al: 0 }).unwrap();
        assert_eq!(pred, (i32::MAX - 10).wrapping_add(2047));
        assert_eq!(blk[0], pred as i16 as i32 * 2);
    }

    #[test]
    fn largest_ac_times_sixteen_bit_quantiser_fits() {
        // AC codes: 00 -> run 0 size 15, 01 -> EOB
        let mut bits = [0u8; 16];
        bits[1] = 2;
        let mut ac = HuffTable::default();
        ac.build(&bits, &[0x0F, 0x00]).unwrap();
        let dc = single_code_table(0);
        let qt = [u16::MAX; 64];
        let mut st = BitState::default();
        // 0 | 00 | fifteen 1s | 01 | padding, with the 0xFF stuffed
        let mut r = BitReader::new(Bytes(&[0x1F, 0xFF, 0x00, 0xDF], 0), &mut st);
        let mut pred = 0;
        let mut blk = [0i32; 64];
        decode_block(&mut r, &dc, &ac, &mut pred, &qt, &mut blk, Spectral { se: 63, al: 0 }).unwrap();
        assert_eq!(blk[1], 32767 * 65535);

        let mut out = [0u8; 64];
        crate::decoder::idct::idct(&blk, &mut out);
    }

    #[test]
    fn extend_handles_negative_range() {
        assert_eq!(extend(0, 1), -1);
        assert_eq!(extend(1, 1), 1);
        assert_eq!(extend(0b00, 2), -3);
        assert_eq!(extend(0b11, 2), 3);
    }
}
