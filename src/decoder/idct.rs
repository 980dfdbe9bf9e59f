//! Integer inverse DCT (IJG "islow": two passes, 13-bit constants).

use core::num::Wrapping as W;

const CB: i32 = 13;
const P1: i32 = 2;
const F0298: i32 = 2446;
const F0390: i32 = 3196;
const F0541: i32 = 4433;
const F0765: i32 = 6270;
const F0899: i32 = 7373;
const F1175: i32 = 9633;
const F1501: i32 = 12299;
const F1847: i32 = 15137;
const F1961: i32 = 16069;
const F2053: i32 = 16819;
const F2562: i32 = 20995;
const F3072: i32 = 25172;

// one 1-D pass over 8 inputs; returns the outputs still scaled by 2^CB.
// Corrupt coefficients may overflow: arithmetic wraps, as libjpeg's does.
#[inline]
fn pass(d: [i32; 8]) -> [i32; 8] {
    let d = d.map(W);

    let z1 = (d[2] + d[6]) * W(F0541);
    let tmp2 = z1 + d[6] * W(-F1847);
    let tmp3 = z1 + d[2] * W(F0765);
    let tmp0 = (d[0] + d[4]) << CB as usize;
    let tmp1 = (d[0] - d[4]) << CB as usize;
    let (t10, t13) = (tmp0 + tmp3, tmp0 - tmp3);
    let (t11, t12) = (tmp1 + tmp2, tmp1 - tmp2);

    let (z1, z2, z3, z4) = (d[7] + d[1], d[5] + d[3], d[7] + d[3], d[5] + d[1]);
    let z5 = (z3 + z4) * W(F1175);
    let (s1, s2) = (z1 * W(-F0899), z2 * W(-F2562));
    let s3 = z3 * W(-F1961) + z5;
    let s4 = z4 * W(-F0390) + z5;
    let o0 = d[7] * W(F0298) + s1 + s3;
    let o1 = d[5] * W(F2053) + s2 + s4;
    let o2 = d[3] * W(F3072) + s2 + s3;
    let o3 = d[1] * W(F1501) + s1 + s4;

    [
        t10 + o3,
        t11 + o2,
        t12 + o1,
        t13 + o0,
        t13 - o0,
        t12 - o1,
        t11 - o2,
        t10 - o3,
    ]
    .map(|v| v.0)
}

#[inline]
fn ac_is_zero(d: &[i32; 8]) -> bool {
    d[1..].iter().all(|&v| v == 0)
}

/// Transform dequantised coefficients (natural order) into 8x8 samples.
pub(super) fn idct(block: &[i32; 64], out: &mut [u8; 64]) {
    let mut ws = [0i32; 64];

    for row in 0..8 {
        let b = row * 8;
        let mut d = [0i32; 8];
        d.copy_from_slice(&block[b..b + 8]);
        if ac_is_zero(&d) {
            ws[b..b + 8].fill(d[0].wrapping_shl(P1 as u32));
            continue;
        }
        for (w, v) in ws[b..b + 8].iter_mut().zip(pass(d)) {
            *w = descale(v, CB - P1);
        }
    }

    for col in 0..8 {
        let d: [i32; 8] = core::array::from_fn(|i| ws[col + i * 8]);
        if ac_is_zero(&d) {
            let v = clamp(descale(d[0], P1 + 3) + 128);
            for i in 0..8 {
                out[col + i * 8] = v;
            }
            continue;
        }
        for (i, v) in pass(d).into_iter().enumerate() {
            out[col + i * 8] = clamp(descale(v, CB + P1 + 3) + 128);
        }
    }
}

#[inline]
fn descale(x: i32, n: i32) -> i32 {
    x.wrapping_add(1 << (n - 1)) >> n
}

#[inline]
pub(super) fn clamp(x: i32) -> u8 {
    x.clamp(0, 255) as u8
}
