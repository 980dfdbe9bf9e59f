//! Colorspace bookkeeping: the engine's default guess, the loader's
//! overrides on top of it, and output scale selection.
//!
//! The overrides are interop workarounds for specific encoders. Keep
//! the branch conditions exactly as they are.

use crate::decoder::ImageInfo;
use crate::error::Warning;

/// Colorspace codes, numbered like libjpeg's `J_COLOR_SPACE` so callers
/// that only carry integers stay compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ColorSpace {
    #[default]
    Unknown = 0,
    Grayscale = 1,
    Rgb = 2,
    YCbCr = 3,
    Cmyk = 4,
    Ycck = 5,
}

impl ColorSpace {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => ColorSpace::Unknown,
            1 => ColorSpace::Grayscale,
            2 => ColorSpace::Rgb,
            3 => ColorSpace::YCbCr,
            4 => ColorSpace::Cmyk,
            5 => ColorSpace::Ycck,
            _ => return None,
        })
    }

    /// Samples per pixel for this colorspace, or `None` when it depends
    /// on the image (Unknown).
    pub const fn components(self) -> Option<u8> {
        match self {
            ColorSpace::Unknown => None,
            ColorSpace::Grayscale => Some(1),
            ColorSpace::Rgb | ColorSpace::YCbCr => Some(3),
            ColorSpace::Cmyk | ColorSpace::Ycck => Some(4),
        }
    }
}

/// Guess the stored colorspace from component count, JFIF/Adobe markers
/// and component ids, the way libjpeg's `default_decompress_parms` does.
/// Sets both `jpeg_color_space` and `out_color_space`.
pub fn guess_color_space(info: &mut ImageInfo) -> Option<Warning> {
    let mut warning = None;
    let comps = info.components();
    let (jpeg, out) = match info.num_components {
        1 => (ColorSpace::Grayscale, ColorSpace::Grayscale),
        3 => {
            let jpeg = if info.saw_jfif_marker {
                ColorSpace::YCbCr
            } else if info.saw_adobe_marker {
                match info.adobe_transform {
                    0 => ColorSpace::Rgb,
                    1 => ColorSpace::YCbCr,
                    t => {
                        warning = Some(Warning::UnknownAdobeTransform(t));
                        ColorSpace::YCbCr
                    }
                }
            } else {
                let ids = (comps[0].id, comps[1].id, comps[2].id);
                match ids {
                    (1, 2, 3) => ColorSpace::YCbCr,
                    (b'R', b'G', b'B') => ColorSpace::Rgb,
                    // assume JFIF without the marker
                    _ => ColorSpace::YCbCr,
                }
            };
            (jpeg, ColorSpace::Rgb)
        }
        4 => {
            let jpeg = if info.saw_adobe_marker {
                match info.adobe_transform {
                    0 => ColorSpace::Cmyk,
                    2 => ColorSpace::Ycck,
                    t => {
                        warning = Some(Warning::UnknownAdobeTransform(t));
                        ColorSpace::Ycck
                    }
                }
            } else {
                ColorSpace::Cmyk
            };
            (jpeg, ColorSpace::Cmyk)
        }
        _ => (ColorSpace::Unknown, ColorSpace::Unknown),
    };
    info.jpeg_color_space = jpeg;
    info.out_color_space = out;
    warning
}

/// Apply the loader's overrides to the engine's guess.
///
/// - YCbCr with an Adobe marker whose transform is not 1: don't guess,
///   report Unknown so the caller treats the image as a raster.
/// - YCCK with an Adobe transform other than 2: Unknown. Otherwise ask
///   for RGB output; there is no YCCK output path.
/// - CMYK: if components 1 and 2 are both subsampled relative to
///   component 0 (horizontally or vertically), it is really YCCK.
///   Either way ask for RGB output.
pub fn adjust_color_space(info: &mut ImageInfo) {
    match info.jpeg_color_space {
        ColorSpace::YCbCr => {
            if info.saw_adobe_marker && info.adobe_transform != 1 {
                info.jpeg_color_space = ColorSpace::Unknown;
                info.out_color_space = ColorSpace::Unknown;
            }
        }
        ColorSpace::Ycck => {
            if info.saw_adobe_marker && info.adobe_transform != 2 {
                info.jpeg_color_space = ColorSpace::Unknown;
                info.out_color_space = ColorSpace::Unknown;
            } else {
                info.out_color_space = ColorSpace::Rgb;
            }
        }
        ColorSpace::Cmyk => {
            let c = info.components();
            if c.len() >= 3 {
                let (h0, h1, h2) = (c[0].h_samp, c[1].h_samp, c[2].h_samp);
                let (v0, v1, v2) = (c[0].v_samp, c[1].v_samp, c[2].v_samp);
                if (h1 > h0 && h2 > h0) || (v1 > v0 && v2 > v0) {
                    info.jpeg_color_space = ColorSpace::Ycck;
                }
            }
            info.out_color_space = ColorSpace::Rgb;
        }
        _ => {}
    }
}

/// Pick the IDCT scale denominator (1, 2, 4 or 8) for decoding an image
/// of `width`×`height` towards a `dest_width`×`dest_height` target. The
/// larger of the two axis ratios decides.
pub fn select_scale_denom(width: u32, height: u32, dest_width: u32, dest_height: u32) -> u8 {
    if width == 0 || height == 0 {
        return 1;
    }
    let x_scale = dest_width as f32 / width as f32;
    let y_scale = dest_height as f32 / height as f32;
    let max_scale = if x_scale > y_scale { x_scale } else { y_scale };

    if max_scale > 0.5 {
        1
    } else if max_scale > 0.25 {
        2
    } else if max_scale > 0.125 {
        4
    } else {
        8
    }
}
