//! Color math — sRGB8 ⇄ linear ⇄ OKLab ⇄ OKLCH, gradient LUTs, HSV.
//!
//! Gradients are interpolated in OKLCH so ramps look perceptually even on
//! the strip. HSV is kept only for cheap hue rotation of colors that have
//! already been rendered.

use std::fmt;

/// Default gradient lookup table length.
pub const LUT_STEPS: usize = 256;

/// Below this chroma a color is treated as having no meaningful hue.
const ACHROMATIC_CHROMA: f64 = 1e-4;

// ── Rgb8 ─────────────────────────────────────────────────────────────────────

/// One 8-bit sRGB sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Rgb8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb8 {
    pub const BLACK: Rgb8 = Rgb8::new(0, 0, 0);
    pub const WHITE: Rgb8 = Rgb8::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `#rrggbb`, `#rgb`, or the same without the leading `#`.
    pub fn from_hex(text: &str) -> Result<Self, ColorError> {
        let digits = text.trim().trim_start_matches('#');
        let invalid = || ColorError::InvalidHex(text.to_string());

        let expanded: String = match digits.len() {
            3 => digits.chars().flat_map(|c| [c, c]).collect(),
            6 => digits.to_string(),
            _ => return Err(invalid()),
        };

        let channel = |i: usize| {
            expanded
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(invalid)
        };
        Ok(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub fn to_oklch(self) -> Oklch {
        let lin = [
            srgb8_to_linear(self.r),
            srgb8_to_linear(self.g),
            srgb8_to_linear(self.b),
        ];
        linear_to_oklab(lin).to_oklch()
    }
}

impl fmt::Display for Rgb8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ColorError {
    #[error("invalid hex color: {0:?}")]
    InvalidHex(String),
}

// ── Transfer function ────────────────────────────────────────────────────────

/// Decode one sRGB byte to linear light in [0, 1].
pub fn srgb8_to_linear(v: u8) -> f64 {
    let c = f64::from(v) / 255.0;
    if c <= 0.040_45 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// Encode linear light to an sRGB byte, clamped and rounded.
pub fn linear_to_srgb8(v: f64) -> u8 {
    let c = v.clamp(0.0, 1.0);
    let encoded = if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    };
    (encoded * 255.0).round().clamp(0.0, 255.0) as u8
}

// ── OKLab / OKLCH ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Oklab {
    pub l: f64,
    pub a: f64,
    pub b: f64,
}

/// Polar OKLab. `h` is in degrees, [0, 360).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Oklch {
    pub l: f64,
    pub c: f64,
    pub h: f64,
}

impl Oklab {
    pub fn to_oklch(self) -> Oklch {
        Oklch {
            l: self.l,
            c: self.a.hypot(self.b),
            h: normalize_degrees(self.b.atan2(self.a).to_degrees()),
        }
    }
}

impl Oklch {
    pub fn to_oklab(self) -> Oklab {
        let rad = self.h.to_radians();
        Oklab {
            l: self.l,
            a: self.c * rad.cos(),
            b: self.c * rad.sin(),
        }
    }

    pub fn is_achromatic(self) -> bool {
        self.c < ACHROMATIC_CHROMA
    }
}

/// Linear sRGB → OKLab (reference LMS matrices).
pub fn linear_to_oklab([r, g, b]: [f64; 3]) -> Oklab {
    let l = 0.412_221_470_8 * r + 0.536_332_536_3 * g + 0.051_445_992_9 * b;
    let m = 0.211_903_498_2 * r + 0.680_699_545_1 * g + 0.107_396_956_6 * b;
    let s = 0.088_302_461_9 * r + 0.281_718_837_6 * g + 0.629_978_700_5 * b;

    let l_ = l.cbrt();
    let m_ = m.cbrt();
    let s_ = s.cbrt();

    Oklab {
        l: 0.210_454_255_3 * l_ + 0.793_617_785_0 * m_ - 0.004_072_046_8 * s_,
        a: 1.977_998_495_1 * l_ - 2.428_592_205_0 * m_ + 0.450_593_709_9 * s_,
        b: 0.025_904_037_1 * l_ + 0.782_771_766_2 * m_ - 0.808_675_766_0 * s_,
    }
}

/// OKLab → linear sRGB. The result may fall outside [0, 1].
pub fn oklab_to_linear(lab: Oklab) -> [f64; 3] {
    let l_ = lab.l + 0.396_337_777_4 * lab.a + 0.215_803_757_3 * lab.b;
    let m_ = lab.l - 0.105_561_345_8 * lab.a - 0.063_854_172_8 * lab.b;
    let s_ = lab.l - 0.089_484_177_5 * lab.a - 1.291_485_548_0 * lab.b;

    let l = l_ * l_ * l_;
    let m = m_ * m_ * m_;
    let s = s_ * s_ * s_;

    [
        4.076_741_662_1 * l - 3.307_711_591_3 * m + 0.230_969_929_2 * s,
        -1.268_438_004_6 * l + 2.609_757_401_1 * m - 0.341_319_396_5 * s,
        -0.004_196_086_3 * l - 0.703_418_614_7 * m + 1.707_614_701_0 * s,
    ]
}

fn normalize_degrees(h: f64) -> f64 {
    let wrapped = h.rem_euclid(360.0);
    // rem_euclid can return 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Interpolate two hue angles along the shortest arc.
pub fn lerp_hue(h1: f64, h2: f64, t: f64) -> f64 {
    let delta = (h2 - h1 + 540.0).rem_euclid(360.0) - 180.0;
    normalize_degrees(h1 + delta * t)
}

/// Build a `steps * 3` byte RGB8 ramp from `start` to `end` in OKLCH.
///
/// L and C move linearly, H takes the shortest arc. Out-of-gamut samples
/// are hard-clipped in linear sRGB; there is no gamut mapping.
pub fn build_gradient_lut(start: Rgb8, end: Rgb8, steps: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(steps * 3);
    if steps == 0 {
        return out;
    }

    let mut a = start.to_oklch();
    let mut b = end.to_oklch();
    // A gray endpoint has no hue of its own; borrow the other one.
    if a.is_achromatic() && !b.is_achromatic() {
        a.h = b.h;
    } else if b.is_achromatic() && !a.is_achromatic() {
        b.h = a.h;
    }

    let denom = (steps.max(2) - 1) as f64;
    for i in 0..steps {
        let t = i as f64 / denom;
        let lch = Oklch {
            l: a.l + (b.l - a.l) * t,
            c: a.c + (b.c - a.c) * t,
            h: lerp_hue(a.h, b.h, t),
        };
        let [r, g, bl] = oklab_to_linear(lch.to_oklab());
        out.push(linear_to_srgb8(r));
        out.push(linear_to_srgb8(g));
        out.push(linear_to_srgb8(bl));
    }
    out
}

/// Read sample `index` out of a packed RGB8 LUT.
pub fn lut_sample(lut: &[u8], index: usize) -> Rgb8 {
    match lut.get(index * 3..index * 3 + 3) {
        Some(px) => Rgb8::new(px[0], px[1], px[2]),
        None => Rgb8::BLACK,
    }
}

// ── HSV ──────────────────────────────────────────────────────────────────────

/// RGB8 → (h, s, v), each in [0, 1].
pub fn rgb_to_hsv(c: Rgb8) -> (f64, f64, f64) {
    let r = f64::from(c.r) / 255.0;
    let g = f64::from(c.g) / 255.0;
    let b = f64::from(c.b) / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let s = if max == 0.0 { 0.0 } else { delta / max };
    (h, s, max)
}

/// (h, s, v) in [0, 1] → RGB8.
pub fn hsv_to_rgb(h: f64, s: f64, v: f64) -> Rgb8 {
    let h6 = h.rem_euclid(1.0) * 6.0;
    let sector = h6.floor();
    let f = h6 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));

    let (r, g, b) = match sector as u8 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };
    let to_byte = |x: f64| (x * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgb8::new(to_byte(r), to_byte(g), to_byte(b))
}

/// Rotate a color's hue by `turns` (1.0 = 360°), keeping S and V.
pub fn rotate_hue(c: Rgb8, turns: f64) -> Rgb8 {
    let (h, s, v) = rgb_to_hsv(c);
    hsv_to_rgb((h + turns).rem_euclid(1.0), s, v)
}
