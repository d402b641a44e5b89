//! Pixel frames and the brightness-cap post-processor.

use crate::color::Rgb8;

/// Pixels on the K1 strip: two 160-pixel physical channels back to back.
pub const PIXEL_COUNT: usize = 320;
pub const CHANNEL_LEN: usize = 160;

/// A finished RGB8 frame, `pixel_count * 3` bytes in physical order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFrame {
    bytes: Vec<u8>,
}

impl PixelFrame {
    pub fn black(pixel_count: usize) -> Self {
        Self {
            bytes: vec![0; pixel_count * 3],
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.bytes.len() / 3
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn pixel(&self, index: usize) -> Option<Rgb8> {
        self.bytes
            .get(index * 3..index * 3 + 3)
            .map(|px| Rgb8::new(px[0], px[1], px[2]))
    }

    pub fn set_pixel(&mut self, index: usize, c: Rgb8) {
        if let Some(px) = self.bytes.get_mut(index * 3..index * 3 + 3) {
            px.copy_from_slice(&[c.r, c.g, c.b]);
        }
    }

    /// Bytes of physical channel `n` (each `channel_len` pixels).
    pub fn channel(&self, n: usize, channel_len: usize) -> &[u8] {
        let start = (n * channel_len * 3).min(self.bytes.len());
        let end = ((n + 1) * channel_len * 3).min(self.bytes.len());
        &self.bytes[start..end]
    }

    pub fn peak(&self) -> u8 {
        self.bytes.iter().copied().max().unwrap_or(0)
    }

    /// Cap this frame in place. See [`apply_brightness_cap`].
    pub fn cap_brightness(&mut self, cap: u8) -> &mut Self {
        apply_brightness_cap(&mut self.bytes, cap);
        self
    }
}

/// Scale a frame so its brightest sample does not exceed `cap`.
///
/// Every sample is scaled by the same `cap / peak` factor so channel ratios
/// (and therefore hue) survive the cap. No-op at `cap == 255`, on an all-black
/// frame, or when the frame already sits under the cap.
pub fn apply_brightness_cap(frame: &mut [u8], cap: u8) -> &mut [u8] {
    if cap == u8::MAX {
        return frame;
    }
    let peak = frame.iter().copied().max().unwrap_or(0);
    if peak == 0 || peak <= cap {
        return frame;
    }

    let scale = f64::from(cap) / f64::from(peak);
    for v in frame.iter_mut() {
        *v = (f64::from(*v) * scale).round().clamp(0.0, 255.0) as u8;
    }
    frame
}

/// Convert a UI percentage (0–100) into a cap byte.
pub fn cap_percent_to_byte(percent: f64) -> u8 {
    ((percent / 100.0) * 255.0).round().clamp(0.0, 255.0) as u8
}
