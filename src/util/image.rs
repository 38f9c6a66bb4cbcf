use rayon::prelude::*;

use crate::error::{Result, SaveError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlphaMode {
    /// Always write an alpha channel, fully opaque.
    Opaque,
    /// Write the source alpha when there is one, otherwise opaque.
    Preserve,
    /// Write RGB only.
    Drop,
}

impl Default for AlphaMode {
    fn default() -> Self {
        AlphaMode::Opaque
    }
}

/// Normalized floating point raster with shape (height, width, channels).
#[derive(Debug, Clone, PartialEq)]
pub struct FloatImage {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<f32>,
}

impl FloatImage {
    pub fn new(width: usize, height: usize, channels: usize, data: Vec<f32>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(SaveError::invalid_image(format!("empty dimensions {}x{}", width, height)));
        }

        if !(1..=4).contains(&channels) {
            return Err(SaveError::invalid_image(format!("unsupported channel count {}", channels)));
        }

        if data.len() != width * height * channels {
            return Err(SaveError::invalid_image(format!(
                "expected {} samples for {}x{}x{}, got {}",
                width * height * channels, width, height, channels, data.len()
            )));
        }

        Ok(FloatImage { width, height, channels, data })
    }

    pub fn from_fn(width: usize, height: usize, channels: usize, generate: impl Fn(usize, usize, usize) -> f32) -> Result<Self> {
        let mut data = Vec::with_capacity(width * height * channels);

        for y in 0..height {
            for x in 0..width {
                for c in 0..channels {
                    data.push(generate(x, y, c));
                }
            }
        }

        FloatImage::new(width, height, channels, data)
    }

    pub fn from_dynamic(image: &image::DynamicImage) -> Result<Self> {
        let has_alpha = image.color().has_alpha();

        if has_alpha {
            let rgba = image.to_rgba32f();
            FloatImage::new(rgba.width() as usize, rgba.height() as usize, 4, rgba.into_raw())
        } else {
            let rgb = image.to_rgb32f();
            FloatImage::new(rgb.width() as usize, rgb.height() as usize, 3, rgb.into_raw())
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn has_alpha(&self) -> bool {
        self.channels == 2 || self.channels == 4
    }

    pub fn pixel(&self, x: usize, y: usize) -> &[f32] {
        let k = (y * self.width + x) * self.channels;
        &self.data[k..k + self.channels]
    }

    /// Linear RGBA of one pixel without quantization, alpha 1.0 when absent.
    pub fn rgba(&self, x: usize, y: usize) -> (f32, f32, f32, f32) {
        let p = self.pixel(x, y);

        match p.len() {
            1 => (p[0], p[0], p[0], 1.0),
            2 => (p[0], p[0], p[0], p[1]),
            3 => (p[0], p[1], p[2], 1.0),
            _ => (p[0], p[1], p[2], p[3]),
        }
    }

    /// Number of channels written for the given alpha mode.
    pub fn output_channels(&self, alpha: AlphaMode) -> usize {
        match alpha {
            AlphaMode::Opaque => 4,
            AlphaMode::Preserve if self.has_alpha() => 4,
            AlphaMode::Preserve | AlphaMode::Drop => 3,
        }
    }

    /// Interleaved RGB or RGBA samples scaled to 16 bits.
    pub fn to_rgba16(&self, alpha: AlphaMode) -> Vec<u16> {
        self.to_interleaved(alpha, u16::MAX, |v| quantize(v, u16::MAX as f32) as u16)
    }

    /// Interleaved RGB or RGBA samples scaled to 8 bits.
    pub fn to_rgba8(&self, alpha: AlphaMode) -> Vec<u8> {
        self.to_interleaved(alpha, u8::MAX, |v| quantize(v, u8::MAX as f32) as u8)
    }

    fn to_interleaved<T: Copy + Send + Sync>(&self, alpha: AlphaMode, opaque: T, convert: impl Fn(f32) -> T + Sync) -> Vec<T> {
        let out_channels = self.output_channels(alpha);
        let in_channels = self.channels;
        let keep_alpha = alpha != AlphaMode::Opaque && self.has_alpha();

        let mut buffer = vec![opaque; self.width * self.height * out_channels];

        buffer
            .par_chunks_mut(self.width * out_channels)
            .zip(self.data.par_chunks(self.width * in_channels))
            .for_each(|(row_out, row_in)| {
                for (out, p) in row_out.chunks_exact_mut(out_channels).zip(row_in.chunks_exact(in_channels)) {
                    let (r, g, b) = if in_channels < 3 { (p[0], p[0], p[0]) } else { (p[0], p[1], p[2]) };

                    out[0] = convert(r);
                    out[1] = convert(g);
                    out[2] = convert(b);

                    if out_channels == 4 && keep_alpha {
                        out[3] = convert(p[in_channels - 1]);
                    }
                }
            });

        buffer
    }
}

/// Clamps to [0, 1] and scales by `max`, truncating like a float to integer cast. NaN maps to 0.
#[inline]
pub fn quantize(value: f32, max: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }

    (value.clamp(0.0, 1.0) * max).trunc()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_buffers() {
        assert!(FloatImage::new(2, 2, 3, vec![0.0; 11]).is_err());
        assert!(FloatImage::new(2, 2, 5, vec![0.0; 20]).is_err());
        assert!(FloatImage::new(0, 2, 3, vec![]).is_err());
        assert!(FloatImage::new(2, 2, 3, vec![0.0; 12]).is_ok());
    }

    #[test]
    fn quantizes_with_clamping() {
        assert_eq!(quantize(1.0, 65535.0), 65535.0);
        assert_eq!(quantize(0.5, 65535.0), 32767.0);
        assert_eq!(quantize(-3.0, 65535.0), 0.0);
        assert_eq!(quantize(7.0, 255.0), 255.0);
        assert_eq!(quantize(f32::NAN, 255.0), 0.0);
    }

    #[test]
    fn opaque_mode_adds_full_alpha() {
        let image = FloatImage::new(1, 1, 4, vec![1.0, 0.0, 0.5, 0.25]).unwrap();
        assert_eq!(image.to_rgba16(AlphaMode::Opaque), vec![65535, 0, 32767, 65535]);
    }

    #[test]
    fn preserve_mode_keeps_source_alpha() {
        let image = FloatImage::new(1, 1, 4, vec![1.0, 0.0, 0.5, 0.25]).unwrap();
        assert_eq!(image.to_rgba16(AlphaMode::Preserve), vec![65535, 0, 32767, 16383]);

        let rgb = FloatImage::new(1, 1, 3, vec![1.0, 0.0, 0.5]).unwrap();
        assert_eq!(rgb.to_rgba16(AlphaMode::Preserve), vec![65535, 0, 32767]);
    }

    #[test]
    fn gray_is_replicated() {
        let image = FloatImage::new(2, 1, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        assert_eq!(image.to_rgba8(AlphaMode::Preserve), vec![255, 255, 255, 0, 0, 0, 0, 255]);
        assert_eq!(image.to_rgba8(AlphaMode::Drop), vec![255, 255, 255, 0, 0, 0]);
    }

    #[test]
    fn rows_keep_their_order() {
        let image = FloatImage::from_fn(2, 3, 1, |_, y, _| y as f32 / 2.0).unwrap();
        let out = image.to_rgba8(AlphaMode::Drop);

        assert_eq!(&out[0..6], &[0; 6]);
        assert_eq!(&out[6..12], &[127; 6]);
        assert_eq!(&out[12..18], &[255; 6]);
    }
}
