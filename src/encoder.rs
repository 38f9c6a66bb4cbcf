use std::io::Cursor;

use exr::meta::attribute::{AttributeValue, Text};
use exr::prelude::{AnyChannel, AnyChannels, Encoding, FlatSamples, Image, Layer, LayerAttributes, WritableImage};
use half::f16;
use serde_json::{Map, Value};
use smallvec::{smallvec, SmallVec};
use tracing::{debug, warn};

use crate::error::Result;
use crate::settings::SaveSettings;
use crate::util::{AlphaMode, FloatImage};

/// Textual generation info embedded alongside the pixels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    pub prompt: Option<Value>,
    pub extra_pnginfo: Map<String, Value>,
}

impl ImageMetadata {
    /// Keyword and serialized JSON for every entry, `prompt` first.
    pub fn text_entries(&self) -> Result<Vec<(String, String)>> {
        let mut entries = Vec::with_capacity(self.extra_pnginfo.len() + 1);

        if let Some(prompt) = &self.prompt {
            entries.push(("prompt".to_owned(), serde_json::to_string(prompt)?));
        }

        for (key, value) in &self.extra_pnginfo {
            entries.push((key.clone(), serde_json::to_string(value)?));
        }

        Ok(entries)
    }

    pub fn is_empty(&self) -> bool {
        self.prompt.is_none() && self.extra_pnginfo.is_empty()
    }
}

/// Turns a float raster into the bytes of one image file.
pub trait ImageEncoder: Send + Sync {
    fn extension(&self) -> &str;

    fn encode(&self, image: &FloatImage, metadata: Option<&ImageMetadata>) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PngDepth {
    Eight,
    Sixteen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PngCompression {
    Fast,
    Default,
    Best,
}

#[derive(Debug, Clone)]
pub struct PngEncoder {
    pub depth: PngDepth,
    pub alpha: AlphaMode,
    pub compression: PngCompression,
}

impl PngEncoder {
    pub fn rgba16() -> Self {
        PngEncoder {
            depth: PngDepth::Sixteen,
            alpha: AlphaMode::Opaque,
            compression: PngCompression::Default,
        }
    }
}

impl ImageEncoder for PngEncoder {
    fn extension(&self) -> &str {
        "png"
    }

    fn encode(&self, image: &FloatImage, metadata: Option<&ImageMetadata>) -> Result<Vec<u8>> {
        let samples = match self.depth {
            PngDepth::Eight => image.to_rgba8(self.alpha),
            PngDepth::Sixteen => image
                .to_rgba16(self.alpha)
                .into_iter()
                .flat_map(u16::to_be_bytes)
                .collect(),
        };

        let mut bytes = Vec::new();

        {
            let mut encoder = png::Encoder::new(&mut bytes, image.width() as u32, image.height() as u32);

            encoder.set_color(match image.output_channels(self.alpha) {
                4 => png::ColorType::Rgba,
                _ => png::ColorType::Rgb,
            });
            encoder.set_depth(match self.depth {
                PngDepth::Eight => png::BitDepth::Eight,
                PngDepth::Sixteen => png::BitDepth::Sixteen,
            });
            encoder.set_compression(match self.compression {
                PngCompression::Fast => png::Compression::Fast,
                PngCompression::Default => png::Compression::Default,
                PngCompression::Best => png::Compression::Best,
            });

            if let Some(metadata) = metadata {
                for (keyword, text) in metadata.text_entries()? {
                    // tEXt is Latin-1 only
                    if text.chars().all(|c| (c as u32) < 0x100) {
                        encoder.add_text_chunk(keyword, text)?;
                    } else {
                        encoder.add_itxt_chunk(keyword, text)?;
                    }
                }
            }

            let mut writer = encoder.write_header()?;
            writer.write_image_data(&samples)?;
            writer.finish()?;
        }

        debug!("encoded {}x{} png, {} bytes", image.width(), image.height(), bytes.len());

        Ok(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExrPrecision {
    Half,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExrCompression {
    None,
    Fast,
    Small,
}

#[derive(Debug, Clone)]
pub struct ExrEncoder {
    pub precision: ExrPrecision,
    pub alpha: AlphaMode,
    pub compression: ExrCompression,
}

impl ExrEncoder {
    fn samples(&self, values: Vec<f32>) -> FlatSamples {
        match self.precision {
            ExrPrecision::Half => FlatSamples::F16(values.into_iter().map(f16::from_f32).collect()),
            ExrPrecision::Float => FlatSamples::F32(values),
        }
    }
}

impl ImageEncoder for ExrEncoder {
    fn extension(&self) -> &str {
        "exr"
    }

    fn encode(&self, image: &FloatImage, metadata: Option<&ImageMetadata>) -> Result<Vec<u8>> {
        let pixel_count = image.width() * image.height();
        let with_alpha = image.output_channels(self.alpha) == 4;
        let keep_alpha = self.alpha != AlphaMode::Opaque;

        let mut red = Vec::with_capacity(pixel_count);
        let mut green = Vec::with_capacity(pixel_count);
        let mut blue = Vec::with_capacity(pixel_count);
        let mut alpha = Vec::with_capacity(if with_alpha { pixel_count } else { 0 });

        for y in 0..image.height() {
            for x in 0..image.width() {
                let (r, g, b, a) = image.rgba(x, y);

                red.push(r);
                green.push(g);
                blue.push(b);

                if with_alpha {
                    alpha.push(if keep_alpha { a } else { 1.0 });
                }
            }
        }

        let mut channels: SmallVec<[AnyChannel<FlatSamples>; 4]> = smallvec![
            AnyChannel::new("R", self.samples(red)),
            AnyChannel::new("G", self.samples(green)),
            AnyChannel::new("B", self.samples(blue)),
        ];

        if with_alpha {
            channels.push(AnyChannel::new("A", self.samples(alpha)));
        }

        let mut attributes = LayerAttributes::named("rgba");
        attributes.software_name = Some(Text::from("hdr_save"));

        if let Some(metadata) = metadata {
            for (key, value) in metadata.text_entries()? {
                match (Text::new_or_none(&key), Text::new_or_none(&value)) {
                    (Some(key), Some(value)) => {
                        attributes.other.insert(key, AttributeValue::Text(value));
                    }
                    _ => warn!("skipping exr attribute {:?}: not representable as exr text", key),
                }
            }
        }

        let encoding = match self.compression {
            ExrCompression::None => Encoding::UNCOMPRESSED,
            ExrCompression::Fast => Encoding::FAST_LOSSLESS,
            ExrCompression::Small => Encoding::SMALL_LOSSLESS,
        };

        let layer = Layer::new((image.width(), image.height()), attributes, encoding, AnyChannels::sort(channels));

        let mut bytes = Vec::new();
        Image::from_layer(layer).write().to_buffered(Cursor::new(&mut bytes))?;

        debug!("encoded {}x{} exr, {} bytes", image.width(), image.height(), bytes.len());

        Ok(bytes)
    }
}

pub fn encoder_for(settings: &SaveSettings) -> Box<dyn ImageEncoder> {
    match settings.format {
        OutputFormat::Png16 => Box::new(PngEncoder {
            depth: PngDepth::Sixteen,
            alpha: settings.alpha,
            compression: settings.png_compression,
        }),
        OutputFormat::Png8 => Box::new(PngEncoder {
            depth: PngDepth::Eight,
            alpha: settings.alpha,
            compression: settings.png_compression,
        }),
        OutputFormat::Exr => Box::new(ExrEncoder {
            precision: settings.exr_precision,
            alpha: settings.alpha,
            compression: settings.exr_compression,
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Png8,
    Png16,
    Exr,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "png8" => Ok(OutputFormat::Png8),
            "png" | "png16" => Ok(OutputFormat::Png16),
            "exr" => Ok(OutputFormat::Exr),
            _ => Err(format!("unknown output format: {}", value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata() -> ImageMetadata {
        let mut extra = Map::new();
        extra.insert("workflow".to_owned(), json!({"nodes": [1, 2]}));

        ImageMetadata {
            prompt: Some(json!({"3": {"class_type": "KSampler"}})),
            extra_pnginfo: extra,
        }
    }

    #[test]
    fn text_entries_put_prompt_first() {
        let entries = metadata().text_entries().unwrap();

        assert_eq!(entries[0].0, "prompt");
        assert_eq!(entries[0].1, r#"{"3":{"class_type":"KSampler"}}"#);
        assert_eq!(entries[1], ("workflow".to_owned(), r#"{"nodes":[1,2]}"#.to_owned()));
    }

    #[test]
    fn png_carries_text_chunks() {
        let image = FloatImage::new(2, 2, 3, vec![0.5; 12]).unwrap();
        let bytes = PngEncoder::rgba16().encode(&image, Some(&metadata())).unwrap();

        let reader = png::Decoder::new(Cursor::new(bytes)).read_info().unwrap();
        let info = reader.info();

        assert_eq!(info.bit_depth, png::BitDepth::Sixteen);
        assert_eq!(info.color_type, png::ColorType::Rgba);
        assert!(info.uncompressed_latin1_text.iter().any(|t| t.keyword == "prompt"));
        assert!(info.uncompressed_latin1_text.iter().any(|t| t.keyword == "workflow"));
    }

    #[test]
    fn non_latin1_text_uses_itxt() {
        let image = FloatImage::new(1, 1, 3, vec![0.0; 3]).unwrap();
        let metadata = ImageMetadata {
            prompt: Some(json!("猫")),
            extra_pnginfo: Map::new(),
        };

        let bytes = PngEncoder::rgba16().encode(&image, Some(&metadata)).unwrap();
        let reader = png::Decoder::new(Cursor::new(bytes)).read_info().unwrap();

        assert!(reader.info().uncompressed_latin1_text.is_empty());
        assert_eq!(reader.info().utf8_text.len(), 1);
        assert_eq!(reader.info().utf8_text[0].keyword, "prompt");
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("PNG".parse::<OutputFormat>().unwrap(), OutputFormat::Png16);
        assert_eq!("png8".parse::<OutputFormat>().unwrap(), OutputFormat::Png8);
        assert_eq!("exr".parse::<OutputFormat>().unwrap(), OutputFormat::Exr);
        assert!("tiff".parse::<OutputFormat>().is_err());
    }
}
