use std::path::{Path, PathBuf};

use config::{Config, ConfigError, File};
use tracing::debug;

use crate::encoder::{ExrCompression, ExrPrecision, OutputFormat, PngCompression};
use crate::error::{Result, SaveError};
use crate::pipeline::{BatchNumbering, ErrorPolicy, OutputType};
use crate::util::{AlphaMode, SuffixStyle};

pub const DEFAULT_PREFIX: &str = "ComfyUI_EXR";

#[derive(Debug, Clone)]
pub struct SaveSettings {
    pub output_directory: PathBuf,
    pub filename_prefix: String,
    pub prefix_append: String,
    pub output_type: OutputType,
    pub format: OutputFormat,
    pub alpha: AlphaMode,
    pub png_compression: PngCompression,
    pub exr_precision: ExrPrecision,
    pub exr_compression: ExrCompression,
    pub suffix_style: SuffixStyle,
    pub batch_numbering: BatchNumbering,
    pub reserve: bool,
    pub embed_metadata: bool,
    pub on_error: ErrorPolicy,
}

impl Default for SaveSettings {
    fn default() -> Self {
        SaveSettings {
            output_directory: PathBuf::from("./output/"),
            filename_prefix: DEFAULT_PREFIX.to_owned(),
            prefix_append: String::new(),
            output_type: OutputType::Output,
            format: OutputFormat::Png16,
            alpha: AlphaMode::Opaque,
            png_compression: PngCompression::Default,
            exr_precision: ExrPrecision::Half,
            exr_compression: ExrCompression::Fast,
            suffix_style: SuffixStyle::TrailingUnderscore,
            batch_numbering: BatchNumbering::Rescan,
            reserve: false,
            embed_metadata: true,
            on_error: ErrorPolicy::Abort,
        }
    }
}

impl SaveSettings {
    /// Reads a settings file (any format the `config` crate understands).
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path))
            .build()
            .map_err(SaveError::config)?;

        SaveSettings::from_config(&settings)
    }

    /// Missing keys keep their defaults, malformed values are errors.
    pub fn from_config(settings: &Config) -> Result<Self> {
        let mut out = SaveSettings::default();

        if let Some(value) = lookup(settings.get_string("output_directory"))? {
            out.output_directory = PathBuf::from(value);
        }
        if let Some(value) = lookup(settings.get_string("filename_prefix"))? {
            out.filename_prefix = value;
        }
        if let Some(value) = lookup(settings.get_string("prefix_append"))? {
            out.prefix_append = value;
        }
        if let Some(value) = lookup(settings.get_string("output_type"))? {
            out.output_type = match value.as_str() {
                "output" => OutputType::Output,
                "temp" => OutputType::Temp,
                _ => return Err(SaveError::config(format!("unknown output_type: {}", value))),
            };
        }
        if let Some(value) = lookup(settings.get_string("format"))? {
            out.format = value.parse().map_err(SaveError::config)?;
        }
        if let Some(value) = lookup(settings.get_string("alpha"))? {
            out.alpha = match value.as_str() {
                "opaque" => AlphaMode::Opaque,
                "preserve" => AlphaMode::Preserve,
                "drop" => AlphaMode::Drop,
                _ => return Err(SaveError::config(format!("unknown alpha mode: {}", value))),
            };
        }
        if let Some(value) = lookup(settings.get_string("png_compression"))? {
            out.png_compression = match value.as_str() {
                "fast" => PngCompression::Fast,
                "default" => PngCompression::Default,
                "best" => PngCompression::Best,
                _ => return Err(SaveError::config(format!("unknown png_compression: {}", value))),
            };
        }
        if let Some(value) = lookup(settings.get_string("exr_precision"))? {
            out.exr_precision = match value.as_str() {
                "half" | "f16" => ExrPrecision::Half,
                "float" | "f32" => ExrPrecision::Float,
                _ => return Err(SaveError::config(format!("unknown exr_precision: {}", value))),
            };
        }
        if let Some(value) = lookup(settings.get_string("exr_compression"))? {
            out.exr_compression = match value.as_str() {
                "none" => ExrCompression::None,
                "fast" => ExrCompression::Fast,
                "small" => ExrCompression::Small,
                _ => return Err(SaveError::config(format!("unknown exr_compression: {}", value))),
            };
        }
        if let Some(value) = lookup(settings.get_bool("trailing_underscore"))? {
            out.suffix_style = if value { SuffixStyle::TrailingUnderscore } else { SuffixStyle::Plain };
        }
        if let Some(value) = lookup(settings.get_string("batch_numbering"))? {
            out.batch_numbering = match value.as_str() {
                "rescan" => BatchNumbering::Rescan,
                "sequential" => BatchNumbering::Sequential,
                _ => return Err(SaveError::config(format!("unknown batch_numbering: {}", value))),
            };
        }
        if let Some(value) = lookup(settings.get_bool("reserve"))? {
            out.reserve = value;
        }
        if let Some(value) = lookup(settings.get_bool("embed_metadata"))? {
            out.embed_metadata = value;
        }
        if let Some(value) = lookup(settings.get_string("on_error"))? {
            out.on_error = match value.as_str() {
                "abort" => ErrorPolicy::Abort,
                "continue" => ErrorPolicy::Continue,
                _ => return Err(SaveError::config(format!("unknown on_error policy: {}", value))),
            };
        }

        debug!("{:?}", out);

        Ok(out)
    }
}

fn lookup<T>(found: std::result::Result<T, ConfigError>) -> Result<Option<T>> {
    match found {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(error) => Err(SaveError::config(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn parse(toml: &str) -> Result<SaveSettings> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .map_err(SaveError::config)?;

        SaveSettings::from_config(&settings)
    }

    #[test]
    fn empty_file_keeps_defaults() {
        let settings = parse("").unwrap();

        assert_eq!(settings.filename_prefix, DEFAULT_PREFIX);
        assert_eq!(settings.format, OutputFormat::Png16);
        assert_eq!(settings.suffix_style, SuffixStyle::TrailingUnderscore);
        assert_eq!(settings.batch_numbering, BatchNumbering::Rescan);
        assert!(settings.embed_metadata);
    }

    #[test]
    fn reads_every_key() {
        let settings = parse(
            r#"
            output_directory = "/tmp/renders"
            filename_prefix = "shots/img_%batch_num%"
            format = "exr"
            alpha = "preserve"
            exr_precision = "float"
            exr_compression = "small"
            trailing_underscore = false
            batch_numbering = "sequential"
            reserve = true
            embed_metadata = false
            on_error = "continue"
            output_type = "temp"
            "#,
        )
        .unwrap();

        assert_eq!(settings.output_directory, PathBuf::from("/tmp/renders"));
        assert_eq!(settings.filename_prefix, "shots/img_%batch_num%");
        assert_eq!(settings.format, OutputFormat::Exr);
        assert_eq!(settings.alpha, AlphaMode::Preserve);
        assert_eq!(settings.exr_precision, ExrPrecision::Float);
        assert_eq!(settings.exr_compression, ExrCompression::Small);
        assert_eq!(settings.suffix_style, SuffixStyle::Plain);
        assert_eq!(settings.batch_numbering, BatchNumbering::Sequential);
        assert!(settings.reserve);
        assert!(!settings.embed_metadata);
        assert_eq!(settings.on_error, ErrorPolicy::Continue);
        assert_eq!(settings.output_type, OutputType::Temp);
    }

    #[test]
    fn rejects_unknown_values() {
        assert!(matches!(parse(r#"format = "bmp""#), Err(SaveError::Config(_))));
        assert!(matches!(parse(r#"batch_numbering = "random""#), Err(SaveError::Config(_))));
    }

    #[test]
    fn rejects_values_of_the_wrong_type() {
        assert!(matches!(parse(r#"reserve = "maybe""#), Err(SaveError::Config(_))));
        assert!(matches!(parse(r#"embed_metadata = "sometimes""#), Err(SaveError::Config(_))));
        assert!(matches!(parse(r#"trailing_underscore = [true]"#), Err(SaveError::Config(_))));
        assert!(matches!(parse(r#"filename_prefix = { stem = "out" }"#), Err(SaveError::Config(_))));
    }
}
