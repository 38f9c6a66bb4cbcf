use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::encoder::{encoder_for, ImageEncoder, ImageMetadata};
use crate::error::{Result, SaveError};
use crate::resolver::{OutputDirResolver, PathResolver};
use crate::settings::SaveSettings;
use crate::util::{elapsed_ms, AllocatedFilename, FilenameAllocator, FloatImage, SuffixStyle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Output,
    Temp,
}

/// How sequence numbers are picked for the images of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchNumbering {
    /// Every image rescans the directory and only sees files already written.
    Rescan,
    /// Every image also gets a number above the one handed to the previous image.
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    Abort,
    Continue,
}

/// Descriptor of one written file, as reported back to the host UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedImage {
    pub filename: String,
    pub subfolder: String,
    #[serde(rename = "type")]
    pub kind: OutputType,
}

pub trait ResultSink {
    fn record(&mut self, image: SavedImage);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveResults {
    pub images: Vec<SavedImage>,
}

impl SaveResults {
    pub fn to_ui(&self) -> Value {
        json!({ "ui": { "images": self.images } })
    }
}

impl ResultSink for SaveResults {
    fn record(&mut self, image: SavedImage) {
        self.images.push(image);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedImage {
    pub batch_index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub saved: Vec<PathBuf>,
    pub failed: Vec<FailedImage>,
}

pub struct SavePipeline<R: PathResolver> {
    resolver: R,
    encoder: Box<dyn ImageEncoder>,
    allocator: FilenameAllocator,
    numbering: BatchNumbering,
    reserve: bool,
    embed_metadata: bool,
    on_error: ErrorPolicy,
    output_type: OutputType,
    prefix_append: String,
}

impl SavePipeline<OutputDirResolver> {
    pub fn from_settings(settings: &SaveSettings) -> Result<Self> {
        let resolver = OutputDirResolver::new(settings.output_directory.clone());
        SavePipeline::with_resolver(resolver, encoder_for(settings), settings)
    }
}

impl<R: PathResolver> SavePipeline<R> {
    pub fn with_resolver(resolver: R, encoder: Box<dyn ImageEncoder>, settings: &SaveSettings) -> Result<Self> {
        let allocator = FilenameAllocator::new(encoder.extension(), settings.suffix_style)?;

        Ok(SavePipeline {
            resolver,
            encoder,
            allocator,
            numbering: settings.batch_numbering,
            reserve: settings.reserve,
            embed_metadata: settings.embed_metadata,
            on_error: settings.on_error,
            output_type: settings.output_type,
            prefix_append: settings.prefix_append.clone(),
        })
    }

    pub fn new(resolver: R, encoder: Box<dyn ImageEncoder>, style: SuffixStyle) -> Result<Self> {
        let settings = SaveSettings {
            suffix_style: style,
            ..SaveSettings::default()
        };

        SavePipeline::with_resolver(resolver, encoder, &settings)
    }

    /// Writes every image of the batch and records each written file in `sink`.
    ///
    /// With `ErrorPolicy::Abort` the first failing image ends the batch; images saved
    /// before it stay on disk and in the sink.
    pub fn save_batch(&self, images: &[FloatImage], filename_prefix: &str, metadata: Option<&ImageMetadata>, sink: &mut dyn ResultSink) -> Result<BatchReport> {
        let first = images.first().ok_or(SaveError::EmptyBatch)?;

        let prefix = format!("{}{}", filename_prefix, self.prefix_append);
        let resolved = self.resolver.resolve(&prefix, first.width(), first.height())?;

        let metadata = if self.embed_metadata { metadata.filter(|m| !m.is_empty()) } else { None };

        let time = Instant::now();
        let mut report = BatchReport::default();
        let mut last_sequence = 0;

        for (batch_index, image) in images.iter().enumerate() {
            let floor = match self.numbering {
                BatchNumbering::Rescan => 0,
                BatchNumbering::Sequential => last_sequence,
            };

            // a failed write still uses up its number
            let result = self.allocate(&resolved.full_output_folder, &resolved.filename, batch_index, floor).and_then(|allocated| {
                last_sequence = allocated.sequence_number;
                self.write(image, &allocated, metadata)?;
                Ok(allocated)
            });

            match result {
                Ok(allocated) => {
                    sink.record(SavedImage {
                        filename: allocated.file_name(),
                        subfolder: resolved.subfolder.clone(),
                        kind: self.output_type,
                    });

                    report.saved.push(allocated.full_path);
                }
                Err(error) => match self.on_error {
                    ErrorPolicy::Abort => return Err(error),
                    ErrorPolicy::Continue => {
                        warn!("image {} of batch not saved: {}", batch_index, error);

                        report.failed.push(FailedImage {
                            batch_index,
                            reason: error.to_string(),
                        });
                    }
                },
            }
        }

        info!(
            "{:<14}{:>6} ms ({} saved, {} failed, {})",
            "Saving",
            elapsed_ms(time),
            report.saved.len(),
            report.failed.len(),
            resolved.full_output_folder.display()
        );

        Ok(report)
    }

    fn allocate(&self, folder: &Path, stem: &str, batch_index: usize, floor: u32) -> Result<AllocatedFilename> {
        if self.reserve {
            self.allocator.reserve_after(folder, stem, batch_index, floor)
        } else {
            self.allocator.allocate_after(folder, stem, batch_index, floor)
        }
    }

    fn write(&self, image: &FloatImage, allocated: &AllocatedFilename, metadata: Option<&ImageMetadata>) -> Result<()> {
        let time = Instant::now();

        let written = self
            .encoder
            .encode(image, metadata)
            .and_then(|bytes| write_replacing(&allocated.full_path, &bytes));

        if let Err(error) = written {
            if self.reserve {
                let _ = fs::remove_file(&allocated.full_path);
            }

            return Err(error);
        }

        debug!("{:<14}{:>6} ms {}", "Encoding", elapsed_ms(time), allocated.full_path.display());

        Ok(())
    }
}

/// Writes `bytes` to a temporary sibling of `path`, then renames it into place.
pub fn write_replacing(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
    let tmp = parent.join(format!("._{}_tmp_{}", name, std::process::id()));

    fs::write(&tmp, bytes)?;

    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(_) => {
            // rename cannot overwrite on some platforms
            let _ = fs::remove_file(path);
            fs::rename(&tmp, path).map_err(|error| {
                let _ = fs::remove_file(&tmp);
                error.into()
            })
        }
    }
}
