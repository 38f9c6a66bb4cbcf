use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::{Result, SaveError};

/// Token inside a stem that is replaced by the index of the image within its batch.
pub const BATCH_NUM_TOKEN: &str = "%batch_num%";

/// Sequence numbers are written zero padded to this many digits.
pub const SEQUENCE_WIDTH: usize = 5;

/// How many exclusive creation attempts `reserve` makes before giving up.
pub const MAX_RESERVE_ATTEMPTS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuffixStyle {
    /// `stem_00001_.png`
    TrailingUnderscore,
    /// `stem_00001.png`
    Plain,
}

impl Default for SuffixStyle {
    fn default() -> Self {
        SuffixStyle::TrailingUnderscore
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRequest {
    pub directory: PathBuf,
    pub stem: String,
    pub batch_index: usize,
    pub extension: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedFilename {
    pub full_path: PathBuf,
    pub sequence_number: u32,
}

impl AllocatedFilename {
    pub fn file_name(&self) -> String {
        self.full_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Picks the next free `<stem>_<sequence>` filename in a directory.
///
/// Nothing is cached between calls: every allocation lists the directory again, so
/// the result only depends on what is on disk at that moment. Two processes (or two
/// images of one batch that are not written in between) scanning the same directory
/// can therefore be handed the same number. `reserve` closes that gap by creating
/// the file exclusively.
#[derive(Debug, Clone)]
pub struct FilenameAllocator {
    extension: String,
    style: SuffixStyle,
}

impl FilenameAllocator {
    pub fn new(extension: &str, style: SuffixStyle) -> Result<Self> {
        let extension = extension.trim_start_matches('.');

        if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SaveError::InvalidExtension(extension.to_owned()));
        }

        Ok(FilenameAllocator {
            extension: extension.to_owned(),
            style,
        })
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn allocate(&self, directory: &Path, stem: &str, batch_index: usize) -> Result<AllocatedFilename> {
        self.allocate_after(directory, stem, batch_index, 0)
    }

    /// Same as `allocate`, except the sequence number is never below `floor + 1`.
    pub fn allocate_after(&self, directory: &Path, stem: &str, batch_index: usize, floor: u32) -> Result<AllocatedFilename> {
        let stem = substitute_batch_number(stem, batch_index)?;
        let highest = highest_sequence(directory, &stem)?;
        let sequence_number = highest
            .max(floor)
            .checked_add(1)
            .ok_or_else(|| SaveError::SequenceExhausted(stem.clone()))?;

        trace!("{:?}: highest existing {} for {}, next {}", directory, highest, stem, sequence_number);

        Ok(AllocatedFilename {
            full_path: directory.join(self.compose(&stem, sequence_number)),
            sequence_number,
        })
    }

    pub fn allocate_request(request: &OutputRequest, style: SuffixStyle) -> Result<AllocatedFilename> {
        FilenameAllocator::new(&request.extension, style)?.allocate(&request.directory, &request.stem, request.batch_index)
    }

    /// Allocates and atomically creates an empty file at the allocated path.
    ///
    /// If another writer created the same name between the scan and the creation,
    /// the next number is tried instead.
    pub fn reserve(&self, directory: &Path, stem: &str, batch_index: usize) -> Result<AllocatedFilename> {
        self.reserve_after(directory, stem, batch_index, 0)
    }

    /// `reserve` with the same lower bound as `allocate_after`.
    pub fn reserve_after(&self, directory: &Path, stem: &str, batch_index: usize, floor: u32) -> Result<AllocatedFilename> {
        let mut candidate = self.allocate_after(directory, stem, batch_index, floor)?;

        for _ in 0..MAX_RESERVE_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&candidate.full_path) {
                Ok(_) => {
                    debug!("reserved {}", candidate.full_path.display());
                    return Ok(candidate);
                }
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    debug!("{} was taken, retrying", candidate.full_path.display());
                    candidate = self.allocate_after(directory, stem, batch_index, candidate.sequence_number)?;
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(SaveError::ReservationExhausted {
            stem: stem.to_owned(),
            attempts: MAX_RESERVE_ATTEMPTS,
        })
    }

    fn compose(&self, stem: &str, sequence_number: u32) -> String {
        match self.style {
            SuffixStyle::TrailingUnderscore => format!("{}_{:0width$}_.{}", stem, sequence_number, self.extension, width = SEQUENCE_WIDTH),
            SuffixStyle::Plain => format!("{}_{:0width$}.{}", stem, sequence_number, self.extension, width = SEQUENCE_WIDTH),
        }
    }
}

pub fn substitute_batch_number(stem: &str, batch_index: usize) -> Result<String> {
    if stem.is_empty() {
        return Err(SaveError::InvalidStem(stem.to_owned()));
    }

    Ok(stem.replace(BATCH_NUM_TOKEN, &batch_index.to_string()))
}

/// Largest sequence number among the entries of `directory` that belong to `stem`, or 0.
pub fn highest_sequence(directory: &Path, stem: &str) -> Result<u32> {
    let entries = fs::read_dir(directory).map_err(|_| SaveError::DirectoryNotFound(directory.to_owned()))?;

    let mut highest = 0;

    for entry in entries {
        // entries that vanish or fail to stat mid-scan are skipped
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };

        if let Some(sequence) = entry.file_name().to_str().and_then(|name| parse_sequence(name, stem)) {
            highest = highest.max(sequence);
        }
    }

    Ok(highest)
}

/// Parses `<stem>_<digits>[_].<alphanumeric extension>` and returns the digits.
pub fn parse_sequence(file_name: &str, stem: &str) -> Option<u32> {
    let rest = file_name.strip_prefix(stem)?.strip_prefix('_')?;

    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let (digits, rest) = rest.split_at(digits_end);

    if digits.is_empty() {
        return None;
    }

    let rest = rest.strip_prefix('_').unwrap_or(rest);
    let extension = rest.strip_prefix('.')?;

    if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }

    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_suffix_styles() {
        assert_eq!(parse_sequence("out_00007_.png", "out"), Some(7));
        assert_eq!(parse_sequence("out_00003.txt", "out"), Some(3));
        assert_eq!(parse_sequence("out_12_.exr", "out"), Some(12));
    }

    #[test]
    fn rejects_malformed_names() {
        assert_eq!(parse_sequence("out_abc_.png", "out"), None);
        assert_eq!(parse_sequence("out_00001_", "out"), None);
        assert_eq!(parse_sequence("out_00001_.", "out"), None);
        assert_eq!(parse_sequence("out_00001__.png", "out"), None);
        assert_eq!(parse_sequence("out_00001_.tar.gz", "out"), None);
        assert_eq!(parse_sequence("output_00001_.png", "out"), None);
        assert_eq!(parse_sequence("out00001_.png", "out"), None);
        assert_eq!(parse_sequence("out_99999999999_.png", "out"), None);
    }

    #[test]
    fn stem_is_matched_literally() {
        assert_eq!(parse_sequence("a.b_00002_.png", "a.b"), Some(2));
        assert_eq!(parse_sequence("axb_00002_.png", "a.b"), None);
    }

    #[test]
    fn extension_is_validated() {
        assert!(FilenameAllocator::new("png", SuffixStyle::Plain).is_ok());
        assert_eq!(FilenameAllocator::new(".exr", SuffixStyle::Plain).unwrap().extension(), "exr");
        assert!(matches!(FilenameAllocator::new("", SuffixStyle::Plain), Err(SaveError::InvalidExtension(_))));
        assert!(matches!(FilenameAllocator::new("p/ng", SuffixStyle::Plain), Err(SaveError::InvalidExtension(_))));
    }

    #[test]
    fn composes_with_configured_style() {
        let trailing = FilenameAllocator::new("png", SuffixStyle::TrailingUnderscore).unwrap();
        let plain = FilenameAllocator::new("png", SuffixStyle::Plain).unwrap();

        assert_eq!(trailing.compose("out", 3), "out_00003_.png");
        assert_eq!(plain.compose("out", 3), "out_00003.png");
        assert_eq!(plain.compose("out", 123456), "out_123456.png");
    }

    #[test]
    fn batch_token_is_substituted() {
        assert_eq!(substitute_batch_number("img_%batch_num%", 3).unwrap(), "img_3");
        assert_eq!(substitute_batch_number("img", 3).unwrap(), "img");
        assert!(matches!(substitute_batch_number("", 0), Err(SaveError::InvalidStem(_))));
    }
}
