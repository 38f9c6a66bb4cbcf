use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SaveError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub full_output_folder: PathBuf,
    /// Stem handed to the filename allocator, may still contain `%batch_num%`.
    pub filename: String,
    /// Folder relative to the output root, `/` separated, empty for the root itself.
    pub subfolder: String,
}

/// Maps a filename prefix and image dimensions to where the files of a batch go.
pub trait PathResolver {
    fn resolve(&self, filename_prefix: &str, width: usize, height: usize) -> Result<ResolvedPath>;
}

/// Resolves prefixes of the form `sub/folder/stem` below a fixed output root.
#[derive(Debug, Clone)]
pub struct OutputDirResolver {
    output_dir: PathBuf,
}

impl OutputDirResolver {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        OutputDirResolver {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

impl PathResolver for OutputDirResolver {
    fn resolve(&self, filename_prefix: &str, width: usize, height: usize) -> Result<ResolvedPath> {
        let prefix = substitute_dimensions(filename_prefix, width, height);
        let prefix = prefix.replace('\\', "/");

        let (subfolder, filename) = match prefix.rfind('/') {
            Some(split) => (prefix[..split].to_owned(), prefix[split + 1..].to_owned()),
            None => (String::new(), prefix),
        };

        if filename.is_empty() {
            return Err(SaveError::InvalidStem(filename_prefix.to_owned()));
        }

        // checked before trimming so `/etc` or `C:/` stay absolute
        if !Path::new(&subfolder).components().all(|component| matches!(component, Component::Normal(_) | Component::CurDir)) {
            return Err(SaveError::PathEscapesOutput(subfolder));
        }

        let subfolder = subfolder.trim_end_matches('/').to_owned();
        let relative = Path::new(&subfolder);

        let full_output_folder = self.output_dir.join(relative);
        fs::create_dir_all(&full_output_folder)?;

        debug!("resolved {:?} to {} ({})", filename_prefix, full_output_folder.display(), filename);

        Ok(ResolvedPath {
            full_output_folder,
            filename,
            subfolder,
        })
    }
}

/// Replaces `%width%` and `%height%` in a prefix template.
pub fn substitute_dimensions(prefix: &str, width: usize, height: usize) -> String {
    prefix
        .replace("%width%", &width.to_string())
        .replace("%height%", &height.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_dimensions() {
        assert_eq!(substitute_dimensions("img_%width%x%height%", 640, 480), "img_640x480");
        assert_eq!(substitute_dimensions("img", 640, 480), "img");
    }

    #[test]
    fn splits_subfolder_and_creates_it() {
        let root = tempfile::tempdir().unwrap();
        let resolver = OutputDirResolver::new(root.path());

        let resolved = resolver.resolve("renders/day1/out_%width%", 8, 4).unwrap();

        assert_eq!(resolved.subfolder, "renders/day1");
        assert_eq!(resolver.resolve("renders//day1/out", 8, 4).unwrap().subfolder, "renders//day1");
        assert_eq!(resolved.filename, "out_8");
        assert_eq!(resolved.full_output_folder, root.path().join("renders/day1"));
        assert!(resolved.full_output_folder.is_dir());
    }

    #[test]
    fn plain_prefix_uses_root() {
        let root = tempfile::tempdir().unwrap();
        let resolved = OutputDirResolver::new(root.path()).resolve("out", 1, 1).unwrap();

        assert_eq!(resolved.subfolder, "");
        assert_eq!(resolved.full_output_folder, root.path().join(""));
    }

    #[test]
    fn refuses_to_leave_the_root() {
        let root = tempfile::tempdir().unwrap();
        let resolver = OutputDirResolver::new(root.path());

        assert!(matches!(resolver.resolve("../elsewhere/out", 1, 1), Err(SaveError::PathEscapesOutput(_))));
        assert!(matches!(resolver.resolve("a/../../out", 1, 1), Err(SaveError::PathEscapesOutput(_))));
        assert!(matches!(resolver.resolve("/etc/out", 1, 1), Err(SaveError::PathEscapesOutput(_))));
        assert!(matches!(resolver.resolve("//srv/share/out", 1, 1), Err(SaveError::PathEscapesOutput(_))));
        assert!(matches!(resolver.resolve("folder/", 1, 1), Err(SaveError::InvalidStem(_))));
        assert!(!root.path().join("etc").exists());
    }
}
