pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod resolver;
pub mod settings;
pub mod util;

pub use encoder::{encoder_for, ExrEncoder, ImageEncoder, ImageMetadata, OutputFormat, PngEncoder};
pub use error::{Result, SaveError};
pub use pipeline::{BatchNumbering, BatchReport, ErrorPolicy, OutputType, ResultSink, SavePipeline, SaveResults, SavedImage};
pub use resolver::{OutputDirResolver, PathResolver, ResolvedPath};
pub use settings::SaveSettings;
pub use util::{AllocatedFilename, AlphaMode, FilenameAllocator, FloatImage, OutputRequest, SuffixStyle};
