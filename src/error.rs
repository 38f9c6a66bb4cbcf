use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum SaveError {
    #[error("output directory {0} does not exist or cannot be listed")]
    DirectoryNotFound(PathBuf),

    #[error("invalid filename stem: {0:?}")]
    InvalidStem(String),

    #[error("invalid file extension: {0:?}")]
    InvalidExtension(String),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("cannot save an empty batch")]
    EmptyBatch,

    #[error("subfolder {0:?} escapes the output directory")]
    PathEscapesOutput(String),

    #[error("no free filename for stem {stem:?} after {attempts} attempts")]
    ReservationExhausted { stem: String, attempts: u32 },

    #[error("sequence numbers for stem {0:?} are exhausted")]
    SequenceExhausted(String),

    #[error("png encoding error: {0}")]
    Png(#[from] png::EncodingError),

    #[error("exr encoding error: {0}")]
    Exr(#[from] exr::error::Error),

    #[error("metadata serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SaveError {
    pub fn config<T: ToString>(msg: T) -> Self {
        SaveError::Config(msg.to_string())
    }

    pub fn invalid_image<T: ToString>(msg: T) -> Self {
        SaveError::InvalidImage(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SaveError>;
