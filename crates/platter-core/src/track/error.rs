//! Track import error types

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while importing a track
#[derive(Error, Debug)]
pub enum TrackError {
    /// The importer process could not be launched
    #[error("failed to launch importer {importer:?}: {source}")]
    SpawnFailed {
        importer: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading from the importer pipe failed
    #[error("error reading from importer: {0}")]
    Io(#[from] io::Error),

    /// A PCM block could not be allocated
    #[error("out of memory allocating a track block")]
    OutOfMemory,

    /// The block count limit was reached mid-import
    #[error("maximum track length reached")]
    TrackFull,
}

/// Result type for track operations
pub type TrackResult<T> = Result<T, TrackError>;
