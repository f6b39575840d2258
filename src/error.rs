use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to gather OS information: {0}")]
    OsInfo(String),

    #[error("Failed to get {module} module handle: {reason}")]
    ModuleNotLoaded { module: String, reason: String },

    #[error("Invalid {0} NT header")]
    InvalidImage(String),

    #[error("{0} has no CodeView debug record")]
    NoDebugInfo(String),

    #[error("Unsupported machine type {0:?}, expected x86 or x64")]
    UnsupportedArchitecture(object::Architecture),

    #[error("Failed to initialize symbol server API: no location in {0:?} produced {1}")]
    PdbUnavailable(String, String),

    #[error("Download of {url} failed with status {status}")]
    DownloadFailed { url: String, status: u16 },

    #[error("PDB {path:?} does not match image (want {want}, found {found})")]
    PdbMismatch { path: PathBuf, want: String, found: String },

    #[error("{0} is not found in PDB")]
    SymbolNotFound(String),

    #[error("Invalid symbol path element {0:?}")]
    InvalidSymbolPath(String),

    #[error("No application data directory: {0}")]
    AppDir(#[from] app_dirs::AppDirsError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Pdb(#[from] pdb::Error),

    #[error(transparent)]
    Object(#[from] object::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
