use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Errors raised while extracting a firmware image
#[derive(Error, Debug)]
pub enum Error {
    /// The destination root must not exist before a run
    #[error("destination {0} already exists, refusing to overwrite")]
    DestinationExists(PathBuf),

    #[error("source {0} does not exist")]
    SourceMissing(PathBuf),

    /// The decrypt tool is not installed; decryption has to happen out-of-band
    #[error("decrypt tool `{tool}` not found in PATH; decrypt manually with `{command}` and re-run on the result")]
    DecryptToolMissing { tool: String, command: String },

    /// A simulated flash device is already present and would be clobbered
    #[error("flash device {0} already exists, remove it (rmmod nandsim) before extracting a UBI image")]
    FlashDeviceExists(PathBuf),

    #[error("unsupported input {path}: {kind}")]
    UnsupportedInput { path: PathBuf, kind: &'static str },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("`{program}` exited with {status}")]
    Tool { program: String, status: ExitStatus },

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl Error {
    /// Fatal errors abort the run; everything else degrades to a warning
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DestinationExists(_)
                | Error::SourceMissing(_)
                | Error::DecryptToolMissing { .. }
                | Error::FlashDeviceExists(_)
                | Error::UnsupportedInput { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::Io {
            context: "I/O error".to_string(),
            source,
        }
    }
}

/// Attach a path to an I/O error
pub trait IoContext<T> {
    fn context_path(self, what: &str, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn context_path(self, what: &str, path: &std::path::Path) -> Result<T> {
        self.map_err(|source| Error::Io {
            context: format!("{} {}", what, path.display()),
            source,
        })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
