//! Error taxonomy for the decoder. Variants map onto the failure classes the
//! rest of the crate cares about: configuration problems are caught at init,
//! format problems are fatal at model-load time, domain problems leave the
//! decoder usable, and logic errors mean an internal invariant broke and the
//! current utterance is abandoned.
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or conflicting options, inapplicable file paths. Reported at
    /// init time; the decoder is never constructed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A model file with the wrong version, dimensions, magic number or
    /// checksum. Fatal at load.
    #[error("format error in {file}: {detail}")]
    Format { file: String, detail: String },

    /// Bad input to an API call (OOV pronunciation phone, FSG referencing a
    /// word missing from the dictionary, OOV keyphrase word). The decoder
    /// stays usable after these.
    #[error("domain error: {0}")]
    Domain(String),

    /// A growable structure hit its ceiling and could not be extended. The
    /// current utterance is aborted.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// An internal invariant failed. Unrecoverable for the current
    /// utterance.
    #[error("internal error: {0}")]
    Logic(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn format(file: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Format {
            file: file.into(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
