use crate::core::diagnostics::Warning;
use crate::core::res::ResId;
use std::io;
use thiserror::Error;

/// Error types for decoding and rebuilding resource containers
#[derive(Error, Debug)]
pub enum ResError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("truncated input while reading {context} at offset {position}")]
    Truncated { context: String, position: u64 },
    #[error("malformed {chunk} chunk at offset {offset}: {reason}")]
    MalformedChunk {
        chunk: String,
        offset: u64,
        reason: String,
    },
    #[error("unknown chunk type 0x{ty:04x} at offset {offset}")]
    UnknownChunkType { ty: u16, offset: u64 },
    #[error("jumping backwards from {from} to {to}")]
    BackwardSeek { from: u64, to: u64 },
    #[error("jump failed: expected to skip {expected} bytes, skipped {skipped}")]
    SkipFailed { expected: u64, skipped: u64 },
    #[error("could not find framework resources for package of id: {0}")]
    UnresolvedFrameworkReference(u8),
    #[error("{what} needs {size} bytes but the format allows at most {max}")]
    EncodingSizeMismatch { what: String, size: u64, max: u64 },
    #[error("no resource with id {0}")]
    ResourceNotFound(ResId),
    #[error("no attribute {attribute} on node {node}")]
    NoSuchAttribute { node: usize, attribute: usize },
    #[error("invalid string data: {0}")]
    InvalidString(String),
    #[error("invalid pipeline state: {0}")]
    InvalidState(String),
    #[error("invalid do-not-compress pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("XML render error: {0}")]
    Render(#[from] quick_xml::Error),
    #[error("{name}: {source}")]
    Entry {
        name: String,
        #[source]
        source: Box<ResError>,
    },
    #[error("strict validation failed: {0}")]
    Strict(Warning),
}

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, ResError>;

impl ResError {
    pub fn malformed(chunk: impl Into<String>, offset: u64, reason: impl Into<String>) -> Self {
        Self::MalformedChunk {
            chunk: chunk.into(),
            offset,
            reason: reason.into(),
        }
    }

    /// Attach the archive entry name to an error raised while processing it.
    pub fn in_entry(self, name: impl Into<String>) -> Self {
        match self {
            Self::Entry { .. } => self,
            other => Self::Entry {
                name: name.into(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through entry wrappers.
    pub fn root(&self) -> &ResError {
        match self {
            Self::Entry { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Converts an `UnexpectedEof` from a primitive read into `Truncated`.
pub(crate) fn eof_as_truncated(err: io::Error, context: &str, position: u64) -> ResError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ResError::Truncated {
            context: context.to_string(),
            position,
        }
    } else {
        ResError::Io(err)
    }
}
