use std::fmt::Display;
use std::io;

/// shaledb errors.
///
/// Lookup misses (`NoData`, `Removed`) are ordinary results of `read` and
/// are distinguished from real failures by [`Error::is_not_found`].
#[derive(Debug)]
pub enum Error {
    /// Key absent from every cache and chunk.
    NoData,
    /// Key is present in the remove cache.
    Removed,
    /// A chunk-meta entry was unparsable or disagreed with the data file.
    /// Replay stops after the last valid chunk and the blob opens with
    /// what was recovered.
    CorruptChunkMeta(String),
    /// Compression or decompression stream failure.
    Codec(String),
    /// Invalid argument, typically a violated precondition.
    InvalidInput(String),
    /// An IO error from the file layer.
    Io(io::Error),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NoData => write!(f, "read: no data"),
            Error::Removed => write!(f, "read: in removed cache"),
            Error::CorruptChunkMeta(msg) => write!(f, "corrupt chunk meta: {msg}"),
            Error::Codec(msg) => write!(f, "codec error: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl Error {
    /// True for the two lookup-miss outcomes of `read`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NoData | Error::Removed)
    }

    /// Wraps a stream failure from a compressor or decompressor.
    pub(crate) fn codec(err: io::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// A shaledb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_classification() {
        assert!(Error::NoData.is_not_found());
        assert!(Error::Removed.is_not_found());
        assert!(!Error::CorruptChunkMeta("tail".into()).is_not_found());
        assert!(!Error::Io(io::Error::new(io::ErrorKind::Other, "x")).is_not_found());
    }

    #[test]
    fn io_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "short read").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("short read"));
    }
}
