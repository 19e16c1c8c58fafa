use thiserror::Error;

/// Errors returned by batch file, frame, and message codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// CBOR serialization failure.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR deserialization failure.
    #[error("decode error: {0}")]
    Decode(String),
    /// Batch file layout violation.
    #[error("invalid batch file: {0}")]
    InvalidBatchFile(&'static str),
    /// Frame too short to carry a sequence id.
    #[error("frame too short: {len} bytes")]
    FrameTooShort { len: usize },
}

impl From<ciborium::ser::Error<std::io::Error>> for CodecError {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for CodecError {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        Self::Decode(err.to_string())
    }
}
