//! Signal codec errors, folding into the shared [`ErrorKind`] taxonomy.

use sharefile_protocol::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalCodecError {
    #[error("unrecognised signal prefix")]
    InvalidFormat,

    #[error("gzip decompression unavailable or failed")]
    DecompressionUnavailable,

    #[error("failed to decode signal body: {0}")]
    DecodeFailed(String),
}

impl From<SignalCodecError> for ErrorKind {
    fn from(err: SignalCodecError) -> Self {
        match err {
            SignalCodecError::InvalidFormat => ErrorKind::InvalidFormat("signal".into()),
            SignalCodecError::DecompressionUnavailable => ErrorKind::DecompressionUnavailable,
            SignalCodecError::DecodeFailed(msg) => ErrorKind::InvalidFormat(msg),
        }
    }
}
