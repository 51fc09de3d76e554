use thiserror::Error;

use crate::format::SampleFormat;

#[derive(Debug, Error)]
pub enum Error {
    /// The transport reported a sample format the mixer cannot accumulate.
    #[error("sample format {0:?} is not mixable")]
    InvalidFormat(SampleFormat),

    #[error("channel count {0} out of range")]
    InvalidChannels(usize),

    #[error("out of memory")]
    OutOfMemory,

    /// No samples available yet; retry after the next transport wake.
    #[error("stream not ready")]
    Again,

    /// The transport side of the PCM hand-off has been released.
    #[error("transport link closed")]
    Closed,

    #[error("client limit reached")]
    TooManyClients,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
