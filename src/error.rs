use thiserror::Error;

/// Errors produced by packet parsing, flow lookup and terminator state
/// transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TermError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("operation is not valid in the current state")]
    WrongState,

    #[error("write of zero bytes requested")]
    EmptyWrite,

    /// Control code: a response packet has already been queued for this
    /// request and no further action is needed by the control-channel
    /// collaborator. Not an error condition in itself.
    #[error("a response has already been sent")]
    ResponseSent,

    /// Control code: a response is pending completion of an async
    /// operation (DNS lookup, connect) and will arrive later.
    #[error("a response is pending")]
    ResponsePending,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TermError>;
