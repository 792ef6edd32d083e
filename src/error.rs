use crate::{dialog::DialogId, transaction::key::TransactionKey, transport::SipAddr};
use thiserror::Error as ThisError;

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("SIP message error: {0}")]
    SipMessageError(String),

    #[error("Transport failure: {0} ({1})")]
    TransportFailure(String, SipAddr),

    #[error("Bind failed on {1}: {0}")]
    BindFailed(String, SipAddr),

    #[error("Transaction timed out: {0}")]
    Timeout(TransactionKey),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Call rejected: {0}")]
    CallRejected(rsip::StatusCode),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Already completed: {0}")]
    AlreadyCompleted(TransactionKey),

    #[error("Transaction error: {0} ({1})")]
    TransactionError(String, TransactionKey),

    #[error("Endpoint error: {0}")]
    EndpointError(String),

    #[error("Dialog error: {0} ({1})")]
    DialogError(String, DialogId),

    #[error("{0}")]
    Error(String),
}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::SipMessageError(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Error(format!("io error: {}", e))
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::Error(format!("address parse error: {}", e))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}
