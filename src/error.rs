use super::ErrorCode;
use std::convert::From;
use std::io;
use std::net;
use std::string;

#[derive(Debug)]
pub enum Error {
    AccessViolation,
    AddrParse(net::AddrParseError),
    Backend(String),
    FileExists,
    FileNotFound,
    InvalidErrorCode(u16),
    InvalidMode,
    InvalidOpCode,
    Io(io::Error),
    PayloadDecode,
    /// ERROR datagram received from the peer; the session cancels without
    /// replying.
    Peer(u16, String),
    Timedout,
    Unsupported(String),
    Utf8(string::FromUtf8Error),
}

impl Error {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::FileNotFound => ErrorCode::FileNotFound,
            Error::AccessViolation => ErrorCode::AccessViolation,
            Error::FileExists => ErrorCode::FileAlreadyExists,
            Error::InvalidErrorCode(_)
            | Error::InvalidMode
            | Error::InvalidOpCode
            | Error::PayloadDecode
            | Error::Unsupported(_) => ErrorCode::IllegalTftpOp,
            _ => ErrorCode::NotDefined,
        }
    }

    /// Message carried by the ERROR datagram this error maps to. Falls back
    /// to the canonical per-code string.
    pub fn wire_message(&self) -> String {
        match self {
            Error::Unsupported(msg) | Error::Backend(msg) => msg.clone(),
            other => other.error_code().message().to_string(),
        }
    }
}

impl From<net::AddrParseError> for Error {
    fn from(error: net::AddrParseError) -> Self {
        Error::AddrParse(error)
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<string::FromUtf8Error> for Error {
    fn from(error: string::FromUtf8Error) -> Self {
        Error::Utf8(error)
    }
}
