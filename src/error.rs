use std::{io, num::ParseIntError};

use http::StatusCode;
use n0_error::stack_error;

/// Errors that can occur while forwarding a request to the upstream.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ForwardError {
    /// The upstream request could not be built or sent.
    #[error("upstream request failed")]
    Upstream {
        #[error(source, std_err)]
        source: reqwest::Error,
    },

    /// The upstream announced a `content-length` that is not a byte count.
    #[error("invalid content-length header {value:?}")]
    InvalidContentLength {
        /// The raw header value
        value: String,
    },

    /// The upstream body ended before the announced length was received.
    #[error("unexpected short read, {remaining} of {expected} bytes missing")]
    ShortRead {
        /// Bytes still outstanding when the body ended
        remaining: u64,
        /// The announced content length
        expected: u64,
    },

    /// Reading the upstream body failed.
    #[error("failed to read upstream body")]
    Read {
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The downstream response head could not be assembled.
    #[error("failed to build downstream response")]
    Response {
        #[error(source, std_err)]
        source: http::Error,
    },
}

impl ForwardError {
    /// Returns the status to answer with when the error happens before the response head was sent.
    pub fn response_status(&self) -> StatusCode {
        match self {
            ForwardError::Response { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Errors that can occur when parsing a line of the monitor protocol.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ProtocolError {
    /// A required field is missing from the record
    #[error("record is missing the {field} field")]
    MissingField { field: &'static str },

    /// The record kind is not part of the protocol
    #[error("unknown record kind {kind:?}")]
    UnknownKind { kind: String },

    /// A numeric field could not be parsed
    #[error("invalid number in the {field} field")]
    InvalidNumber {
        field: &'static str,
        #[error(source, std_err)]
        source: ParseIntError,
    },
}
