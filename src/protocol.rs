//! Line protocol spoken between the proxy and the monitor process.
//!
//! Every record is a single line of space separated fields, starting with the request id:
//!
//! ```text
//! <id> new <client-ip> <method> <path>
//! <id> sent
//! <id> length <expected-bytes>
//! <id> progress <delta-bytes>
//! <id> end
//! <id> remove
//! ```
//!
//! `remove` is only ever generated inside the monitor. Fields are not escaped, so a method or path
//! containing a space does not survive the trip intact.

use std::{fmt, str::FromStr};

use n0_error::e;

use crate::error::ProtocolError;

/// Identifier of a proxied request, unique for the lifetime of the proxy process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub struct RequestId(pub u64);

/// A lifecycle event of a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The request was admitted.
    New {
        client_ip: String,
        method: String,
        path: String,
    },
    /// The request was dispatched to the upstream.
    Sent,
    /// The upstream announced the response body length.
    Length(u64),
    /// A chunk of the response body was copied downstream.
    Progress(u64),
    /// The exchange finished, successfully or not.
    End,
    /// Drop the request from the monitor table.
    Remove,
}

/// One line of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: RequestId,
    pub event: Event,
}

impl Record {
    pub fn new(id: RequestId, event: Event) -> Self {
        Self { id, event }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id;
        match &self.event {
            Event::New {
                client_ip,
                method,
                path,
            } => write!(f, "{id} new {client_ip} {method} {path}"),
            Event::Sent => write!(f, "{id} sent"),
            Event::Length(expected) => write!(f, "{id} length {expected}"),
            Event::Progress(delta) => write!(f, "{id} progress {delta}"),
            Event::End => write!(f, "{id} end"),
            Event::Remove => write!(f, "{id} remove"),
        }
    }
}

/// A line split into its request id and kind, with the remaining fields not parsed yet.
///
/// The monitor looks at the id before anything else, so records for requests it does not know
/// are skipped without their payload being validated.
#[derive(Debug, Clone)]
pub struct RecordLine<'a> {
    pub id: RequestId,
    pub kind: &'a str,
    fields: std::str::Split<'a, char>,
}

impl<'a> RecordLine<'a> {
    pub fn split(line: &'a str) -> Result<Self, ProtocolError> {
        let mut fields = line.split(' ');
        let id = RequestId(parse_number(fields.next(), "id")?);
        let kind = required(fields.next(), "kind")?;
        Ok(Self { id, kind, fields })
    }

    /// Returns `true` for the record that admits a request.
    pub fn is_new(&self) -> bool {
        self.kind == "new"
    }

    /// Parses the remaining fields. A kind that is not part of the protocol gives `None`.
    pub fn into_record(self) -> Result<Option<Record>, ProtocolError> {
        let Self {
            id,
            kind,
            mut fields,
        } = self;
        let event = match kind {
            "new" => Event::New {
                client_ip: required(fields.next(), "client ip")?.to_string(),
                method: required(fields.next(), "method")?.to_string(),
                path: required(fields.next(), "path")?.to_string(),
            },
            "sent" => Event::Sent,
            "length" => Event::Length(parse_number(fields.next(), "length")?),
            "progress" => Event::Progress(parse_number(fields.next(), "progress")?),
            "end" => Event::End,
            "remove" => Event::Remove,
            _ => return Ok(None),
        };
        Ok(Some(Record { id, event }))
    }
}

impl FromStr for Record {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = RecordLine::split(line)?;
        let kind = line.kind;
        line.into_record()?.ok_or_else(|| {
            e!(ProtocolError::UnknownKind {
                kind: kind.to_string()
            })
        })
    }
}

fn required<'a>(field: Option<&'a str>, name: &'static str) -> Result<&'a str, ProtocolError> {
    match field {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(e!(ProtocolError::MissingField { field: name })),
    }
}

fn parse_number(field: Option<&str>, name: &'static str) -> Result<u64, ProtocolError> {
    required(field, name)?
        .parse()
        .map_err(|source| e!(ProtocolError::InvalidNumber { field: name, source }))
}
