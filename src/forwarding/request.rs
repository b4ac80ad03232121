//! # Forward Request
//!
//! Decoding of the payload attached to a `direct-tcpip` channel-open
//! (RFC 4254, section 7.2):
//!
//! ```text
//! string    host to connect
//! uint32    port to connect
//! string    originator IP address
//! uint32    originator port
//! ```
use std::fmt;

use thiserror::Error;

/// Errors that can occur while decoding a `direct-tcpip` payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("payload truncated while reading {0}")]
    Truncated(&'static str),
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("destination port {0} is out of range")]
    PortOutOfRange(u32),
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

/// A decoded request to forward one channel to `destination_host:destination_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub destination_host: String,
    pub destination_port: u16,
    /// Reported by the client, informational only.
    pub originator_host: String,
    pub originator_port: u32,
}

impl ForwardRequest {
    /// Decodes a `direct-tcpip` channel-open payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ParseError> {
        let mut reader = Reader(payload);
        let destination_host = reader.read_string("host to connect")?;
        let destination_port = reader.read_u32("port to connect")?;
        let originator_host = reader.read_string("originator address")?;
        let originator_port = reader.read_u32("originator port")?;
        if !reader.0.is_empty() {
            return Err(ParseError::TrailingBytes(reader.0.len()));
        }

        let destination_port = u16::try_from(destination_port)
            .map_err(|_| ParseError::PortOutOfRange(destination_port))?;
        Ok(ForwardRequest {
            destination_host,
            destination_port,
            originator_host,
            originator_port,
        })
    }

    /// Encodes the request in the `direct-tcpip` wire layout.
    pub fn encode(&self) -> Vec<u8> {
        direct_tcpip_payload(
            &self.destination_host,
            self.destination_port.into(),
            &self.originator_host,
            self.originator_port,
        )
    }

    /// The destination as `host:port`, with IPv6 literals in brackets.
    pub fn destination(&self) -> String {
        Endpoint(&self.destination_host, self.destination_port.into()).to_string()
    }

    /// The reported originator as `host:port`.
    pub fn originator(&self) -> String {
        Endpoint(&self.originator_host, self.originator_port).to_string()
    }
}

/// Builds a `direct-tcpip` payload from its fields.
///
/// The ports are taken as sent on the wire, so out-of-range values can be
/// represented and are left for [`ForwardRequest::decode`] to reject.
pub fn direct_tcpip_payload(
    destination_host: &str,
    destination_port: u32,
    originator_host: &str,
    originator_port: u32,
) -> Vec<u8> {
    let mut payload =
        Vec::with_capacity(16 + destination_host.len() + originator_host.len());
    write_string(&mut payload, destination_host);
    payload.extend_from_slice(&destination_port.to_be_bytes());
    write_string(&mut payload, originator_host);
    payload.extend_from_slice(&originator_port.to_be_bytes());
    payload
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    // hosts longer than u32::MAX bytes cannot reach us through russh
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], ParseError> {
        if self.0.len() < len {
            return Err(ParseError::Truncated(field));
        }
        let (head, tail) = self.0.split_at(len);
        self.0 = tail;
        Ok(head)
    }

    fn read_u32(&mut self, field: &'static str) -> Result<u32, ParseError> {
        let bytes = self.take(4, field)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_string(&mut self, field: &'static str) -> Result<String, ParseError> {
        let len = self.read_u32(field)? as usize;
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ParseError::InvalidUtf8(field))
    }
}

struct Endpoint<'a>(&'a str, u32);

impl fmt::Display for Endpoint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.contains(':') {
            write!(f, "[{}]:{}", self.0, self.1)
        } else {
            write!(f, "{}:{}", self.0, self.1)
        }
    }
}
