//! Line-oriented wire protocol for differential synchronization.
//!
//! A packet is a run of `<tag>:<value>` records, one per line, terminated by
//! a blank line:
//! ```text
//! u:3f9a2c1e                      ← session username
//! F:12:proj/readme.md             ← header: server version, prefixed id
//! d:7:=120\t-3\t+fox\t=40         ← delta citing client version 7
//! d:8:=123\t+%0A                  ← still-unacknowledged newer delta
//! M:%7B%22nickname%22...          ← application message (escaped)
//! F:3:proj/notes.md               ← next document's block
//! r:5:full%20text                 ← raw text citing client version 5
//!                                 ← blank line terminates the packet
//! ```
//!
//! | tag       | value                     | meaning                          |
//! |-----------|---------------------------|----------------------------------|
//! | `u`       | name                      | username / session id            |
//! | `F` / `f` | `version:id`              | document header                  |
//! | `d` / `D` | `version:delta`           | delta (`d` = merge changes)      |
//! | `r` / `R` | `version:escaped text`    | raw text (`R` = force live text) |
//! | `m` / `M` | escaped payload           | opaque application message       |
//! | `N`       | id                        | drop / unshare the document      |
//!
//! Block order across documents is irrelevant; records inside a block apply
//! to the most recent header.

use thiserror::Error;

use crate::diff::{decode_uri, encode_uri};

/// Wire-grammar failures. Logged and skipped, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("packet is missing its blank-line terminator")]
    Truncated,
    #[error("malformed record {0:?}")]
    Malformed(String),
    #[error("invalid version number in record {0:?}")]
    BadVersion(String),
    #[error("unknown record tag {0:?}")]
    UnknownTag(char),
    #[error("undecodable payload in record {0:?}")]
    Payload(String),
}

/// One decoded line of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// `u:` username.
    Username(String),
    /// `F:`/`f:` header. `id` still carries the endpoint prefix.
    File { version: u64, id: String, upper: bool },
    /// `d:`/`D:` delta. Lowercase means the server may merge changes.
    Delta { version: u64, delta: String, merge: bool },
    /// `r:`/`R:` full text. Uppercase forces the text onto the live buffer.
    Raw { version: u64, text: String, force: bool },
    /// `m:`/`M:` application message.
    Message { body: String, upper: bool },
    /// `N:` unshare notice.
    Nullify { id: String },
}

impl Record {
    pub fn header(version: u64, id: impl Into<String>) -> Self {
        Self::File {
            version,
            id: id.into(),
            upper: true,
        }
    }

    /// Whether this record starts a new document block.
    pub fn is_header(&self) -> bool {
        matches!(self, Self::File { .. } | Self::Nullify { .. })
    }

    /// Serialize to a single wire line (no trailing newline).
    pub fn encode(&self) -> String {
        match self {
            Self::Username(name) => format!("u:{name}"),
            Self::File { version, id, upper } => {
                format!("{}:{version}:{id}", if *upper { 'F' } else { 'f' })
            }
            Self::Delta { version, delta, merge } => {
                format!("{}:{version}:{delta}", if *merge { 'd' } else { 'D' })
            }
            Self::Raw { version, text, force } => {
                format!("{}:{version}:{}", if *force { 'R' } else { 'r' }, encode_uri(text))
            }
            Self::Message { body, upper } => {
                format!("{}:{}", if *upper { 'M' } else { 'm' }, encode_uri(body))
            }
            Self::Nullify { id } => format!("N:{id}"),
        }
    }

    /// Parse one non-empty wire line.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut chars = line.chars();
        let tag = chars
            .next()
            .ok_or_else(|| ProtocolError::Malformed(line.to_owned()))?;
        let value = chars
            .as_str()
            .strip_prefix(':')
            .ok_or_else(|| ProtocolError::Malformed(line.to_owned()))?;

        match tag {
            'u' => Ok(Self::Username(value.to_owned())),
            'F' | 'f' => {
                let (version, id) = split_version(line, value)?;
                Ok(Self::File {
                    version,
                    id: id.to_owned(),
                    upper: tag == 'F',
                })
            }
            'D' | 'd' => {
                let (version, delta) = split_version(line, value)?;
                Ok(Self::Delta {
                    version,
                    delta: delta.to_owned(),
                    merge: tag == 'd',
                })
            }
            'R' | 'r' => {
                let (version, text) = split_version(line, value)?;
                let text = decode_uri(text).map_err(|_| ProtocolError::Payload(line.to_owned()))?;
                Ok(Self::Raw {
                    version,
                    text,
                    force: tag == 'R',
                })
            }
            'M' | 'm' => {
                let body = decode_uri(value).map_err(|_| ProtocolError::Payload(line.to_owned()))?;
                Ok(Self::Message {
                    body,
                    upper: tag == 'M',
                })
            }
            'N' | 'n' => Ok(Self::Nullify {
                id: value.to_owned(),
            }),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

fn split_version<'a>(line: &str, value: &'a str) -> Result<(u64, &'a str), ProtocolError> {
    let (version, rest) = value
        .split_once(':')
        .ok_or_else(|| ProtocolError::Malformed(line.to_owned()))?;
    let version = version
        .parse()
        .map_err(|_| ProtocolError::BadVersion(line.to_owned()))?;
    Ok((version, rest))
}

/// Serialize records into a terminated packet.
pub fn encode_packet(records: &[Record]) -> String {
    let mut out = String::new();
    for record in records {
        out.push_str(&record.encode());
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Split a response into its record lines.
///
/// Fails closed: text without the blank-line terminator is rejected whole.
/// An empty body is a valid, empty response. Lines after the first blank
/// line are ignored.
pub fn packet_lines(text: &str) -> Result<Vec<&str>, ProtocolError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    if !(text.ends_with("\n\n") || text.ends_with("\r\n\r\n")) {
        return Err(ProtocolError::Truncated);
    }
    Ok(text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .take_while(|line| !line.is_empty())
        .collect())
}
