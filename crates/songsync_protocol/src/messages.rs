//! Small control messages exchanged next to patches and versions.

use crate::cbor::{from_cbor, to_cbor};
use crate::document::{DocumentId, PatchId};
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reachability of the broker and the database behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Health {
    /// Broker and database reachable.
    Online,
    /// Broker or database unreachable.
    Offline,
}

impl Health {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Online => "online",
            Health::Offline => "offline",
        }
    }

    /// Returns true if online.
    pub fn is_online(&self) -> bool {
        matches!(self, Health::Online)
    }

    /// Decodes from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        std::str::from_utf8(bytes)?.parse()
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Health {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(Health::Online),
            "offline" => Ok(Health::Offline),
            _ => Err(ProtocolError::UnknownHealth(s.to_string())),
        }
    }
}

/// Notice that a proposed version lost the race for its sequence.
///
/// Carried as the bare patch ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeReject {
    /// The rejected patch.
    pub patch_id: PatchId,
}

impl ChangeReject {
    /// Encodes to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.patch_id.as_str().as_bytes().to_vec()
    }

    /// Decodes from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        let patch_id = PatchId::new(std::str::from_utf8(bytes)?.trim())?;
        Ok(Self { patch_id })
    }
}

/// Request for the version and patch at one sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchRequest {
    /// Requested sequence.
    pub sequence: u64,
}

impl PatchRequest {
    /// Encodes to wire bytes (decimal).
    pub fn to_bytes(&self) -> Vec<u8> {
        self.sequence.to_string().into_bytes()
    }

    /// Decodes from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        let text = std::str::from_utf8(bytes)?;
        let sequence = text.trim().parse().map_err(|_| ProtocolError::DecodingFailed {
            message: format!("invalid sequence request {text:?}"),
        })?;
        Ok(Self { sequence })
    }
}

/// Request for a blob by file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileRequest {
    /// Requested file name.
    pub name: String,
}

impl FileRequest {
    /// Encodes to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.name.as_bytes().to_vec()
    }

    /// Decodes from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(Self {
            name: String::from_utf8(bytes.to_vec())?,
        })
    }
}

/// Server answer to a blob upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSetResponse {
    /// Uploaded file name.
    pub name: String,
    /// Whether the upload was stored.
    pub ok: bool,
    /// Failure reason, if any.
    pub reason: Option<String>,
}

impl FileSetResponse {
    /// Successful upload.
    pub fn ok(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: true,
            reason: None,
        }
    }

    /// Failed upload.
    pub fn failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            reason: Some(reason.into()),
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// Presentation position inside a song.
///
/// Wire form: `document,part,line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    /// Presented document.
    pub document: DocumentId,
    /// Part (verse, chorus, ...) index.
    pub part: u32,
    /// Line inside the part.
    pub line: u32,
}

impl Position {
    /// Encodes to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Decodes from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        std::str::from_utf8(bytes)?.parse()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.document, self.part, self.line)
    }
}

impl FromStr for Position {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::DecodingFailed {
            message: format!("invalid position {s:?}"),
        };
        let mut parts = s.trim().split(',');
        let document = parts.next().ok_or_else(invalid)?.parse()?;
        let part = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let line = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self {
            document,
            part,
            line,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_values() {
        assert_eq!(Health::from_bytes(b"online").unwrap(), Health::Online);
        assert_eq!(Health::from_bytes(b"OFFLINE\n").unwrap(), Health::Offline);
        assert!(Health::from_bytes(b"maybe").is_err());
        assert!(Health::Online.is_online());
    }

    #[test]
    fn reject_is_bare_patch_id() {
        let reject = ChangeReject {
            patch_id: PatchId::new("p-1").unwrap(),
        };
        assert_eq!(reject.to_bytes(), b"p-1");
        assert_eq!(ChangeReject::from_bytes(b"p-1").unwrap(), reject);
        assert!(ChangeReject::from_bytes(b"").is_err());
    }

    #[test]
    fn patch_request_decimal() {
        let req = PatchRequest { sequence: 42 };
        assert_eq!(req.to_bytes(), b"42");
        assert_eq!(PatchRequest::from_bytes(b" 42 ").unwrap(), req);
        assert!(PatchRequest::from_bytes(b"-1").is_err());
    }

    #[test]
    fn file_set_response_roundtrip() {
        let resp = FileSetResponse::failed("cover.png", "disk full");
        assert_eq!(FileSetResponse::decode(&resp.encode().unwrap()).unwrap(), resp);
        assert!(FileSetResponse::ok("a.png").ok);
    }

    #[test]
    fn position_roundtrip() {
        let pos = Position {
            document: DocumentId::new(),
            part: 2,
            line: 3,
        };
        assert_eq!(Position::from_bytes(&pos.to_bytes()).unwrap(), pos);
        assert!("x,1,2".parse::<Position>().is_err());
        assert!(format!("{},1", pos.document).parse::<Position>().is_err());
    }
}
