//! Version chain entries.

use crate::document::PatchId;
use crate::error::{ProtocolError, ProtocolResult};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// One accepted entry of the version chain.
///
/// Wire form: `sequence,timestamp,author,patchId[,chainId]`. The timestamp is
/// milliseconds since the Unix epoch. The optional chain ID identifies the
/// database the chain belongs to; peers that only know the four-field form
/// ignore it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatchVersion {
    /// Position in the chain, starting at 1.
    pub sequence: u64,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Author of the patch.
    pub author: String,
    /// Identifier of the referenced patch.
    pub patch_id: PatchId,
    /// Identity of the chain this version belongs to.
    pub chain_id: Option<String>,
}

impl PatchVersion {
    /// Creates a version stamped with the current time.
    pub fn new(sequence: u64, author: impl Into<String>, patch_id: PatchId) -> ProtocolResult<Self> {
        let author = author.into();
        check_separator("author", &author)?;
        Ok(Self {
            sequence,
            timestamp: now_millis(),
            author,
            patch_id,
            chain_id: None,
        })
    }

    /// Overrides the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attaches a chain identity.
    pub fn with_chain_id(mut self, chain_id: impl Into<String>) -> ProtocolResult<Self> {
        let chain_id = chain_id.into();
        check_separator("chain_id", &chain_id)?;
        self.chain_id = Some(chain_id);
        Ok(self)
    }

    /// Parses the wire form.
    pub fn parse(s: &str) -> ProtocolResult<Self> {
        let parts: Vec<&str> = s.trim().split(',').collect();
        if parts.len() != 4 && parts.len() != 5 {
            return Err(ProtocolError::malformed_version(format!(
                "expected 4 or 5 fields, got {}: {s:?}",
                parts.len()
            )));
        }

        let sequence = parts[0]
            .parse()
            .map_err(|_| ProtocolError::malformed_version(format!("invalid sequence {:?}", parts[0])))?;
        let timestamp = parts[1]
            .parse()
            .map_err(|_| ProtocolError::malformed_version(format!("invalid timestamp {:?}", parts[1])))?;
        let patch_id = PatchId::new(parts[3])
            .map_err(|_| ProtocolError::malformed_version(format!("invalid patch id {:?}", parts[3])))?;
        let chain_id = parts
            .get(4)
            .filter(|c| !c.is_empty())
            .map(|c| c.to_string());

        Ok(Self {
            sequence,
            timestamp,
            author: parts[2].to_string(),
            patch_id,
            chain_id,
        })
    }

    /// Encodes to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Decodes from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        Self::parse(std::str::from_utf8(bytes)?)
    }
}

impl fmt::Display for PatchVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.sequence, self.timestamp, self.author, self.patch_id
        )?;
        if let Some(chain_id) = &self.chain_id {
            write!(f, ",{chain_id}")?;
        }
        Ok(())
    }
}

impl FromStr for PatchVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn check_separator(field: &'static str, value: &str) -> ProtocolResult<()> {
    if value.contains(',') {
        return Err(ProtocolError::SeparatorInValue {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
