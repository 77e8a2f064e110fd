//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A comma-joined version tuple could not be parsed.
    #[error("malformed version: {message}")]
    MalformedVersion {
        /// Description of the problem.
        message: String,
    },

    /// A textual field patch could not be parsed.
    #[error("malformed patch at line {line}: {message}")]
    MalformedPatch {
        /// 1-based line number inside the patch text.
        line: usize,
        /// Description of the problem.
        message: String,
    },

    /// A value may not contain the wire separator.
    #[error("value for {field} must not contain a comma: {value:?}")]
    SeparatorInValue {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value.
        value: String,
    },

    /// Failed to encode a CBOR payload.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode a CBOR payload.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// Payload was not valid UTF-8.
    #[error("invalid UTF-8 payload")]
    InvalidUtf8,

    /// Unknown health value.
    #[error("unknown health value: {0:?}")]
    UnknownHealth(String),

    /// A topic could not be rendered or did not carry the expected arguments.
    #[error("topic {topic:?}: {message}")]
    Topic {
        /// The topic or template involved.
        topic: String,
        /// Description of the problem.
        message: String,
    },
}

impl ProtocolError {
    /// Creates a malformed version error.
    pub fn malformed_version(message: impl Into<String>) -> Self {
        Self::MalformedVersion {
            message: message.into(),
        }
    }

    /// Creates a malformed patch error.
    pub fn malformed_patch(line: usize, message: impl Into<String>) -> Self {
        Self::MalformedPatch {
            line,
            message: message.into(),
        }
    }

    /// Creates a topic error.
    pub fn topic(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Topic {
            topic: topic.into(),
            message: message.into(),
        }
    }
}

impl From<std::string::FromUtf8Error> for ProtocolError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        Self::InvalidUtf8
    }
}

impl From<std::str::Utf8Error> for ProtocolError {
    fn from(_: std::str::Utf8Error) -> Self {
        Self::InvalidUtf8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::malformed_patch(3, "bad header");
        assert_eq!(err.to_string(), "malformed patch at line 3: bad header");

        let err = ProtocolError::SeparatorInValue {
            field: "author",
            value: "a,b".into(),
        };
        assert!(err.to_string().contains("author"));
    }

    #[test]
    fn utf8_conversion() {
        let err: ProtocolError = String::from_utf8(vec![0xff, 0xfe]).unwrap_err().into();
        assert_eq!(err, ProtocolError::InvalidUtf8);
    }
}
