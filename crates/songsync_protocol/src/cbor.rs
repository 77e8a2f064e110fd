//! CBOR helpers shared by the payload types.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a value to CBOR bytes.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| ProtocolError::EncodingFailed {
        message: e.to_string(),
    })?;
    Ok(out)
}

/// Decodes a value from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::DecodingFailed {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn map_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert("title".to_string(), "Amazing Grace".to_string());
        let bytes = to_cbor(&map).unwrap();
        let decoded: BTreeMap<String, String> = from_cbor(&bytes).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn garbage_is_rejected() {
        let result: ProtocolResult<BTreeMap<String, String>> = from_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(ProtocolError::DecodingFailed { .. })));
    }
}
