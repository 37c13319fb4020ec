//! CBOR encoding for persisted blobs.
//!
//! Every blob is wrapped in a small envelope carrying a format version so a
//! newer engine can refuse (rather than misread) state it does not understand.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current persisted format version.
pub const FORMAT_VERSION: u16 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u16,
    body: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    version: u16,
    body: T,
}

#[derive(Deserialize)]
struct VersionOnly {
    version: u16,
}

/// Encodes a value as versioned CBOR.
pub fn encode_versioned<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let envelope = EnvelopeRef {
        version: FORMAT_VERSION,
        body: value,
    };
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&envelope, &mut buf)
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes a value written by [`encode_versioned`].
pub fn decode_versioned<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    // Check the version first so an incompatible body reports the version,
    // not a confusing field error.
    let header: VersionOnly =
        ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    if header.version != FORMAT_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            found: header.version,
            expected: FORMAT_VERSION,
        });
    }

    let envelope: Envelope<T> =
        ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(envelope.body)
}
