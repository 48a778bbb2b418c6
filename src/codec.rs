//! Payload codec and envelope wire format
//!
//! Values travel to the backend as opaque bytes. A [`Codec`] does the byte
//! conversion; [`JsonCodec`] is the default. Stale-while-revalidate needs a
//! soft-expiry timestamp next to the value, so policy-enabled writes wrap the
//! value in an [`Envelope`]. Reads always try the envelope form first and
//! fall back to a plain decode, which keeps entries written before envelope
//! adoption (or by policy-less callers) readable.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Trait for values that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Byte-level serializer seam.
///
/// Implementations must be self-describing enough that decoding bytes of the
/// wrong shape fails instead of producing a value.
pub trait Codec: Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CacheError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CacheError>;

    /// Whether the encoded payload is this codec's "no value" representation
    /// (used by the skip-caching-none filter). Defaults to never.
    fn is_null(&self, _bytes: &[u8]) -> bool {
        false
    }
}

/// The default codec: serde_json
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CacheError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn is_null(&self, bytes: &[u8]) -> bool {
        bytes.trim_ascii() == b"null"
    }
}

/// Marker value distinguishing envelopes from plain payloads.
const ENVELOPE_TAG: u8 = 1;

/// Wire wrapper carrying a value together with its soft-expiry instant.
///
/// The tag field makes the wrapped form unambiguous: a plain payload decodes
/// as an envelope only if it happens to carry all three fields, which the
/// reserved `__rcache` name makes implausible.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    #[serde(rename = "__rcache")]
    tag: u8,
    #[serde(rename = "v")]
    pub value: T,
    #[serde(rename = "soft_ms")]
    pub soft_expire_unix_ms: u64,
}

/// Borrowing twin of [`Envelope`] so encoding does not clone the value.
#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    #[serde(rename = "__rcache")]
    tag: u8,
    #[serde(rename = "v")]
    value: &'a T,
    #[serde(rename = "soft_ms")]
    soft_expire_unix_ms: u64,
}

/// Wrap `value` in an envelope and encode it.
pub(crate) fn encode_envelope<T, C>(
    codec: &C,
    value: &T,
    soft_expire_unix_ms: u64,
) -> Result<Vec<u8>, CacheError>
where
    T: Serialize,
    C: Codec,
{
    codec.encode(&EnvelopeRef {
        tag: ENVELOPE_TAG,
        value,
        soft_expire_unix_ms,
    })
}

/// Attempt an envelope decode; `None` means "not an envelope" (decoder
/// errors are swallowed, the caller falls back to a plain decode).
pub(crate) fn try_decode_envelope<T, C>(codec: &C, bytes: &[u8]) -> Option<Envelope<T>>
where
    T: DeserializeOwned,
    C: Codec,
{
    codec
        .decode::<Envelope<T>>(bytes)
        .ok()
        .filter(|envelope| envelope.tag == ENVELOPE_TAG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_plain_round_trip() {
        let codec = JsonCodec;
        let value = HashMap::from([("a".to_owned(), 1u32), ("b".to_owned(), 2u32)]);
        let bytes = codec.encode(&value).unwrap();
        let decoded: HashMap<String, u32> = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_envelope_round_trip() {
        let codec = JsonCodec;
        let bytes = encode_envelope(&codec, &"hello".to_owned(), 1_234_567).unwrap();
        let envelope: Envelope<String> = try_decode_envelope(&codec, &bytes).unwrap();
        assert_eq!(envelope.value, "hello");
        assert_eq!(envelope.soft_expire_unix_ms, 1_234_567);
    }

    #[test]
    fn test_plain_payload_is_not_an_envelope() {
        let codec = JsonCodec;
        let bytes = codec.encode(&"just a string".to_owned()).unwrap();
        assert!(try_decode_envelope::<String, _>(&codec, &bytes).is_none());

        // A map payload without the tag field is not an envelope either.
        let map = HashMap::from([("v".to_owned(), "x".to_owned())]);
        let bytes = codec.encode(&map).unwrap();
        assert!(try_decode_envelope::<String, _>(&codec, &bytes).is_none());
    }

    #[test]
    fn test_garbage_fails_both_decodes() {
        let codec = JsonCodec;
        let garbage = b"{definitely not json";
        assert!(try_decode_envelope::<String, _>(&codec, garbage).is_none());
        assert!(codec.decode::<String>(garbage).is_err());
    }

    #[test]
    fn test_is_null_detects_none() {
        let codec = JsonCodec;
        let bytes = codec.encode(&Option::<String>::None).unwrap();
        assert!(codec.is_null(&bytes));

        let bytes = codec.encode(&Some("x".to_owned())).unwrap();
        assert!(!codec.is_null(&bytes));

        assert!(!codec.is_null(b"0"));
    }
}
