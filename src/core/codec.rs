//! Caller-supplied record and key encoding.
//!
//! The core never interprets key or state bytes; everything that crosses a
//! wire or a file goes through a [`CrdtCodec`]. [`JsonCodec`] covers any
//! serde-capable pair and is what the bundled binary and the tests use.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::{Record, Stamp, Tombstone};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record encode failed: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("record decode failed: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("payload truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
}

pub trait CrdtCodec<K, S>: Clone + Send + Sync + 'static {
    fn encode_record(&self, record: &Record<K, S>) -> Result<Vec<u8>, CodecError>;

    fn decode_record(&self, bytes: &[u8]) -> Result<Record<K, S>, CodecError>;

    fn encode_key(&self, key: &K) -> Result<Vec<u8>, CodecError>;

    fn decode_key(&self, bytes: &[u8]) -> Result<K, CodecError>;
}

/// Tombstones travel as an 8-byte stamp followed by the encoded key.
pub fn encode_tombstone<K, S, C>(
    codec: &C,
    tombstone: &Tombstone<K>,
) -> Result<Vec<u8>, CodecError>
where
    C: CrdtCodec<K, S>,
{
    let key = codec.encode_key(&tombstone.key)?;
    let mut out = Vec::with_capacity(8 + key.len());
    out.extend_from_slice(&tombstone.stamp.get().to_le_bytes());
    out.extend_from_slice(&key);
    Ok(out)
}

pub fn decode_tombstone<K, S, C>(codec: &C, bytes: &[u8]) -> Result<Tombstone<K>, CodecError>
where
    C: CrdtCodec<K, S>,
{
    if bytes.len() < 8 {
        return Err(CodecError::Truncated {
            need: 8,
            got: bytes.len(),
        });
    }
    let mut stamp = [0u8; 8];
    stamp.copy_from_slice(&bytes[..8]);
    let key = codec.decode_key(&bytes[8..])?;
    Ok(Tombstone::new(key, Stamp::new(u64::from_le_bytes(stamp))))
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl<K, S> CrdtCodec<K, S> for JsonCodec
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode_record(&self, record: &Record<K, S>) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(record).map_err(|err| CodecError::Encode(Box::new(err)))
    }

    fn decode_record(&self, bytes: &[u8]) -> Result<Record<K, S>, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Decode(Box::new(err)))
    }

    fn encode_key(&self, key: &K) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(key).map_err(|err| CodecError::Encode(Box::new(err)))
    }

    fn decode_key(&self, bytes: &[u8]) -> Result<K, CodecError> {
        serde_json::from_slice(bytes).map_err(|err| CodecError::Decode(Box::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::GSet;

    #[test]
    fn record_round_trip() {
        let codec = JsonCodec;
        let record = Record::new(7i64, GSet::of([1, 2, 3]), Stamp::new(42));
        let bytes = codec.encode_record(&record).unwrap();
        let decoded: Record<i64, GSet<i32>> = codec.decode_record(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn tombstone_round_trip() {
        let codec = JsonCodec;
        let tomb = Tombstone::new("k".to_string(), Stamp::new(9));
        let bytes = encode_tombstone::<_, GSet<i32>, _>(&codec, &tomb).unwrap();
        let decoded = decode_tombstone::<String, GSet<i32>, _>(&codec, &bytes).unwrap();
        assert_eq!(decoded, tomb);
    }

    #[test]
    fn truncated_tombstone_is_rejected() {
        let codec = JsonCodec;
        let err = decode_tombstone::<String, GSet<i32>, _>(&codec, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }
}
