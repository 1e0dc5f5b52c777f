//! Key layout and row encoding for the sled trees.
//!
//! Rows are bincode; keys are big-endian so that sled's byte ordering
//! matches numeric ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{CoordError, Result};
use crate::model::{Product, ProductId, ProductState};

pub(crate) const EMPTY: &[u8] = &[];

/// Separates the state tag from the ordering suffix in `states` keys.
/// Never appears in UTF-8 text.
const STATE_SEPARATOR: u8 = 0xFF;

/// One entry of an adjacency list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Edge {
    pub peer: ProductId,
    pub role: String,
}

impl Edge {
    pub fn new(peer: ProductId, role: &str) -> Self {
        Self {
            peer,
            role: role.to_string(),
        }
    }
}

pub(crate) fn id_key(id: ProductId) -> [u8; 8] {
    id.to_be_bytes()
}

pub(crate) fn decode_id(raw: &[u8]) -> Result<ProductId> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| CoordError::storage(format!("malformed id key of {} bytes", raw.len())))?;
    Ok(ProductId::from_be_bytes(bytes))
}

fn ts_bytes(ts: DateTime<Utc>) -> [u8; 8] {
    // flip the sign bit so pre-epoch instants still sort first
    ((ts.timestamp_micros() as u64) ^ (1u64 << 63)).to_be_bytes()
}

pub(crate) fn state_prefix(state: &ProductState) -> Vec<u8> {
    let mut key = state.as_str().as_bytes().to_vec();
    key.push(STATE_SEPARATOR);
    key
}

/// `state ‖ 0xFF ‖ updated_at ‖ id`: oldest first within a state
pub(crate) fn state_key(state: &ProductState, ts: DateTime<Utc>, id: ProductId) -> Vec<u8> {
    let mut key = state_prefix(state);
    key.extend_from_slice(&ts_bytes(ts));
    key.extend_from_slice(&id_key(id));
    key
}

pub(crate) fn id_from_state_key(key: &[u8]) -> Result<ProductId> {
    if key.len() < 17 {
        return Err(CoordError::storage("malformed state index key"));
    }
    decode_id(&key[key.len() - 8..])
}

pub(crate) fn encode_product(product: &Product) -> Result<Vec<u8>> {
    Ok(bincode::serialize(product)?)
}

pub(crate) fn decode_product(raw: &[u8]) -> Result<Product> {
    Ok(bincode::deserialize(raw)?)
}

pub(crate) fn encode_edges(edges: &[Edge]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(edges)?)
}

pub(crate) fn decode_edges(raw: &[u8]) -> Result<Vec<Edge>> {
    Ok(bincode::deserialize(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_state_keys_sort_by_time_then_id() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = t0 + Duration::milliseconds(1);
        let a = state_key(&ProductState::Waiting, t1, 1);
        let b = state_key(&ProductState::Waiting, t0, 9);
        let c = state_key(&ProductState::Waiting, t0, 10);
        assert!(b < c);
        assert!(c < a);
        assert_eq!(id_from_state_key(&a).unwrap(), 1);
    }

    #[test]
    fn test_state_prefix_does_not_collide() {
        let error = state_prefix(&ProductState::Error);
        let other = state_key(&ProductState::Other("errored".into()), Utc::now(), 3);
        assert!(!other.starts_with(&error));
    }

    #[test]
    fn test_row_round_trip_keeps_unknown_state() {
        let product = Product {
            id: 7,
            pid: "http://example.org/D20240101T000000_IFCB101".into(),
            state: ProductState::Other("stitching".into()),
            event: Some("heartbeat".into()),
            message: None,
            updated_at: Utc::now(),
        };
        let decoded = decode_product(&encode_product(&product).unwrap()).unwrap();
        assert_eq!(decoded, product);
    }

    #[test]
    fn test_decode_id_rejects_short_keys() {
        assert!(decode_id(&[1, 2, 3]).is_err());
    }
}
