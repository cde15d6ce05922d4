//! Value codec for the root-transaction index (spec §6): a CDB64 file keyed
//! by `data_root` whose values are MessagePack-encoded with compact field
//! names. Two shapes share one struct — `root_data_item_offset`/
//! `root_data_offset` are only present for bundled data items.

use common::error::AppError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootTxRecord {
    #[serde(rename = "r", with = "serde_bytes")]
    pub root_tx_id: [u8; 32],
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub root_data_item_offset: Option<u64>,
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub root_data_offset: Option<u64>,
}

impl RootTxRecord {
    /// The simple shape: just a root transaction id, no bundle offsets.
    pub fn simple(root_tx_id: [u8; 32]) -> Self {
        Self {
            root_tx_id,
            root_data_item_offset: None,
            root_data_offset: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, AppError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AppError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_shape_round_trips() {
        let record = RootTxRecord::simple([7u8; 32]);
        let bytes = record.encode().expect("encode");
        assert_eq!(RootTxRecord::decode(&bytes).expect("decode"), record);
    }

    #[test]
    fn complete_shape_round_trips_with_bundle_offsets() {
        let record = RootTxRecord {
            root_tx_id: [9u8; 32],
            root_data_item_offset: Some(4096),
            root_data_offset: Some(128),
        };
        let bytes = record.encode().expect("encode");
        assert_eq!(RootTxRecord::decode(&bytes).expect("decode"), record);
    }

    #[test]
    fn a_truncated_buffer_is_a_decode_error_not_a_panic() {
        let record = RootTxRecord::simple([1u8; 32]);
        let bytes = record.encode().expect("encode");
        let truncated = &bytes[..bytes.len() / 2];
        assert!(RootTxRecord::decode(truncated).is_err());
    }
}
