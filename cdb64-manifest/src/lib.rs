//! CDB64 partition manifest (spec §4.B): a JSON descriptor mapping 256
//! key-prefix partitions to shard locations, plus the routing helpers a
//! sharded reader uses to pick a partition for a given key.

use std::collections::HashSet;

use cdb64::{cdb_hash, hash::table_index};
use chrono::{DateTime, Utc};
use common::error::AppError;
use serde::{Deserialize, Serialize};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Location {
    File { filename: String },
    Http { url: String },
    ArweaveTx { tx_id: String },
    ArweaveBundleItem { tx_id: String, offset: i64, size: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub prefix: String,
    pub location: Location,
    pub record_count: u64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub total_records: u64,
    pub partitions: Vec<Partition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Manifest {
    /// `getPartitionPrefix(key)` + lookup, combined (spec §4.C uses this).
    pub fn find_partition(&self, key: &[u8]) -> Option<&Partition> {
        let prefix = get_partition_prefix(key);
        self.partitions.iter().find(|p| p.prefix == prefix)
    }
}

/// Deserializes and validates a manifest. Unknown top-level fields are
/// silently dropped by `serde_json`'s default behavior.
pub fn parse_manifest(json: &str) -> Result<Manifest, AppError> {
    let manifest: Manifest = serde_json::from_str(json)?;
    if !validate_manifest(&manifest) {
        return Err(AppError::Validation("invalid cdb64 manifest".to_string()));
    }
    Ok(manifest)
}

pub fn serialize_manifest(manifest: &Manifest) -> Result<String, AppError> {
    Ok(serde_json::to_string(manifest)?)
}

pub fn validate_manifest(manifest: &Manifest) -> bool {
    if manifest.version != MANIFEST_VERSION {
        return false;
    }

    let mut seen_prefixes = HashSet::new();
    for partition in &manifest.partitions {
        if !is_lowercase_hex_prefix(&partition.prefix) {
            return false;
        }
        if !seen_prefixes.insert(partition.prefix.clone()) {
            return false;
        }
        if partition.size == 0 {
            return false;
        }
        if let Location::ArweaveBundleItem { offset, size, .. } = &partition.location {
            if *offset < 0 || *size <= 0 {
                return false;
            }
        }
    }

    true
}

pub fn create_empty_manifest(metadata: Option<serde_json::Value>) -> Manifest {
    Manifest {
        version: MANIFEST_VERSION,
        created_at: Utc::now(),
        total_records: 0,
        partitions: Vec::new(),
        metadata,
    }
}

fn is_lowercase_hex_prefix(prefix: &str) -> bool {
    prefix.len() == 2
        && prefix
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Partition index for `key`, sharing the CDB64 header's hash scheme (the
/// low byte of `cdb_hash`) so prefix routing and shard lookup agree on one
/// implementation of "which bucket does this key fall into".
pub fn get_partition_index(key: &[u8]) -> u8 {
    table_index(cdb_hash(key)) as u8
}

pub fn get_partition_prefix(key: &[u8]) -> String {
    index_to_prefix(get_partition_index(key))
}

pub fn index_to_prefix(index: u8) -> String {
    format!("{index:02x}")
}

pub fn prefix_to_index(prefix: &str) -> Result<u8, AppError> {
    if !is_lowercase_hex_prefix(prefix) {
        return Err(AppError::Validation(format!(
            "invalid partition prefix: {prefix}"
        )));
    }
    u8::from_str_radix(prefix, 16)
        .map_err(|e| AppError::Validation(format!("invalid partition prefix {prefix}: {e}")))
}
