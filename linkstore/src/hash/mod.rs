// Content and peer hashing for records

use crate::record::Record;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Separator placed between a record hash and the next hash when linking.
pub const PEER_SEPARATOR: &str = "/";

/// The stable fields of a record, in the fixed order they are hashed.
/// `hash`, `peer_hash` and the query parameters are never part of it.
#[derive(Serialize)]
struct HashInput<'a> {
    id: &'a str,
    creator_id: &'a str,
    owner_id: &'a str,
    partition_id: &'a str,
    key: &'a str,
    value: &'a str,
    prev_hash: &'a str,
    timestamp: i64,
}

/// Lowercase hex SHA-256 of a string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compute the content hash of a record from its stable fields.
pub fn content_hash(record: &Record) -> String {
    let input = HashInput {
        id: &record.id,
        creator_id: &record.creator_id,
        owner_id: &record.owner_id,
        partition_id: &record.partition_id,
        key: &record.key,
        value: &record.value,
        prev_hash: &record.prev_hash,
        timestamp: record.timestamp,
    };
    // Serializing borrowed strings and an integer into a Vec cannot fail.
    let canonical = serde_json::to_string(&input).unwrap_or_default();
    sha256_hex(&canonical)
}

/// Link a record hash to the hash of the record that follows it.
pub fn peer_hash(hash: &str, next_hash: &str) -> String {
    sha256_hex(&format!("{hash}{PEER_SEPARATOR}{next_hash}"))
}
