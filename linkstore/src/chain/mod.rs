// Appending to and verifying per-partition record chains

use crate::error::Result;
use crate::hash;
use crate::objects::OLDEST_FIRST;
use crate::record::{Expr, QueryParams, Record};
use crate::store::Store;
use rusqlite::types::Value;
use thiserror::Error;

/// Where and how a chain failed verification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("chain broken at record {index} ({id}): {kind}")]
pub struct ChainBreak {
    pub index: usize,
    pub id: String,
    pub kind: BreakKind,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BreakKind {
    #[error("content hash does not match the record's fields")]
    ContentHash,
    #[error("prev_hash does not match the previous record's hash")]
    PrevHash,
    #[error("peer_hash does not link to the next record")]
    PeerHash,
}

fn partition_filter(partition_id: &str) -> Record {
    Record::with_params(QueryParams {
        expr: Some(Expr::new(
            "partition_id = ?",
            vec![Value::Text(partition_id.to_string())],
        )),
        ..Default::default()
    })
}

/// Append `record` to the chain of its partition in one transaction.
///
/// The record's `prev_hash` is set to the newest record's hash and that
/// record's `peer_hash` is pointed at the new one.
pub fn append(store: &Store, mut record: Record) -> Result<Record> {
    store.transact(true, |db, _commit, _rollback| -> Result<()> {
        let prev = match db.get_last(&partition_filter(&record.partition_id), &[]) {
            Ok(prev) => Some(prev),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        record.prev_hash = prev.as_ref().map(|p| p.hash.clone()).unwrap_or_default();
        record.init().compute_hash();
        db.create(&mut record, &[])?;

        if let Some(mut prev) = prev {
            prev.compute_peer_hash(&record.hash)?;
            db.update_peer_hash(&prev, &prev.peer_hash, &[])?;
        }
        Ok(())
    })?;
    log::debug!(
        "Appended {} to partition '{}'",
        record.id,
        record.partition_id
    );
    Ok(record)
}

/// All records of a partition in creation order.
pub fn load(store: &Store, partition_id: &str) -> Result<Vec<Record>> {
    let mut filter = partition_filter(partition_id);
    filter.query_params.order_by = Some(OLDEST_FIRST.to_string());
    store.get_all(&filter, &[])
}

/// Check a chain given oldest first.
pub fn verify(records: &[Record]) -> std::result::Result<(), ChainBreak> {
    let brk = |index: usize, kind: BreakKind| ChainBreak {
        index,
        id: records[index].id.clone(),
        kind,
    };

    for (i, rec) in records.iter().enumerate() {
        if hash::content_hash(rec) != rec.hash {
            return Err(brk(i, BreakKind::ContentHash));
        }
        if i == 0 {
            continue;
        }
        let prev = &records[i - 1];
        if rec.prev_hash != prev.hash {
            return Err(brk(i, BreakKind::PrevHash));
        }
        if prev.peer_hash != hash::peer_hash(&prev.hash, &rec.hash) {
            return Err(brk(i - 1, BreakKind::PeerHash));
        }
    }
    Ok(())
}

/// Load a partition and verify it.
pub fn verify_partition(store: &Store, partition_id: &str) -> Result<usize> {
    let records = load(store, partition_id)?;
    verify(&records)?;
    Ok(records.len())
}
